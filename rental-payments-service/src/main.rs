use rental_payments_service::config::Config;
use rental_payments_service::services::init_metrics;
use rental_payments_service::startup::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {:#}", e);
        std::io::Error::other(format!("Configuration error: {}", e))
    })?;

    init_tracing(
        &config.service_name,
        &config.observability.log_level,
        config.observability.otlp_endpoint.as_deref(),
    )
    .map_err(|e| std::io::Error::other(format!("Tracing error: {}", e)))?;

    init_metrics();

    let service_span = tracing::info_span!(
        "service",
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
    );
    let _guard = service_span.enter();

    tracing::info!(address = %config.bind_address(), "Starting rental-payments-service");

    let app = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to build application: {}", e);
        std::io::Error::other(e.to_string())
    })?;

    app.run_until_stopped().await?;

    tracing::info!("Service shutdown complete");
    Ok(())
}
