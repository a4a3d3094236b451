//! Application startup and lifecycle management.

use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use service_core::middleware::{metrics::metrics_middleware, tracing::request_id_middleware};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, ProviderBackend, StoreBackend};
use crate::handlers::{health, invoices, payments, webhooks};
use crate::services::{
    InvoiceProvider, LedgerStore, MemoryLedgerStore, MemoryOrderSource, MockInvoiceProvider,
    OrderSource, PaymentLifecycleManager, PgLedgerStore, PgOrderSource, SquareInvoiceProvider,
};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<PaymentLifecycleManager>,
}

/// The pluggable parts behind the manager.
pub struct Components {
    pub store: Arc<dyn LedgerStore>,
    pub orders: Arc<dyn OrderSource>,
    pub provider: Arc<dyn InvoiceProvider>,
}

impl Components {
    /// Wire the store, order source and provider selected by `config`.
    pub async fn from_config(config: &Config) -> Result<Self, AppError> {
        let (store, orders): (Arc<dyn LedgerStore>, Arc<dyn OrderSource>) = match config.store {
            StoreBackend::Postgres => {
                let database = config.database.as_ref().ok_or_else(|| {
                    AppError::ConfigError(anyhow::anyhow!(
                        "DATABASE_URL is required for the postgres store"
                    ))
                })?;
                let store = PgLedgerStore::connect(
                    database.url.expose_secret(),
                    database.max_connections,
                    database.min_connections,
                )
                .await
                .map_err(|e| {
                    tracing::error!("Failed to connect to PostgreSQL: {}", e);
                    AppError::DatabaseError(anyhow::anyhow!(e))
                })?;
                if database.run_migrations {
                    store.run_migrations().await.map_err(|e| {
                        tracing::error!("Failed to run migrations: {}", e);
                        AppError::DatabaseError(anyhow::anyhow!(e))
                    })?;
                }
                let orders = PgOrderSource::new(store.pool().clone());
                (Arc::new(store), Arc::new(orders))
            }
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory ledger store; data is lost on restart");
                (
                    Arc::new(MemoryLedgerStore::new()),
                    Arc::new(MemoryOrderSource::new()),
                )
            }
        };

        let provider: Arc<dyn InvoiceProvider> = match config.provider {
            ProviderBackend::Square => {
                let provider = SquareInvoiceProvider::new(config.square.clone());
                if provider.is_configured() {
                    tracing::info!("Square invoice provider initialized");
                } else {
                    tracing::warn!("Square credentials missing; invoice calls will fail");
                }
                Arc::new(provider)
            }
            ProviderBackend::Mock => {
                tracing::info!("Using mock invoice provider");
                Arc::new(MockInvoiceProvider::new(
                    config.square.webhook_signature_key.expose_secret().clone(),
                    config.square.webhook_notification_url.clone(),
                ))
            }
        };

        Ok(Self {
            store,
            orders,
            provider,
        })
    }
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-request-id"),
        ]);
    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!("Invalid CORS origin '{}': {}. Skipping.", origin, e);
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

pub fn build_router(state: AppState, allowed_origins: &[String]) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .route("/metrics", get(health::metrics_endpoint))
        .route("/invoices", post(invoices::create_invoice))
        .route("/invoices/:order_id", axum::routing::delete(invoices::cancel_invoice))
        .route("/invoices/:order_id/status", get(invoices::invoice_status))
        .route("/invoices/:order_id/send", post(invoices::send_invoice))
        .route("/invoices/:order_id/refresh", post(invoices::refresh_invoice))
        .route("/payments", get(payments::list_payments))
        .route("/payments/overdue-sweep", post(payments::overdue_sweep))
        .route("/payments/:payment_id", get(payments::get_payment))
        .route(
            "/payments/:payment_id/transactions",
            post(payments::record_transaction),
        )
        .route(
            "/payments/:payment_id/reminders",
            post(payments::schedule_reminder),
        )
        .route("/webhooks/square", post(webhooks::square_webhook))
        .with_state(state)
        .layer(from_fn(metrics_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .layer(cors_layer(allowed_origins))
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    state: AppState,
}

impl Application {
    /// Build the application with the backends selected by `config`.
    pub async fn build(config: Config) -> Result<Self, AppError> {
        let components = Components::from_config(&config).await?;
        Self::build_with(config, components).await
    }

    /// Build around already constructed components (port 0 binds a random port).
    pub async fn build_with(config: Config, components: Components) -> Result<Self, AppError> {
        let manager = Arc::new(PaymentLifecycleManager::new(
            components.store,
            components.orders,
            components.provider,
            config.billing.clone(),
        ));
        let state = AppState { manager };

        let address = config.bind_address();
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            tracing::error!("Failed to bind listener to {}: {}", address, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        let router = build_router(state.clone(), &config.server.allowed_origins);
        tracing::info!(port, store = ?config.store, provider = ?config.provider, "rental-payments-service ready");

        Ok(Self {
            port,
            listener,
            router,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown_signal())
            .await
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received SIGINT, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
