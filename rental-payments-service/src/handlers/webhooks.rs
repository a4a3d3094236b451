use axum::{body::Bytes, extract::State, http::HeaderMap, http::StatusCode, Json};
use service_core::error::AppError;
use service_core::middleware::tracing::request_id;

use crate::dtos::WebhookResponse;
use crate::services::manager::WebhookOutcome;
use crate::services::metrics::WEBHOOK_EVENTS_TOTAL;
use crate::services::provider::SQUARE_SIGNATURE_HEADER;
use crate::services::PaymentError;
use crate::startup::AppState;

/// Square callback. The raw body is verified before anything is parsed or
/// stored. FAILED outcomes answer 500 so the provider re-delivers.
#[tracing::instrument(skip(state, headers, body), fields(body_len = body.len(), request_id = %request_id(&headers)))]
pub async fn square_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<WebhookResponse>), AppError> {
    let signature = headers
        .get(SQUARE_SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());

    let webhook = state
        .manager
        .provider()
        .verify_and_parse_webhook(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected webhook");
            WEBHOOK_EVENTS_TOTAL
                .with_label_values(&["unverified", "rejected"])
                .inc();
            PaymentError::Adapter(e)
        })?;

    let outcome = state.manager.apply_webhook_event(webhook).await;
    let status = match outcome {
        WebhookOutcome::Failed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::OK,
    };
    Ok((status, Json(WebhookResponse::from(&outcome))))
}
