use serde::Serialize;
use uuid::Uuid;

use crate::models::PaymentStatus;
use crate::services::manager::WebhookOutcome;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<PaymentStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl From<&WebhookOutcome> for WebhookResponse {
    fn from(outcome: &WebhookOutcome) -> Self {
        let (payment_id, status, reason) = match outcome {
            WebhookOutcome::Processed { payment_id, status } => {
                (Some(*payment_id), Some(*status), None)
            }
            WebhookOutcome::Duplicate => (None, None, None),
            WebhookOutcome::Ignored { payment_id, reason } => {
                (*payment_id, None, Some(reason.clone()))
            }
            WebhookOutcome::Failed { reason } => (None, None, Some(reason.clone())),
        };
        Self {
            outcome: outcome.label(),
            payment_id,
            status,
            reason,
        }
    }
}
