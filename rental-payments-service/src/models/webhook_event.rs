//! Webhook event log: every verified provider callback, raw and processed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    pub enum WebhookEventStatus {
        Pending => "PENDING",
        Processed => "PROCESSED",
        Failed => "FAILED",
        Ignored => "IGNORED",
    }
}

/// Stored webhook event. `event_id` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentWebhookEvent {
    pub id: Uuid,
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    pub raw_payload: serde_json::Value,
    pub status: WebhookEventStatus,
    pub payment_id: Option<Uuid>,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewWebhookEvent {
    pub event_id: String,
    pub event_type: String,
    pub source: String,
    pub raw_payload: serde_json::Value,
}
