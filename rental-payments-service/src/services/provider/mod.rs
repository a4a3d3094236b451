//! Invoice provider abstractions and implementations.
//!
//! The lifecycle manager only reaches the remote invoicing system through
//! [`InvoiceProvider`]. `square` talks to the Square REST API; `mock` is an
//! in-process stand-in for local runs and tests.

pub mod mock;
pub mod square;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{DeliveryMethod, Order, Payment};

pub use mock::MockInvoiceProvider;
pub use square::SquareInvoiceProvider;

/// Header carrying the Square webhook signature.
pub const SQUARE_SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

/// Error type for provider operations.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid webhook signature: {0}")]
    Signature(String),
}

/// Remote invoice state as reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Draft,
    Unpaid,
    Scheduled,
    PartiallyPaid,
    Paid,
    PartiallyRefunded,
    Refunded,
    Canceled,
    Failed,
    PaymentPending,
    Other(String),
}

impl RemoteStatus {
    pub fn as_str(&self) -> &str {
        match self {
            RemoteStatus::Draft => "DRAFT",
            RemoteStatus::Unpaid => "UNPAID",
            RemoteStatus::Scheduled => "SCHEDULED",
            RemoteStatus::PartiallyPaid => "PARTIALLY_PAID",
            RemoteStatus::Paid => "PAID",
            RemoteStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
            RemoteStatus::Refunded => "REFUNDED",
            RemoteStatus::Canceled => "CANCELED",
            RemoteStatus::Failed => "FAILED",
            RemoteStatus::PaymentPending => "PAYMENT_PENDING",
            RemoteStatus::Other(other) => other,
        }
    }

    pub fn from_provider(status: &str) -> Self {
        match status {
            "DRAFT" => RemoteStatus::Draft,
            "UNPAID" => RemoteStatus::Unpaid,
            "SCHEDULED" => RemoteStatus::Scheduled,
            "PARTIALLY_PAID" => RemoteStatus::PartiallyPaid,
            "PAID" => RemoteStatus::Paid,
            "PARTIALLY_REFUNDED" => RemoteStatus::PartiallyRefunded,
            "REFUNDED" => RemoteStatus::Refunded,
            "CANCELED" => RemoteStatus::Canceled,
            "FAILED" => RemoteStatus::Failed,
            "PAYMENT_PENDING" => RemoteStatus::PaymentPending,
            other => RemoteStatus::Other(other.to_string()),
        }
    }

    /// The invoice is live and visible to the customer.
    pub fn is_published(&self) -> bool {
        matches!(
            self,
            RemoteStatus::Unpaid
                | RemoteStatus::PartiallyPaid
                | RemoteStatus::PaymentPending
                | RemoteStatus::Paid
        )
    }
}

impl Serialize for RemoteStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Options for creating a remote invoice.
#[derive(Debug, Clone)]
pub struct CreateInvoiceOptions {
    pub delivery_method: DeliveryMethod,
    pub due_date: NaiveDate,
    pub title: Option<String>,
    pub message: Option<String>,
    /// Repeating a create with the same key returns the same invoice.
    pub idempotency_key: String,
}

/// A freshly created remote invoice.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteInvoice {
    pub external_id: String,
    pub version: i32,
    pub status: RemoteStatus,
    pub public_url: Option<String>,
    pub customer_id: Option<String>,
    pub order_id: Option<String>,
    pub location_id: Option<String>,
}

/// Snapshot of a remote invoice after a send, cancel or fetch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteInvoiceStatus {
    pub external_id: String,
    pub status: RemoteStatus,
    pub version: Option<i32>,
    pub public_url: Option<String>,
    /// Cumulative amount collected, in cents.
    pub paid_amount: Option<i64>,
}

/// A webhook whose signature has been verified. The payload is not yet
/// interpreted; see `services::webhook`.
#[derive(Debug, Clone)]
pub struct ParsedWebhook {
    pub source: &'static str,
    pub event_id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait InvoiceProvider: Send + Sync {
    /// Short identifier stored as the webhook event source.
    fn name(&self) -> &'static str;

    async fn create_invoice(
        &self,
        payment: &Payment,
        order: &Order,
        options: &CreateInvoiceOptions,
    ) -> Result<RemoteInvoice, ProviderError>;

    /// Publish the invoice so the customer can pay it.
    async fn send_invoice(&self, external_id: &str) -> Result<RemoteInvoiceStatus, ProviderError>;

    async fn get_invoice_status(
        &self,
        external_id: &str,
    ) -> Result<RemoteInvoiceStatus, ProviderError>;

    async fn cancel_invoice(
        &self,
        external_id: &str,
        reason: Option<&str>,
    ) -> Result<RemoteInvoiceStatus, ProviderError>;

    /// Authenticate a raw callback body and extract its envelope.
    fn verify_and_parse_webhook(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<ParsedWebhook, ProviderError>;
}

/// Envelope fields shared by every Square webhook body.
#[derive(Debug, Deserialize)]
struct Envelope {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
}

/// Extract the envelope of an already-authenticated body.
pub(crate) fn parse_envelope(
    source: &'static str,
    raw_body: &[u8],
) -> Result<ParsedWebhook, ProviderError> {
    let payload: serde_json::Value = serde_json::from_slice(raw_body)
        .map_err(|e| ProviderError::InvalidRequest(format!("webhook body is not JSON: {}", e)))?;
    let envelope: Envelope = serde_json::from_value(payload.clone())
        .map_err(|e| ProviderError::InvalidRequest(format!("webhook envelope: {}", e)))?;
    if envelope.event_id.trim().is_empty() {
        return Err(ProviderError::InvalidRequest(
            "webhook event_id is empty".to_string(),
        ));
    }
    Ok(ParsedWebhook {
        source,
        event_id: envelope.event_id,
        event_type: envelope.event_type,
        payload,
    })
}

/// Square signs `notification_url + body` with HMAC-SHA256 and base64-encodes it.
pub(crate) fn verify_square_signature(
    signature_key: &str,
    notification_url: &str,
    raw_body: &[u8],
    signature: Option<&str>,
) -> Result<(), ProviderError> {
    let signature = signature
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ProviderError::Signature("missing signature header".to_string()))?;
    let body = std::str::from_utf8(raw_body)
        .map_err(|_| ProviderError::Signature("body is not UTF-8".to_string()))?;

    let signed = format!("{}{}", notification_url, body);
    let valid = service_core::utils::signature::verify_hmac_sha256_base64(
        signature_key,
        &signed,
        signature,
    )
    .map_err(|e| ProviderError::Signature(e.to_string()))?;

    if valid {
        Ok(())
    } else {
        Err(ProviderError::Signature("signature mismatch".to_string()))
    }
}
