//! Typed view of provider webhook payloads.
//!
//! Each known `type` has a narrow parser that validates exactly the fields
//! the lifecycle needs. Anything else is [`WebhookEvent::Unknown`] and is
//! stored as IGNORED.

use serde::Deserialize;
use thiserror::Error;

use crate::services::provider::ParsedWebhook;

pub const INVOICE_PUBLISHED: &str = "invoice.published";
pub const INVOICE_VIEWED: &str = "invoice.viewed";
pub const INVOICE_PAYMENT_MADE: &str = "invoice.payment_made";
pub const INVOICE_CANCELED: &str = "invoice.canceled";
pub const INVOICE_CHARGE_FAILED: &str = "invoice.scheduled_charge_failed";
pub const REFUND_CREATED: &str = "refund.created";
pub const REFUND_UPDATED: &str = "refund.updated";

#[derive(Debug, Error, PartialEq, Eq)]
#[error("malformed '{event_type}' payload: {message}")]
pub struct WebhookParseError {
    pub event_type: String,
    pub message: String,
}

/// The invoice fields carried by every `invoice.*` event.
#[derive(Debug, Clone, PartialEq)]
pub struct InvoiceSnapshot {
    pub invoice_id: String,
    pub version: Option<i32>,
    pub status: Option<String>,
    pub public_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    Published(InvoiceSnapshot),
    Viewed(InvoiceSnapshot),
    PaymentMade {
        invoice: InvoiceSnapshot,
        /// Cumulative amount collected on the invoice, in cents.
        paid_to_date: i64,
    },
    Canceled(InvoiceSnapshot),
    ChargeFailed(InvoiceSnapshot),
    Refunded {
        refund_id: String,
        order_id: String,
        /// Provider payment the refund was issued against.
        payment_id: Option<String>,
        amount: i64,
        status: String,
    },
    Unknown {
        event_type: String,
    },
}

impl WebhookEvent {
    /// Provider invoice id the event is about, if it is an invoice event.
    pub fn invoice_id(&self) -> Option<&str> {
        match self {
            WebhookEvent::Published(invoice)
            | WebhookEvent::Viewed(invoice)
            | WebhookEvent::Canceled(invoice)
            | WebhookEvent::ChargeFailed(invoice)
            | WebhookEvent::PaymentMade { invoice, .. } => Some(&invoice.invoice_id),
            WebhookEvent::Refunded { .. } | WebhookEvent::Unknown { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Data<T> {
    object: T,
}

#[derive(Debug, Deserialize)]
struct Body<T> {
    data: Data<T>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    invoice: SquareInvoice,
}

#[derive(Debug, Deserialize)]
struct RefundObject {
    refund: SquareRefund,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Money {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PaymentRequest {
    pub total_completed_amount_money: Option<Money>,
}

/// Invoice object shared by webhook bodies and REST responses.
#[derive(Debug, Deserialize)]
pub(crate) struct SquareInvoice {
    pub id: String,
    pub version: Option<i32>,
    pub status: Option<String>,
    pub public_url: Option<String>,
    pub order_id: Option<String>,
    pub location_id: Option<String>,
    #[serde(default)]
    pub payment_requests: Vec<PaymentRequest>,
    pub primary_recipient: Option<Recipient>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Recipient {
    pub customer_id: Option<String>,
}

impl SquareInvoice {
    /// Sum of completed amounts over all payment requests.
    pub fn paid_to_date(&self) -> Option<i64> {
        let amounts: Vec<i64> = self
            .payment_requests
            .iter()
            .filter_map(|r| r.total_completed_amount_money.as_ref().map(|m| m.amount))
            .collect();
        if amounts.is_empty() {
            None
        } else {
            Some(amounts.iter().sum())
        }
    }

    fn snapshot(&self) -> InvoiceSnapshot {
        InvoiceSnapshot {
            invoice_id: self.id.clone(),
            version: self.version,
            status: self.status.clone(),
            public_url: self.public_url.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SquareRefund {
    id: String,
    status: String,
    amount_money: Money,
    order_id: Option<String>,
    payment_id: Option<String>,
}

fn object<T: serde::de::DeserializeOwned>(webhook: &ParsedWebhook) -> Result<T, WebhookParseError> {
    serde_json::from_value::<Body<T>>(webhook.payload.clone())
        .map(|body| body.data.object)
        .map_err(|e| WebhookParseError {
            event_type: webhook.event_type.clone(),
            message: e.to_string(),
        })
}

fn invalid(webhook: &ParsedWebhook, message: &str) -> WebhookParseError {
    WebhookParseError {
        event_type: webhook.event_type.clone(),
        message: message.to_string(),
    }
}

/// Interpret a verified webhook.
pub fn parse_event(webhook: &ParsedWebhook) -> Result<WebhookEvent, WebhookParseError> {
    let invoice = || -> Result<SquareInvoice, WebhookParseError> {
        let invoice = object::<InvoiceObject>(webhook)?.invoice;
        if invoice.id.trim().is_empty() {
            return Err(invalid(webhook, "invoice id is empty"));
        }
        Ok(invoice)
    };

    match webhook.event_type.as_str() {
        INVOICE_PUBLISHED => Ok(WebhookEvent::Published(invoice()?.snapshot())),
        INVOICE_VIEWED => Ok(WebhookEvent::Viewed(invoice()?.snapshot())),
        INVOICE_CANCELED => Ok(WebhookEvent::Canceled(invoice()?.snapshot())),
        INVOICE_CHARGE_FAILED => Ok(WebhookEvent::ChargeFailed(invoice()?.snapshot())),
        INVOICE_PAYMENT_MADE => {
            let invoice = invoice()?;
            let paid_to_date = invoice
                .paid_to_date()
                .ok_or_else(|| invalid(webhook, "no completed amount on payment requests"))?;
            if paid_to_date < 0 {
                return Err(invalid(webhook, "completed amount is negative"));
            }
            Ok(WebhookEvent::PaymentMade {
                invoice: invoice.snapshot(),
                paid_to_date,
            })
        }
        REFUND_CREATED | REFUND_UPDATED => {
            let refund = object::<RefundObject>(webhook)?.refund;
            let order_id = refund
                .order_id
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| invalid(webhook, "refund has no order id"))?;
            if refund.amount_money.amount <= 0 {
                return Err(invalid(webhook, "refund amount must be positive"));
            }
            Ok(WebhookEvent::Refunded {
                refund_id: refund.id,
                order_id,
                payment_id: refund.payment_id.filter(|id| !id.trim().is_empty()),
                amount: refund.amount_money.amount,
                status: refund.status,
            })
        }
        other => Ok(WebhookEvent::Unknown {
            event_type: other.to_string(),
        }),
    }
}
