use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use super::payments::PaymentResponse;
use crate::models::{cents_to_display, DeliveryMethod, PaymentMethod};
use crate::services::manager::PaymentWithRemote;
use crate::services::provider::RemoteInvoiceStatus;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceRequest {
    pub order_id: Uuid,
    pub due_date: Option<NaiveDate>,
    /// When set, the invoice is published right after it is created.
    pub delivery_method: Option<DeliveryMethod>,
    #[validate(length(max = 1000, message = "message must be at most 1000 characters"))]
    pub message: Option<String>,
    pub custom_fields: Option<serde_json::Value>,
    pub method: Option<PaymentMethod>,
    #[validate(length(max = 2000, message = "notes must be at most 2000 characters"))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SendInvoiceRequest {
    pub delivery_method: DeliveryMethod,
    #[validate(length(max = 1000, message = "message must be at most 1000 characters"))]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CancelInvoiceRequest {
    #[validate(length(max = 500, message = "reason must be at most 500 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteInvoiceResponse {
    pub external_id: String,
    pub status: String,
    pub version: Option<i32>,
    pub public_url: Option<String>,
    pub paid_amount: Option<i64>,
    pub paid_amount_display: Option<String>,
}

impl From<RemoteInvoiceStatus> for RemoteInvoiceResponse {
    fn from(remote: RemoteInvoiceStatus) -> Self {
        Self {
            external_id: remote.external_id,
            status: remote.status.as_str().to_string(),
            version: remote.version,
            public_url: remote.public_url,
            paid_amount: remote.paid_amount,
            paid_amount_display: remote.paid_amount.map(cents_to_display),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceResponse {
    pub payment: PaymentResponse,
    pub remote_invoice: Option<RemoteInvoiceResponse>,
}

impl From<PaymentWithRemote> for InvoiceResponse {
    fn from(value: PaymentWithRemote) -> Self {
        Self {
            payment: value.payment.into(),
            remote_invoice: value.remote.map(Into::into),
        }
    }
}
