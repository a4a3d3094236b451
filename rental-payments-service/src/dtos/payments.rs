use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{
    cents_to_display, DeliveryMethod, ListPaymentsFilter, Page, Payment, PaymentDetails,
    PaymentLineItem, PaymentMethod, PaymentReminder, PaymentStatus, PaymentTransaction,
    PaymentType, ReminderMethod, ReminderStatus, ReminderType, TransactionStatus,
    TransactionType, MAX_PAGE_LIMIT,
};
use crate::services::store::AppliedChange;

/// Display strings for the amounts of a payment.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmountsDisplay {
    pub subtotal: String,
    pub tax: String,
    pub total: String,
    pub paid: String,
    pub refunded: String,
    pub balance_due: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentResponse {
    pub id: Uuid,
    pub payment_number: String,
    pub order_id: Uuid,
    #[serde(rename = "type")]
    pub payment_type: PaymentType,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub currency: String,
    pub subtotal_amount: i64,
    pub tax_amount: i64,
    pub total_amount: i64,
    pub paid_amount: i64,
    pub refunded_amount: i64,
    pub balance_due: i64,
    pub display: AmountsDisplay,
    pub square_invoice_id: Option<String>,
    pub square_order_id: Option<String>,
    pub square_customer_id: Option<String>,
    pub public_payment_url: Option<String>,
    pub delivery_method: Option<DeliveryMethod>,
    pub order_number: Option<String>,
    pub customer_name: String,
    pub customer_email: Option<String>,
    pub customer_phone: Option<String>,
    pub service_address: Option<String>,
    pub dumpster_size: Option<String>,
    pub scheduled_delivery_date: Option<NaiveDate>,
    pub scheduled_pickup_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub due_date: Option<NaiveDate>,
    pub sent_at: Option<DateTime<Utc>>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl From<Payment> for PaymentResponse {
    fn from(p: Payment) -> Self {
        let balance_due = p.balance_due();
        Self {
            display: AmountsDisplay {
                subtotal: cents_to_display(p.subtotal_amount),
                tax: cents_to_display(p.tax_amount),
                total: cents_to_display(p.total_amount),
                paid: cents_to_display(p.paid_amount),
                refunded: cents_to_display(p.refunded_amount),
                balance_due: cents_to_display(balance_due),
            },
            balance_due,
            id: p.id,
            payment_number: p.payment_number,
            order_id: p.order_id,
            payment_type: p.payment_type,
            method: p.method,
            status: p.status,
            currency: p.currency,
            subtotal_amount: p.subtotal_amount,
            tax_amount: p.tax_amount,
            total_amount: p.total_amount,
            paid_amount: p.paid_amount,
            refunded_amount: p.refunded_amount,
            square_invoice_id: p.square_invoice_id,
            square_order_id: p.square_order_id,
            square_customer_id: p.square_customer_id,
            public_payment_url: p.public_payment_url,
            delivery_method: p.delivery_method,
            order_number: p.order_number,
            customer_name: p.customer_name,
            customer_email: p.customer_email,
            customer_phone: p.customer_phone,
            service_address: p.service_address,
            dumpster_size: p.dumpster_size,
            scheduled_delivery_date: p.scheduled_delivery_date,
            scheduled_pickup_date: p.scheduled_pickup_date,
            notes: p.notes,
            metadata: p.metadata,
            due_date: p.due_date,
            sent_at: p.sent_at,
            viewed_at: p.viewed_at,
            paid_at: p.paid_at,
            failed_at: p.failed_at,
            canceled_at: p.canceled_at,
            created_at: p.created_at,
            updated_at: p.updated_at,
            version: p.version,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItemResponse {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
    pub total_price_display: String,
    pub tax_rate_bps: Option<i32>,
    pub tax_amount: Option<i64>,
    pub category: Option<String>,
    pub sku: Option<String>,
    pub sort_order: i32,
}

impl From<PaymentLineItem> for LineItemResponse {
    fn from(item: PaymentLineItem) -> Self {
        Self {
            id: item.id,
            total_price_display: cents_to_display(item.total_price),
            name: item.name,
            description: item.description,
            quantity: item.quantity,
            unit_price: item.unit_price,
            total_price: item.total_price,
            tax_rate_bps: item.tax_rate_bps,
            tax_amount: item.tax_amount,
            category: item.category,
            sku: item.sku,
            sort_order: item.sort_order,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub id: Uuid,
    pub payment_id: Uuid,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub amount_display: String,
    pub status: TransactionStatus,
    pub external_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<PaymentTransaction> for TransactionResponse {
    fn from(t: PaymentTransaction) -> Self {
        Self {
            id: t.id,
            payment_id: t.payment_id,
            transaction_type: t.transaction_type,
            amount: t.amount,
            amount_display: cents_to_display(t.amount),
            status: t.status,
            external_ref: t.external_ref,
            metadata: t.metadata,
            processed_at: t.processed_at,
            created_at: t.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderResponse {
    pub id: Uuid,
    pub payment_id: Uuid,
    #[serde(rename = "type")]
    pub reminder_type: ReminderType,
    pub method: ReminderMethod,
    pub status: ReminderStatus,
    pub scheduled_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<PaymentReminder> for ReminderResponse {
    fn from(r: PaymentReminder) -> Self {
        Self {
            id: r.id,
            payment_id: r.payment_id,
            reminder_type: r.reminder_type,
            method: r.method,
            status: r.status,
            scheduled_at: r.scheduled_at,
            sent_at: r.sent_at,
            message: r.message,
            failure_reason: r.failure_reason,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentDetailsResponse {
    #[serde(flatten)]
    pub payment: PaymentResponse,
    pub line_items: Vec<LineItemResponse>,
    pub transactions: Vec<TransactionResponse>,
    pub reminders: Vec<ReminderResponse>,
}

impl From<PaymentDetails> for PaymentDetailsResponse {
    fn from(details: PaymentDetails) -> Self {
        Self {
            payment: details.payment.into(),
            line_items: details.line_items.into_iter().map(Into::into).collect(),
            transactions: details.transactions.into_iter().map(Into::into).collect(),
            reminders: details.reminders.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}

/// Query string of `GET /payments`. List filters take comma-separated values.
#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ListPaymentsQuery {
    pub order_id: Option<Uuid>,
    pub status: Option<String>,
    pub method: Option<String>,
    #[serde(rename = "type")]
    pub payment_type: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub due_before: Option<NaiveDate>,
    #[validate(range(min = 0, message = "minAmount must not be negative"))]
    pub min_amount: Option<i64>,
    #[validate(range(min = 0, message = "maxAmount must not be negative"))]
    pub max_amount: Option<i64>,
    #[validate(length(max = 200, message = "search must be at most 200 characters"))]
    pub search: Option<String>,
    #[validate(range(min = 1, message = "page starts at 1"))]
    pub page: Option<u32>,
    #[validate(range(min = 1, max = 100, message = "limit must be between 1 and 100"))]
    pub limit: Option<u32>,
}

fn parse_list<T>(
    field: &str,
    raw: Option<&str>,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<Vec<T>, String> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            parse(&s.to_ascii_uppercase()).ok_or_else(|| format!("unknown {} '{}'", field, s))
        })
        .collect()
}

impl ListPaymentsQuery {
    pub fn into_filter(self) -> Result<ListPaymentsFilter, String> {
        if let (Some(min), Some(max)) = (self.min_amount, self.max_amount) {
            if min > max {
                return Err("minAmount must not exceed maxAmount".to_string());
            }
        }
        Ok(ListPaymentsFilter {
            statuses: parse_list("status", self.status.as_deref(), PaymentStatus::parse)?,
            methods: parse_list("method", self.method.as_deref(), PaymentMethod::parse)?,
            types: parse_list("type", self.payment_type.as_deref(), PaymentType::parse)?,
            order_id: self.order_id,
            created_from: self.created_from,
            created_to: self.created_to,
            due_before: self.due_before,
            min_amount: self.min_amount,
            max_amount: self.max_amount,
            search: self.search,
            page: self.page.unwrap_or(1),
            limit: self.limit.unwrap_or(0).min(MAX_PAGE_LIMIT),
        })
    }
}

pub fn page_response(page: Page<Payment>, filter: &ListPaymentsFilter) -> PageResponse<PaymentResponse> {
    let (limit, _) = filter.window();
    PageResponse {
        items: page.items.into_iter().map(Into::into).collect(),
        total: page.total,
        page: filter.page.max(1),
        limit,
        has_more: page.has_more,
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RecordTransactionRequest {
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: i64,
    #[validate(length(min = 1, max = 255, message = "externalRef must be 1-255 characters"))]
    pub external_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordTransactionResponse {
    pub payment: PaymentResponse,
    pub transaction: Option<TransactionResponse>,
}

impl From<AppliedChange> for RecordTransactionResponse {
    fn from(applied: AppliedChange) -> Self {
        Self {
            payment: applied.payment.into(),
            transaction: applied.transaction.map(Into::into),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleReminderRequest {
    #[serde(rename = "type")]
    pub reminder_type: ReminderType,
    pub method: ReminderMethod,
    pub scheduled_at: DateTime<Utc>,
    #[validate(length(max = 1000, message = "message must be at most 1000 characters"))]
    pub message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueSweepRequest {
    pub as_of: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverdueSweepResponse {
    pub as_of: NaiveDate,
    pub count: usize,
    pub transitioned: Vec<Uuid>,
}
