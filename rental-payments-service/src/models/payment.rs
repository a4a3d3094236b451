//! Payment model: the billing record for one invoicing attempt against an order.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{NewTransaction, PaymentLineItem, PaymentReminder, PaymentTransaction};

pub const DEFAULT_PAGE_LIMIT: u32 = 20;
pub const MAX_PAGE_LIMIT: u32 = 100;

text_enum! {
    /// What the payment is for.
    pub enum PaymentType {
        Invoice => "INVOICE",
        Deposit => "DEPOSIT",
        FullPayment => "FULL_PAYMENT",
        PartialPayment => "PARTIAL_PAYMENT",
        Refund => "REFUND",
        Adjustment => "ADJUSTMENT",
    }
}

text_enum! {
    /// How the customer is expected to pay.
    #[derive(Default)]
    pub enum PaymentMethod {
        #[default]
        SquareInvoice => "SQUARE_INVOICE",
        SquarePos => "SQUARE_POS",
        Cash => "CASH",
        Check => "CHECK",
        BankTransfer => "BANK_TRANSFER",
        CreditCard => "CREDIT_CARD",
        Other => "OTHER",
    }
}

text_enum! {
    /// Billing lifecycle state. See `services::lifecycle` for the transition table.
    pub enum PaymentStatus {
        Draft => "DRAFT",
        Pending => "PENDING",
        Sent => "SENT",
        Viewed => "VIEWED",
        PartiallyPaid => "PARTIALLY_PAID",
        Paid => "PAID",
        Overdue => "OVERDUE",
        Canceled => "CANCELED",
        Refunded => "REFUNDED",
        Failed => "FAILED",
    }
}

text_enum! {
    /// How a remote invoice reaches the customer.
    pub enum DeliveryMethod {
        Email => "EMAIL",
        Sms => "SMS",
        ShareManually => "SHARE_MANUALLY",
    }
}

impl PaymentStatus {
    /// No further transitions except the explicit refund branch from PAID.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentStatus::Paid
                | PaymentStatus::Canceled
                | PaymentStatus::Refunded
                | PaymentStatus::Failed
        )
    }
}

/// Payment record.
///
/// All amounts are integer cents. `total_amount` is always
/// `subtotal_amount + tax_amount`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
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

    pub square_invoice_id: Option<String>,
    pub square_invoice_version: Option<i32>,
    pub square_payment_id: Option<String>,
    pub square_customer_id: Option<String>,
    pub square_location_id: Option<String>,
    pub square_order_id: Option<String>,
    pub public_payment_url: Option<String>,
    pub delivery_method: Option<DeliveryMethod>,

    // Order snapshot, so the admin view never re-joins the order source.
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

    /// Optimistic concurrency counter, bumped on every write.
    pub version: i64,
}

impl Payment {
    /// Amount still owed, never negative.
    pub fn balance_due(&self) -> i64 {
        (self.total_amount - self.paid_amount).max(0)
    }

    /// Whether receiving `amount` more settles the invoice.
    pub fn is_fully_paid_with(&self, amount: i64) -> bool {
        self.paid_amount.saturating_add(amount) >= self.total_amount
    }

    /// Money received and not yet refunded.
    pub fn refundable_amount(&self) -> i64 {
        (self.paid_amount - self.refunded_amount).max(0)
    }

    /// Apply a whitelisted partial update in memory. Write-once timestamps
    /// keep their first value.
    pub fn apply_update(&mut self, update: &PaymentUpdate, now: DateTime<Utc>) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(paid) = update.paid_amount {
            self.paid_amount = paid;
        }
        if let Some(refunded) = update.refunded_amount {
            self.refunded_amount = refunded;
        }
        if let Some(ref v) = update.square_invoice_id {
            self.square_invoice_id = Some(v.clone());
        }
        if let Some(v) = update.square_invoice_version {
            self.square_invoice_version = Some(v);
        }
        if let Some(ref v) = update.square_payment_id {
            self.square_payment_id = Some(v.clone());
        }
        if let Some(ref v) = update.square_customer_id {
            self.square_customer_id = Some(v.clone());
        }
        if let Some(ref v) = update.square_location_id {
            self.square_location_id = Some(v.clone());
        }
        if let Some(ref v) = update.square_order_id {
            self.square_order_id = Some(v.clone());
        }
        if let Some(ref v) = update.public_payment_url {
            self.public_payment_url = Some(v.clone());
        }
        if let Some(v) = update.delivery_method {
            self.delivery_method = Some(v);
        }
        if let Some(ref v) = update.notes {
            self.notes = Some(v.clone());
        }
        if let Some(ref v) = update.metadata {
            self.metadata = Some(v.clone());
        }
        if let Some(v) = update.due_date {
            self.due_date = Some(v);
        }
        self.sent_at = self.sent_at.or(update.sent_at);
        self.viewed_at = self.viewed_at.or(update.viewed_at);
        self.paid_at = self.paid_at.or(update.paid_at);
        self.failed_at = self.failed_at.or(update.failed_at);
        self.canceled_at = self.canceled_at.or(update.canceled_at);
        self.updated_at = now;
        self.version += 1;
    }
}

/// Input for creating a payment. Status, number and amounts paid are
/// assigned by the store.
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: Uuid,
    pub payment_type: PaymentType,
    pub method: PaymentMethod,
    pub currency: String,
    pub subtotal_amount: i64,
    pub tax_amount: i64,
    pub due_date: Option<NaiveDate>,
    pub square_location_id: Option<String>,
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
}

impl NewPayment {
    pub fn validate(&self) -> Result<i64, String> {
        if self.subtotal_amount < 0 {
            return Err(format!(
                "subtotal_amount must not be negative (got {})",
                self.subtotal_amount
            ));
        }
        if self.tax_amount < 0 {
            return Err(format!(
                "tax_amount must not be negative (got {})",
                self.tax_amount
            ));
        }
        self.subtotal_amount
            .checked_add(self.tax_amount)
            .ok_or_else(|| "total_amount overflows".to_string())
    }
}

/// Whitelisted partial update. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PaymentUpdate {
    pub status: Option<PaymentStatus>,
    pub paid_amount: Option<i64>,
    pub refunded_amount: Option<i64>,
    pub square_invoice_id: Option<String>,
    pub square_invoice_version: Option<i32>,
    pub square_payment_id: Option<String>,
    pub square_customer_id: Option<String>,
    pub square_location_id: Option<String>,
    pub square_order_id: Option<String>,
    pub public_payment_url: Option<String>,
    pub delivery_method: Option<DeliveryMethod>,
    pub notes: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub due_date: Option<NaiveDate>,
    pub sent_at: Option<DateTime<Utc>>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub paid_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl PaymentUpdate {
    pub fn is_empty(&self) -> bool {
        *self == PaymentUpdate::default()
    }
}

/// One atomic ledger mutation: compare-and-set on `expected_version`, an
/// optional appended transaction, and an optional webhook event claimed as
/// processed in the same unit.
#[derive(Debug, Clone)]
pub struct LedgerChange {
    pub payment_id: Uuid,
    pub expected_version: i64,
    pub update: PaymentUpdate,
    pub transaction: Option<NewTransaction>,
    pub claim_event_id: Option<String>,
}

/// Payment joined with its children.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentDetails {
    #[serde(flatten)]
    pub payment: Payment,
    pub line_items: Vec<PaymentLineItem>,
    pub transactions: Vec<PaymentTransaction>,
    pub reminders: Vec<PaymentReminder>,
}

/// Filter parameters for listing payments.
#[derive(Debug, Clone, Default)]
pub struct ListPaymentsFilter {
    pub order_id: Option<Uuid>,
    pub statuses: Vec<PaymentStatus>,
    pub methods: Vec<PaymentMethod>,
    pub types: Vec<PaymentType>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub due_before: Option<NaiveDate>,
    pub min_amount: Option<i64>,
    pub max_amount: Option<i64>,
    pub search: Option<String>,
    /// 1-based page number.
    pub page: u32,
    pub limit: u32,
}

impl ListPaymentsFilter {
    /// Effective `(limit, offset)` after clamping.
    pub fn window(&self) -> (u32, u32) {
        let limit = if self.limit == 0 {
            DEFAULT_PAGE_LIMIT
        } else {
            self.limit.min(MAX_PAGE_LIMIT)
        };
        let page = self.page.max(1);
        (limit, (page - 1).saturating_mul(limit))
    }

    /// Lower-cased trimmed search term, if any.
    pub fn search_term(&self) -> Option<String> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_lowercase)
    }

    /// In-process evaluation of the filter (pagination excluded).
    pub fn matches(&self, payment: &Payment) -> bool {
        if self.order_id.is_some_and(|id| id != payment.order_id) {
            return false;
        }
        if !self.statuses.is_empty() && !self.statuses.contains(&payment.status) {
            return false;
        }
        if !self.methods.is_empty() && !self.methods.contains(&payment.method) {
            return false;
        }
        if !self.types.is_empty() && !self.types.contains(&payment.payment_type) {
            return false;
        }
        if self.created_from.is_some_and(|from| payment.created_at < from) {
            return false;
        }
        if self.created_to.is_some_and(|to| payment.created_at > to) {
            return false;
        }
        if let Some(before) = self.due_before {
            match payment.due_date {
                Some(due) if due < before => {}
                _ => return false,
            }
        }
        if self.min_amount.is_some_and(|min| payment.total_amount < min) {
            return false;
        }
        if self.max_amount.is_some_and(|max| payment.total_amount > max) {
            return false;
        }
        if let Some(term) = self.search_term() {
            let haystacks = [
                Some(payment.payment_number.as_str()),
                Some(payment.customer_name.as_str()),
                payment.customer_email.as_deref(),
                payment.order_number.as_deref(),
            ];
            if !haystacks
                .iter()
                .flatten()
                .any(|h| h.to_lowercase().contains(&term))
            {
                return false;
            }
        }
        true
    }
}

/// One page of results.
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, offset: u32) -> Self {
        let has_more = i64::from(offset) + (items.len() as i64) < total;
        Self {
            items,
            total,
            has_more,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_text_roundtrip() {
        for status in PaymentStatus::ALL {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(*status));
        }
        assert_eq!(PaymentStatus::parse("paid"), None);
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = PaymentStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .collect();
        assert_eq!(
            terminal,
            vec![
                &PaymentStatus::Paid,
                &PaymentStatus::Canceled,
                &PaymentStatus::Refunded,
                &PaymentStatus::Failed
            ]
        );
    }

    #[test]
    fn test_default_method_is_square_invoice() {
        assert_eq!(PaymentMethod::default(), PaymentMethod::SquareInvoice);
    }

    #[test]
    fn test_status_serializes_screaming_snake() {
        let json = serde_json::to_string(&PaymentStatus::PartiallyPaid).unwrap();
        assert_eq!(json, "\"PARTIALLY_PAID\"");
    }

    #[test]
    fn test_window_clamps_limit() {
        let filter = ListPaymentsFilter {
            page: 3,
            limit: 500,
            ..Default::default()
        };
        assert_eq!(filter.window(), (100, 200));

        let filter = ListPaymentsFilter::default();
        assert_eq!(filter.window(), (DEFAULT_PAGE_LIMIT, 0));
    }

    #[test]
    fn test_page_has_more() {
        assert!(Page::new(vec![1, 2], 5, 0).has_more);
        assert!(!Page::new(vec![1, 2], 5, 3).has_more);
    }

    #[test]
    fn test_new_payment_rejects_negative_amounts() {
        let input = NewPayment {
            order_id: Uuid::new_v4(),
            payment_type: PaymentType::Invoice,
            method: PaymentMethod::SquareInvoice,
            currency: "USD".to_string(),
            subtotal_amount: -1,
            tax_amount: 0,
            due_date: None,
            square_location_id: None,
            order_number: None,
            customer_name: "Pat Doe".to_string(),
            customer_email: None,
            customer_phone: None,
            service_address: None,
            dumpster_size: None,
            scheduled_delivery_date: None,
            scheduled_pickup_date: None,
            notes: None,
            metadata: None,
        };
        assert!(input.validate().is_err());
        let input = NewPayment {
            subtotal_amount: 50_000,
            tax_amount: 4_000,
            ..input
        };
        assert_eq!(input.validate(), Ok(54_000));
    }
}
