//! Payment ledger persistence.
//!
//! `LedgerStore` is the only component that touches storage. The lifecycle
//! manager drives every status change through [`LedgerStore::apply_change`],
//! which compares the payment's `version`, appends the optional transaction
//! and claims the optional webhook event as one atomic unit. A REFUND entry
//! is unique per payment by its `external_ref`, checked inside that unit.

mod memory;
mod postgres;

pub use memory::MemoryLedgerStore;
pub use postgres::PgLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    LedgerChange, ListPaymentsFilter, NewLineItem, NewPayment, NewReminder, NewTransaction,
    NewWebhookEvent, Page, Payment, PaymentDetails, PaymentLineItem, PaymentReminder,
    PaymentTransaction, PaymentUpdate, PaymentWebhookEvent, ReminderStatus, TransactionType,
    WebhookEventStatus,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("payment {payment_id} was modified concurrently (expected version {expected})")]
    VersionConflict { payment_id: Uuid, expected: i64 },

    #[error("webhook event {0} was already processed")]
    AlreadyProcessed(String),

    #[error("refund {external_ref} is already recorded on payment {payment_id}")]
    DuplicateRefund {
        payment_id: Uuid,
        external_ref: String,
    },

    #[error("stored value could not be decoded: {0}")]
    Decode(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of [`LedgerStore::apply_change`].
#[derive(Debug, Clone)]
pub struct AppliedChange {
    pub payment: Payment,
    pub transaction: Option<PaymentTransaction>,
}

/// Format the human-facing payment number for a sequence value.
pub fn payment_number(seq: i64) -> String {
    format!("PAY-{:06}", seq)
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a DRAFT payment with zero paid/refunded amounts and version 1.
    async fn create_payment(&self, input: NewPayment) -> StoreResult<Payment>;

    /// Insert the payment and its line items in one unit; either both exist
    /// afterwards or neither does.
    async fn create_payment_with_items(
        &self,
        input: NewPayment,
        items: Vec<NewLineItem>,
    ) -> StoreResult<(Payment, Vec<PaymentLineItem>)>;

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>>;

    async fn get_payment_by_external_invoice_id(
        &self,
        external_invoice_id: &str,
    ) -> StoreResult<Option<Payment>>;

    /// Lookup by the provider's order id; refund callbacks carry only that.
    async fn get_payment_by_external_order_id(
        &self,
        external_order_id: &str,
    ) -> StoreResult<Option<Payment>>;

    /// Most recent non-canceled payment for the order, else the most recent one.
    async fn latest_payment_for_order(&self, order_id: Uuid) -> StoreResult<Option<Payment>>;

    /// Unconditional whitelist update. Bumps `updated_at` and `version`.
    async fn update_payment(&self, id: Uuid, update: PaymentUpdate) -> StoreResult<Payment>;

    /// Compare-and-set update with optional ledger entry and webhook claim.
    /// A REFUND whose `external_ref` is already recorded fails with
    /// `DuplicateRefund` and writes nothing.
    async fn apply_change(&self, change: LedgerChange) -> StoreResult<AppliedChange>;

    /// Newest first.
    async fn list_payments(&self, filter: &ListPaymentsFilter) -> StoreResult<Page<Payment>>;

    /// SENT or VIEWED payments whose due date is strictly before `as_of`.
    async fn list_past_due(&self, as_of: NaiveDate) -> StoreResult<Vec<Payment>>;

    async fn insert_line_items(
        &self,
        payment_id: Uuid,
        items: Vec<NewLineItem>,
    ) -> StoreResult<Vec<PaymentLineItem>>;

    async fn list_line_items(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentLineItem>>;

    /// Append a ledger entry without touching payment totals. Subject to the
    /// same refund uniqueness as `apply_change`.
    async fn insert_transaction(&self, input: NewTransaction) -> StoreResult<PaymentTransaction>;

    async fn list_transactions(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentTransaction>>;

    async fn insert_reminder(&self, input: NewReminder) -> StoreResult<PaymentReminder>;

    async fn list_reminders(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentReminder>>;

    async fn update_reminder_status(
        &self,
        reminder_id: Uuid,
        status: ReminderStatus,
        failure_reason: Option<String>,
    ) -> StoreResult<PaymentReminder>;

    /// Cancel every still-SCHEDULED reminder of a payment. Returns how many.
    async fn cancel_scheduled_reminders(&self, payment_id: Uuid) -> StoreResult<u64>;

    /// Insert-or-fetch by `event_id`. Re-delivery of an event that is not yet
    /// PROCESSED increments its `retry_count`.
    async fn log_webhook_event(&self, input: NewWebhookEvent) -> StoreResult<PaymentWebhookEvent>;

    async fn get_webhook_event(&self, event_id: &str) -> StoreResult<Option<PaymentWebhookEvent>>;

    /// Record a non-mutating outcome. A PROCESSED event is never overwritten.
    async fn mark_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        payment_id: Option<Uuid>,
        failure_reason: Option<String>,
    ) -> StoreResult<PaymentWebhookEvent>;

    async fn health_check(&self) -> StoreResult<()>;

    async fn get_payment_details(&self, id: Uuid) -> StoreResult<Option<PaymentDetails>> {
        let Some(payment) = self.get_payment(id).await? else {
            return Ok(None);
        };
        let line_items = self.list_line_items(id).await?;
        let transactions = self.list_transactions(id).await?;
        let reminders = self.list_reminders(id).await?;
        Ok(Some(PaymentDetails {
            payment,
            line_items,
            transactions,
            reminders,
        }))
    }
}

/// Timestamp written to `processed_at` for a given outcome.
pub(crate) fn processed_at_for(status: WebhookEventStatus, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match status {
        WebhookEventStatus::Processed | WebhookEventStatus::Ignored => Some(now),
        WebhookEventStatus::Pending | WebhookEventStatus::Failed => None,
    }
}

/// Checks shared by both stores before a ledger entry is written.
pub(crate) fn validate_transaction(input: &NewTransaction) -> StoreResult<()> {
    input
        .transaction_type
        .validate_amount(input.amount)
        .map_err(StoreError::Validation)
}

/// The reference a REFUND entry must not share with another refund of the
/// same payment.
pub(crate) fn refund_ref(input: &NewTransaction) -> Option<&str> {
    match input.transaction_type {
        TransactionType::Refund => input.external_ref.as_deref(),
        _ => None,
    }
}
