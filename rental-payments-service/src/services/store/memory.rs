//! In-process ledger store.
//!
//! Backs the `PAYMENTS_STORE=memory` mode and the integration tests. All
//! state sits behind one `RwLock`, so `apply_change` is atomic by holding the
//! write guard for the whole unit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use tokio::sync::RwLock;
use tracing::{info, instrument};
use uuid::Uuid;

use super::{
    payment_number, processed_at_for, refund_ref, validate_transaction, AppliedChange,
    LedgerStore, StoreError, StoreResult,
};
use crate::models::{
    LedgerChange, ListPaymentsFilter, NewLineItem, NewPayment, NewReminder, NewTransaction,
    NewWebhookEvent, Page, Payment, PaymentLineItem, PaymentReminder, PaymentStatus,
    PaymentTransaction, PaymentUpdate, PaymentWebhookEvent, ReminderStatus, WebhookEventStatus,
};

#[derive(Default)]
struct Inner {
    payments: HashMap<Uuid, Payment>,
    line_items: Vec<PaymentLineItem>,
    transactions: Vec<PaymentTransaction>,
    reminders: Vec<PaymentReminder>,
    webhook_events: HashMap<String, PaymentWebhookEvent>,
    sequence: i64,
}

#[derive(Default)]
pub struct MemoryLedgerStore {
    inner: RwLock<Inner>,
    unavailable: AtomicBool,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with `Unavailable` until reset.
    /// Reads keep working, mirroring a database that rejects writes.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_writable(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "memory store is rejecting writes".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_refund_unique(inner: &Inner, input: &NewTransaction) -> StoreResult<()> {
    let Some(external_ref) = refund_ref(input) else {
        return Ok(());
    };
    let taken = inner.transactions.iter().any(|t| {
        t.payment_id == input.payment_id
            && t.transaction_type == input.transaction_type
            && t.external_ref.as_deref() == Some(external_ref)
    });
    if taken {
        return Err(StoreError::DuplicateRefund {
            payment_id: input.payment_id,
            external_ref: external_ref.to_string(),
        });
    }
    Ok(())
}

fn insert_payment(inner: &mut Inner, input: NewPayment, total_amount: i64) -> Payment {
    inner.sequence += 1;
    let now = Utc::now();
    let payment = Payment {
        id: Uuid::new_v4(),
        payment_number: payment_number(inner.sequence),
        order_id: input.order_id,
        payment_type: input.payment_type,
        method: input.method,
        status: PaymentStatus::Draft,
        currency: input.currency,
        subtotal_amount: input.subtotal_amount,
        tax_amount: input.tax_amount,
        total_amount,
        paid_amount: 0,
        refunded_amount: 0,
        square_invoice_id: None,
        square_invoice_version: None,
        square_payment_id: None,
        square_customer_id: None,
        square_location_id: input.square_location_id,
        square_order_id: None,
        public_payment_url: None,
        delivery_method: None,
        order_number: input.order_number,
        customer_name: input.customer_name,
        customer_email: input.customer_email,
        customer_phone: input.customer_phone,
        service_address: input.service_address,
        dumpster_size: input.dumpster_size,
        scheduled_delivery_date: input.scheduled_delivery_date,
        scheduled_pickup_date: input.scheduled_pickup_date,
        notes: input.notes,
        metadata: input.metadata,
        due_date: input.due_date,
        sent_at: None,
        viewed_at: None,
        paid_at: None,
        failed_at: None,
        canceled_at: None,
        created_at: now,
        updated_at: now,
        version: 1,
    };
    inner.payments.insert(payment.id, payment.clone());
    payment
}

/// Validate every item up front; returns the stored `(total_price, tax_amount)` pairs.
fn check_line_items(items: &[NewLineItem]) -> StoreResult<Vec<(i64, Option<i64>)>> {
    items
        .iter()
        .map(|item| item.checked_amounts())
        .collect::<Result<Vec<_>, _>>()
        .map_err(StoreError::Validation)
}

fn push_line_items(
    inner: &mut Inner,
    payment_id: Uuid,
    items: Vec<NewLineItem>,
    checked: Vec<(i64, Option<i64>)>,
) -> Vec<PaymentLineItem> {
    let start = inner
        .line_items
        .iter()
        .filter(|i| i.payment_id == payment_id)
        .count() as i32;
    let now = Utc::now();

    let inserted: Vec<PaymentLineItem> = items
        .into_iter()
        .zip(checked)
        .enumerate()
        .map(|(i, (item, (total_price, tax_amount)))| PaymentLineItem {
            id: Uuid::new_v4(),
            payment_id,
            name: item.name,
            description: item.description,
            quantity: item.quantity,
            unit_price: item.unit_price,
            total_price,
            tax_rate_bps: item.tax_rate_bps,
            tax_amount,
            category: item.category,
            sku: item.sku,
            sort_order: start + i as i32,
            created_at: now,
        })
        .collect();
    inner.line_items.extend(inserted.iter().cloned());
    inserted
}

fn append_transaction(inner: &mut Inner, input: NewTransaction) -> PaymentTransaction {
    let transaction = PaymentTransaction {
        id: Uuid::new_v4(),
        payment_id: input.payment_id,
        transaction_type: input.transaction_type,
        amount: input.amount,
        status: input.status,
        external_ref: input.external_ref,
        metadata: input.metadata,
        processed_at: input.processed_at,
        created_at: Utc::now(),
    };
    inner.transactions.push(transaction.clone());
    transaction
}

fn newest_first(a: &Payment, b: &Payment) -> std::cmp::Ordering {
    b.created_at
        .cmp(&a.created_at)
        .then_with(|| b.payment_number.cmp(&a.payment_number))
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    async fn create_payment(&self, input: NewPayment) -> StoreResult<Payment> {
        self.check_writable()?;
        let total_amount = input.validate().map_err(StoreError::Validation)?;

        let mut inner = self.inner.write().await;
        let payment = insert_payment(&mut inner, input, total_amount);

        info!(payment_id = %payment.id, payment_number = %payment.payment_number, "Payment created");

        Ok(payment)
    }

    #[instrument(skip(self, input, items), fields(order_id = %input.order_id, count = items.len()))]
    async fn create_payment_with_items(
        &self,
        input: NewPayment,
        items: Vec<NewLineItem>,
    ) -> StoreResult<(Payment, Vec<PaymentLineItem>)> {
        self.check_writable()?;
        let total_amount = input.validate().map_err(StoreError::Validation)?;
        let checked = check_line_items(&items)?;

        let mut inner = self.inner.write().await;
        let payment = insert_payment(&mut inner, input, total_amount);
        let line_items = push_line_items(&mut inner, payment.id, items, checked);

        info!(payment_id = %payment.id, payment_number = %payment.payment_number, "Payment created");

        Ok((payment, line_items))
    }

    async fn get_payment(&self, id: Uuid) -> StoreResult<Option<Payment>> {
        Ok(self.inner.read().await.payments.get(&id).cloned())
    }

    async fn get_payment_by_external_invoice_id(
        &self,
        external_invoice_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payments
            .values()
            .find(|p| p.square_invoice_id.as_deref() == Some(external_invoice_id))
            .cloned())
    }

    async fn get_payment_by_external_order_id(
        &self,
        external_order_id: &str,
    ) -> StoreResult<Option<Payment>> {
        let inner = self.inner.read().await;
        Ok(inner
            .payments
            .values()
            .find(|p| p.square_order_id.as_deref() == Some(external_order_id))
            .cloned())
    }

    async fn latest_payment_for_order(&self, order_id: Uuid) -> StoreResult<Option<Payment>> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<&Payment> = inner
            .payments
            .values()
            .filter(|p| p.order_id == order_id)
            .collect();
        candidates.sort_by(|a, b| newest_first(a, b));
        let active = candidates
            .iter()
            .find(|p| p.status != PaymentStatus::Canceled)
            .or(candidates.first());
        Ok(active.map(|p| (*p).clone()))
    }

    #[instrument(skip(self, update), fields(payment_id = %id))]
    async fn update_payment(&self, id: Uuid, update: PaymentUpdate) -> StoreResult<Payment> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let payment = inner
            .payments
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", id)))?;
        payment.apply_update(&update, Utc::now());
        Ok(payment.clone())
    }

    #[instrument(skip(self, change), fields(payment_id = %change.payment_id, expected_version = change.expected_version))]
    async fn apply_change(&self, change: LedgerChange) -> StoreResult<AppliedChange> {
        self.check_writable()?;
        if let Some(ref transaction) = change.transaction {
            validate_transaction(transaction)?;
            if transaction.payment_id != change.payment_id {
                return Err(StoreError::Validation(
                    "transaction belongs to a different payment".to_string(),
                ));
            }
        }

        let mut inner = self.inner.write().await;

        let current = inner
            .payments
            .get(&change.payment_id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", change.payment_id)))?;
        if current.version != change.expected_version {
            return Err(StoreError::VersionConflict {
                payment_id: change.payment_id,
                expected: change.expected_version,
            });
        }

        // Check the claim and refund uniqueness before writing anything.
        if let Some(ref event_id) = change.claim_event_id {
            match inner.webhook_events.get(event_id) {
                Some(event) if event.status == WebhookEventStatus::Processed => {
                    return Err(StoreError::AlreadyProcessed(event_id.clone()));
                }
                Some(_) => {}
                None => return Err(StoreError::NotFound(format!("webhook event {}", event_id))),
            }
        }
        if let Some(ref transaction) = change.transaction {
            check_refund_unique(&inner, transaction)?;
        }

        let now = Utc::now();
        let transaction = change
            .transaction
            .map(|input| append_transaction(&mut inner, input));
        if let Some(ref event_id) = change.claim_event_id {
            if let Some(event) = inner.webhook_events.get_mut(event_id) {
                event.status = WebhookEventStatus::Processed;
                event.payment_id = Some(change.payment_id);
                event.failure_reason = None;
                event.processed_at = Some(now);
            }
        }
        let payment = inner
            .payments
            .get_mut(&change.payment_id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {}", change.payment_id)))?;
        payment.apply_update(&change.update, now);

        Ok(AppliedChange {
            payment: payment.clone(),
            transaction,
        })
    }

    async fn list_payments(&self, filter: &ListPaymentsFilter) -> StoreResult<Page<Payment>> {
        let (limit, offset) = filter.window();
        let inner = self.inner.read().await;
        let mut matching: Vec<&Payment> = inner
            .payments
            .values()
            .filter(|p| filter.matches(p))
            .collect();
        matching.sort_by(|a, b| newest_first(a, b));

        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, total, offset))
    }

    async fn list_past_due(&self, as_of: NaiveDate) -> StoreResult<Vec<Payment>> {
        let inner = self.inner.read().await;
        let mut due: Vec<Payment> = inner
            .payments
            .values()
            .filter(|p| matches!(p.status, PaymentStatus::Sent | PaymentStatus::Viewed))
            .filter(|p| p.due_date.is_some_and(|d| d < as_of))
            .cloned()
            .collect();
        due.sort_by_key(|p| p.due_date);
        Ok(due)
    }

    async fn insert_line_items(
        &self,
        payment_id: Uuid,
        items: Vec<NewLineItem>,
    ) -> StoreResult<Vec<PaymentLineItem>> {
        self.check_writable()?;
        let checked = check_line_items(&items)?;

        let mut inner = self.inner.write().await;
        if !inner.payments.contains_key(&payment_id) {
            return Err(StoreError::NotFound(format!("payment {}", payment_id)));
        }
        Ok(push_line_items(&mut inner, payment_id, items, checked))
    }

    async fn list_line_items(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentLineItem>> {
        let inner = self.inner.read().await;
        let mut items: Vec<PaymentLineItem> = inner
            .line_items
            .iter()
            .filter(|i| i.payment_id == payment_id)
            .cloned()
            .collect();
        items.sort_by_key(|i| i.sort_order);
        Ok(items)
    }

    async fn insert_transaction(&self, input: NewTransaction) -> StoreResult<PaymentTransaction> {
        self.check_writable()?;
        validate_transaction(&input)?;
        let mut inner = self.inner.write().await;
        if !inner.payments.contains_key(&input.payment_id) {
            return Err(StoreError::NotFound(format!("payment {}", input.payment_id)));
        }
        check_refund_unique(&inner, &input)?;
        Ok(append_transaction(&mut inner, input))
    }

    async fn list_transactions(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentTransaction>> {
        let inner = self.inner.read().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|t| t.payment_id == payment_id)
            .cloned()
            .collect())
    }

    async fn insert_reminder(&self, input: NewReminder) -> StoreResult<PaymentReminder> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        if !inner.payments.contains_key(&input.payment_id) {
            return Err(StoreError::NotFound(format!("payment {}", input.payment_id)));
        }
        let reminder = PaymentReminder {
            id: Uuid::new_v4(),
            payment_id: input.payment_id,
            reminder_type: input.reminder_type,
            method: input.method,
            status: ReminderStatus::Scheduled,
            scheduled_at: input.scheduled_at,
            sent_at: None,
            message: input.message,
            failure_reason: None,
            created_at: Utc::now(),
        };
        inner.reminders.push(reminder.clone());
        Ok(reminder)
    }

    async fn list_reminders(&self, payment_id: Uuid) -> StoreResult<Vec<PaymentReminder>> {
        let inner = self.inner.read().await;
        let mut reminders: Vec<PaymentReminder> = inner
            .reminders
            .iter()
            .filter(|r| r.payment_id == payment_id)
            .cloned()
            .collect();
        reminders.sort_by_key(|r| r.scheduled_at);
        Ok(reminders)
    }

    async fn update_reminder_status(
        &self,
        reminder_id: Uuid,
        status: ReminderStatus,
        failure_reason: Option<String>,
    ) -> StoreResult<PaymentReminder> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let reminder = inner
            .reminders
            .iter_mut()
            .find(|r| r.id == reminder_id)
            .ok_or_else(|| StoreError::NotFound(format!("reminder {}", reminder_id)))?;
        reminder.status = status;
        if status == ReminderStatus::Sent {
            reminder.sent_at = reminder.sent_at.or(Some(Utc::now()));
        }
        if failure_reason.is_some() {
            reminder.failure_reason = failure_reason;
        }
        Ok(reminder.clone())
    }

    async fn cancel_scheduled_reminders(&self, payment_id: Uuid) -> StoreResult<u64> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let mut canceled = 0;
        for reminder in inner
            .reminders
            .iter_mut()
            .filter(|r| r.payment_id == payment_id && r.status == ReminderStatus::Scheduled)
        {
            reminder.status = ReminderStatus::Canceled;
            canceled += 1;
        }
        Ok(canceled)
    }

    #[instrument(skip(self, input), fields(event_id = %input.event_id))]
    async fn log_webhook_event(&self, input: NewWebhookEvent) -> StoreResult<PaymentWebhookEvent> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner.webhook_events.get_mut(&input.event_id) {
            if existing.status != WebhookEventStatus::Processed {
                existing.retry_count += 1;
            }
            return Ok(existing.clone());
        }
        let event = PaymentWebhookEvent {
            id: Uuid::new_v4(),
            event_id: input.event_id.clone(),
            event_type: input.event_type,
            source: input.source,
            raw_payload: input.raw_payload,
            status: WebhookEventStatus::Pending,
            payment_id: None,
            retry_count: 0,
            failure_reason: None,
            received_at: Utc::now(),
            processed_at: None,
        };
        inner.webhook_events.insert(input.event_id, event.clone());
        Ok(event)
    }

    async fn get_webhook_event(&self, event_id: &str) -> StoreResult<Option<PaymentWebhookEvent>> {
        Ok(self.inner.read().await.webhook_events.get(event_id).cloned())
    }

    async fn mark_webhook_event(
        &self,
        event_id: &str,
        status: WebhookEventStatus,
        payment_id: Option<Uuid>,
        failure_reason: Option<String>,
    ) -> StoreResult<PaymentWebhookEvent> {
        self.check_writable()?;
        let mut inner = self.inner.write().await;
        let event = inner
            .webhook_events
            .get_mut(event_id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook event {}", event_id)))?;
        if event.status == WebhookEventStatus::Processed {
            return Err(StoreError::AlreadyProcessed(event_id.to_string()));
        }
        event.status = status;
        event.payment_id = payment_id.or(event.payment_id);
        event.failure_reason = failure_reason;
        event.processed_at = processed_at_for(status, Utc::now());
        Ok(event.clone())
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}
