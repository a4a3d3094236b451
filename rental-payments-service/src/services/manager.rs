//! Payment lifecycle orchestration.
//!
//! Every mutation follows the same loop: read the payment, [`plan`] the
//! change, hand it to [`LedgerStore::apply_change`] with the version that was
//! read, and re-plan on a version conflict. Provider calls happen outside the
//! loop and are bounded by the configured adapter timeout.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::BillingConfig;
use crate::models::{
    cents_to_display, dollars_to_cents, tax_for, DeliveryMethod, LedgerChange,
    ListPaymentsFilter, NewLineItem, NewPayment, NewReminder, NewWebhookEvent, Page, Payment,
    PaymentDetails, PaymentMethod, PaymentReminder, PaymentStatus, PaymentType, ReminderMethod,
    ReminderStatus, ReminderType, TransactionType, WebhookEventStatus,
};
use crate::services::error::PaymentError;
use crate::services::lifecycle::{plan, LifecycleEvent, LifecyclePolicy, PlanError, RemoteRefs};
use crate::services::metrics::{
    ERRORS_TOTAL, PAYMENT_TRANSITIONS_TOTAL, PROVIDER_CALLS_TOTAL, PROVIDER_CALL_DURATION,
    TRANSACTION_AMOUNT_TOTAL, WEBHOOK_EVENTS_TOTAL,
};
use crate::services::orders::OrderSource;
use crate::services::provider::{
    CreateInvoiceOptions, InvoiceProvider, ParsedWebhook, ProviderError, RemoteInvoice,
    RemoteInvoiceStatus, RemoteStatus,
};
use crate::services::store::{AppliedChange, LedgerStore, StoreError};
use crate::services::webhook::{parse_event, InvoiceSnapshot, WebhookEvent};

/// Attempts per mutation before a version conflict is surfaced.
const MAX_ATTEMPTS: usize = 5;

/// Input for [`PaymentLifecycleManager::create_payment_from_order`].
#[derive(Debug, Clone)]
pub struct CreatePaymentInput {
    pub order_id: Uuid,
    pub method: PaymentMethod,
    pub due_date: Option<NaiveDate>,
    pub notes: Option<String>,
    pub custom_fields: Option<serde_json::Value>,
}

/// Input for [`PaymentLifecycleManager::record_transaction`].
#[derive(Debug, Clone)]
pub struct RecordTransactionInput {
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub external_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Input for [`PaymentLifecycleManager::schedule_reminder`].
#[derive(Debug, Clone)]
pub struct ScheduleReminderInput {
    pub reminder_type: ReminderType,
    pub method: ReminderMethod,
    pub scheduled_at: chrono::DateTime<Utc>,
    pub message: Option<String>,
}

/// A payment together with the provider's view of its invoice, when the
/// provider was consulted.
#[derive(Debug, Clone)]
pub struct PaymentWithRemote {
    pub payment: Payment,
    pub remote: Option<RemoteInvoiceStatus>,
}

/// Result of handling one webhook delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Processed {
        payment_id: Uuid,
        status: PaymentStatus,
    },
    /// The event id was already processed.
    Duplicate,
    /// Recorded but intentionally not applied.
    Ignored {
        payment_id: Option<Uuid>,
        reason: String,
    },
    /// Not applied because of a storage failure; the provider should re-deliver.
    Failed { reason: String },
}

impl WebhookOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed { .. } => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored { .. } => "ignored",
            WebhookOutcome::Failed { .. } => "failed",
        }
    }
}

/// Why a driven change did not happen.
#[derive(Debug)]
enum DriveError {
    /// The transition table refused the event; nothing was written.
    Rejected(PlanError),
    Failed(PaymentError),
}

impl From<DriveError> for PaymentError {
    fn from(err: DriveError) -> Self {
        match err {
            DriveError::Rejected(e) => e.into(),
            DriveError::Failed(e) => e,
        }
    }
}

impl From<RemoteInvoice> for RemoteInvoiceStatus {
    fn from(invoice: RemoteInvoice) -> Self {
        RemoteInvoiceStatus {
            external_id: invoice.external_id,
            status: invoice.status,
            version: Some(invoice.version),
            public_url: invoice.public_url,
            paid_amount: None,
        }
    }
}

pub struct PaymentLifecycleManager {
    store: Arc<dyn LedgerStore>,
    orders: Arc<dyn OrderSource>,
    provider: Arc<dyn InvoiceProvider>,
    billing: BillingConfig,
}

impl PaymentLifecycleManager {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        orders: Arc<dyn OrderSource>,
        provider: Arc<dyn InvoiceProvider>,
        billing: BillingConfig,
    ) -> Self {
        Self {
            store,
            orders,
            provider,
            billing,
        }
    }

    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn provider(&self) -> &Arc<dyn InvoiceProvider> {
        &self.provider
    }

    fn policy(&self) -> LifecyclePolicy {
        LifecyclePolicy {
            partial_refund: self.billing.partial_refund_policy,
        }
    }

    async fn load(&self, payment_id: Uuid) -> Result<Payment, PaymentError> {
        self.store
            .get_payment(payment_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {}", payment_id)))
    }

    // ---------------------------------------------------------------------
    // Creation
    // ---------------------------------------------------------------------

    /// Create a DRAFT payment priced from the order, with one rental line item.
    ///
    /// An unsent DRAFT of the same method is resumed instead, so a retried
    /// create keeps one payment and one provider idempotency key.
    #[instrument(skip(self, input), fields(order_id = %input.order_id, payment_id))]
    pub async fn create_payment_from_order(
        &self,
        input: CreatePaymentInput,
    ) -> Result<Payment, PaymentError> {
        let order = self
            .orders
            .get_order(input.order_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("order {}", input.order_id)))?;

        if let Some(draft) = self.resumable_draft(order.id, input.method).await? {
            tracing::Span::current().record("payment_id", draft.id.to_string());
            info!(payment_id = %draft.id, "Resuming unsent draft payment");
            return Ok(draft);
        }

        let price = order.billable_price().ok_or_else(|| {
            PaymentError::Validation(format!(
                "order {} has neither a final nor a quoted price",
                order.id
            ))
        })?;
        let subtotal = dollars_to_cents(price).ok_or_else(|| {
            PaymentError::Validation(format!("order price {} is out of range", price))
        })?;
        if subtotal <= 0 {
            return Err(PaymentError::Validation(format!(
                "order price must be positive (got {})",
                price
            )));
        }
        let tax = tax_for(subtotal, self.billing.tax_rate_bps);

        let today = Utc::now().date_naive();
        let due_date = match input.due_date {
            Some(due) if due < today => {
                return Err(PaymentError::Validation(format!(
                    "due date {} is in the past",
                    due
                )))
            }
            Some(due) => due,
            None => today + ChronoDuration::days(i64::from(self.billing.net_days)),
        };

        let new_payment = NewPayment {
            order_id: order.id,
            payment_type: PaymentType::Invoice,
            method: input.method,
            currency: self.billing.currency.clone(),
            subtotal_amount: subtotal,
            tax_amount: tax,
            due_date: Some(due_date),
            square_location_id: None,
            order_number: order.order_number.clone(),
            customer_name: order.customer_name(),
            customer_email: order.email.clone(),
            customer_phone: order.phone.clone(),
            service_address: order.service_address(),
            dumpster_size: order.dumpster_size.clone(),
            scheduled_delivery_date: order.scheduled_delivery_date,
            scheduled_pickup_date: order.scheduled_pickup_date,
            notes: input.notes,
            metadata: input.custom_fields,
        };
        let item = rental_line_item(&new_payment, self.billing.tax_rate_bps);
        let (payment, _) = self
            .store
            .create_payment_with_items(new_payment, vec![item])
            .await?;
        tracing::Span::current().record("payment_id", payment.id.to_string());

        info!(
            payment_id = %payment.id,
            payment_number = %payment.payment_number,
            total_amount = payment.total_amount,
            "Payment created from order"
        );
        Ok(payment)
    }

    async fn resumable_draft(
        &self,
        order_id: Uuid,
        method: PaymentMethod,
    ) -> Result<Option<Payment>, PaymentError> {
        let latest = self.store.latest_payment_for_order(order_id).await?;
        Ok(latest.filter(|p| p.status == PaymentStatus::Draft && p.method == method))
    }

    /// Options for creating the remote invoice of `payment`.
    pub fn invoice_options(
        &self,
        payment: &Payment,
        delivery_method: DeliveryMethod,
        message: Option<String>,
    ) -> CreateInvoiceOptions {
        let title = match payment.order_number.as_deref() {
            Some(number) => format!("Dumpster Rental - Order {}", number),
            None => "Dumpster Rental".to_string(),
        };
        CreateInvoiceOptions {
            delivery_method,
            due_date: payment
                .due_date
                .unwrap_or_else(|| Utc::now().date_naive()),
            title: Some(title),
            message,
            idempotency_key: payment.id.to_string(),
        }
    }

    /// Create the provider invoice for a DRAFT payment and record its ids.
    #[instrument(skip(self, options), fields(payment_id = %payment_id))]
    pub async fn create_remote_invoice(
        &self,
        payment_id: Uuid,
        options: &CreateInvoiceOptions,
    ) -> Result<PaymentWithRemote, PaymentError> {
        let payment = self.load(payment_id).await?;
        if payment.status != PaymentStatus::Draft {
            return Err(PaymentError::InvalidTransition {
                from: payment.status,
                event: "remote_invoice_created",
            });
        }
        if let Some(ref existing) = payment.square_invoice_id {
            return Err(PaymentError::Validation(format!(
                "payment {} already has remote invoice {}",
                payment.id, existing
            )));
        }
        let order = self
            .orders
            .get_order(payment.order_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("order {}", payment.order_id)))?;

        let remote = self
            .call_provider(
                "create_invoice",
                self.provider.create_invoice(&payment, &order, options),
            )
            .await?;

        let event = LifecycleEvent::RemoteInvoiceCreated(RemoteRefs {
            invoice_id: remote.external_id.clone(),
            invoice_version: Some(remote.version),
            customer_id: remote.customer_id.clone(),
            order_id: remote.order_id.clone(),
            location_id: remote.location_id.clone(),
            public_url: remote.public_url.clone(),
        });
        let applied = self.drive(payment_id, &event, "create", None).await?;

        info!(
            payment_id = %payment_id,
            invoice_id = %remote.external_id,
            "Remote invoice created"
        );
        Ok(PaymentWithRemote {
            payment: applied.payment,
            remote: Some(remote.into()),
        })
    }

    // ---------------------------------------------------------------------
    // Sending and canceling
    // ---------------------------------------------------------------------

    /// Publish the remote invoice. The payment moves to SENT, or to PENDING
    /// when the provider only scheduled delivery.
    #[instrument(skip(self, message), fields(payment_id = %payment_id, delivery_method = %delivery_method))]
    pub async fn send_invoice(
        &self,
        payment_id: Uuid,
        delivery_method: DeliveryMethod,
        message: Option<String>,
    ) -> Result<PaymentWithRemote, PaymentError> {
        let payment = self.load(payment_id).await?;
        let probe = LifecycleEvent::Sent {
            delivery_method: Some(delivery_method),
            public_url: None,
            invoice_version: None,
        };
        plan(&payment, &probe, &self.policy(), Utc::now()).map_err(PaymentError::from)?;
        let invoice_id = payment.square_invoice_id.clone().ok_or_else(|| {
            PaymentError::Validation(format!(
                "payment {} has no remote invoice to send",
                payment.id
            ))
        })?;

        let remote = self
            .call_provider("send_invoice", self.provider.send_invoice(&invoice_id))
            .await?;

        let public_url = remote
            .public_url
            .clone()
            .or_else(|| payment.public_payment_url.clone());
        let event = if remote.status == RemoteStatus::Scheduled && payment.status == PaymentStatus::Draft
        {
            LifecycleEvent::SendScheduled {
                delivery_method: Some(delivery_method),
                public_url,
                invoice_version: remote.version,
            }
        } else {
            LifecycleEvent::Sent {
                delivery_method: Some(delivery_method),
                public_url,
                invoice_version: remote.version,
            }
        };
        let applied = self.drive(payment_id, &event, "send", None).await?;

        if let Some(method) = reminder_method_for(delivery_method) {
            self.record_delivery(applied.payment.id, method, message).await;
        }

        Ok(PaymentWithRemote {
            payment: applied.payment,
            remote: Some(remote),
        })
    }

    /// Keep a trace of the message that went out with the invoice.
    async fn record_delivery(&self, payment_id: Uuid, method: ReminderMethod, message: Option<String>) {
        let reminder = NewReminder {
            payment_id,
            reminder_type: ReminderType::Initial,
            method,
            scheduled_at: Utc::now(),
            message,
        };
        let result = match self.store.insert_reminder(reminder).await {
            Ok(reminder) => self
                .store
                .update_reminder_status(reminder.id, ReminderStatus::Sent, None)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(payment_id = %payment_id, error = %e, "Failed to record invoice delivery");
        }
    }

    /// Cancel locally first, then best-effort on the provider.
    #[instrument(skip(self, reason), fields(payment_id = %payment_id))]
    pub async fn cancel_payment(
        &self,
        payment_id: Uuid,
        reason: Option<String>,
    ) -> Result<PaymentWithRemote, PaymentError> {
        let event = LifecycleEvent::Cancel {
            reason: reason.clone(),
        };
        let applied = self.drive(payment_id, &event, "cancel", None).await?;

        let remote = match applied.payment.square_invoice_id.as_deref() {
            Some(invoice_id) => match self
                .call_provider(
                    "cancel_invoice",
                    self.provider.cancel_invoice(invoice_id, reason.as_deref()),
                )
                .await
            {
                Ok(remote) => Some(remote),
                Err(e) => {
                    warn!(
                        payment_id = %payment_id,
                        invoice_id = %invoice_id,
                        error = %e,
                        "Remote cancel failed; payment stays canceled locally"
                    );
                    ERRORS_TOTAL.with_label_values(&["remote_cancel_failed"]).inc();
                    None
                }
            },
            None => None,
        };

        Ok(PaymentWithRemote {
            payment: applied.payment,
            remote,
        })
    }

    // ---------------------------------------------------------------------
    // Money
    // ---------------------------------------------------------------------

    /// Record a manual ledger entry. CHARGE and REFUND move the payment
    /// totals and status; FEE and ADJUSTMENT are appended as-is.
    #[instrument(skip(self, input), fields(payment_id = %payment_id, transaction_type = %input.transaction_type, amount = input.amount))]
    pub async fn record_transaction(
        &self,
        payment_id: Uuid,
        input: RecordTransactionInput,
    ) -> Result<AppliedChange, PaymentError> {
        let event = match input.transaction_type {
            TransactionType::Charge => LifecycleEvent::PaymentMade {
                amount: input.amount,
                external_ref: input.external_ref,
                metadata: input.metadata,
            },
            TransactionType::Refund => LifecycleEvent::Refund {
                amount: input.amount,
                external_ref: input.external_ref,
                metadata: input.metadata,
                provider_payment_id: None,
            },
            other => LifecycleEvent::LedgerEntry {
                transaction_type: other,
                amount: input.amount,
                external_ref: input.external_ref,
                metadata: input.metadata,
            },
        };
        let applied = self.drive(payment_id, &event, "manual", None).await?;
        Ok(AppliedChange {
            payment: applied.payment,
            transaction: applied.transaction,
        })
    }

    /// Move SENT/VIEWED payments due before `as_of` to OVERDUE and schedule
    /// an OVERDUE reminder for each. Returns the ids that transitioned.
    #[instrument(skip(self))]
    pub async fn check_overdue(&self, as_of: NaiveDate) -> Result<Vec<Uuid>, PaymentError> {
        let candidates = self.store.list_past_due(as_of).await?;
        let mut transitioned = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            match self
                .drive(candidate.id, &LifecycleEvent::DueDatePassed, "sweep", None)
                .await
            {
                Ok(applied) => {
                    let payment = applied.payment;
                    let reminder = NewReminder {
                        payment_id: payment.id,
                        reminder_type: ReminderType::Overdue,
                        method: payment
                            .delivery_method
                            .and_then(reminder_method_for)
                            .unwrap_or(ReminderMethod::Email),
                        scheduled_at: Utc::now(),
                        message: Some(format!(
                            "Invoice {} for {} was due on {}",
                            payment.payment_number,
                            cents_to_display(payment.balance_due()),
                            payment
                                .due_date
                                .map(|d| d.to_string())
                                .unwrap_or_default()
                        )),
                    };
                    if let Err(e) = self.store.insert_reminder(reminder).await {
                        warn!(payment_id = %payment.id, error = %e, "Failed to schedule overdue reminder");
                    }
                    transitioned.push(payment.id);
                }
                Err(DriveError::Rejected(e)) => {
                    debug!(payment_id = %candidate.id, reason = %e, "Skipping payment in overdue sweep");
                }
                Err(DriveError::Failed(e)) => {
                    warn!(payment_id = %candidate.id, error = %e, "Overdue transition failed");
                    ERRORS_TOTAL.with_label_values(&["overdue_sweep"]).inc();
                }
            }
        }

        info!(as_of = %as_of, count = transitioned.len(), "Overdue sweep finished");
        Ok(transitioned)
    }

    /// Pull the provider's view of the invoice and apply whatever the ledger
    /// has not recorded yet.
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn refresh_from_provider(
        &self,
        payment_id: Uuid,
    ) -> Result<PaymentWithRemote, PaymentError> {
        let payment = self.load(payment_id).await?;
        let invoice_id = payment.square_invoice_id.clone().ok_or_else(|| {
            PaymentError::Validation(format!(
                "payment {} has no remote invoice to refresh",
                payment.id
            ))
        })?;
        let remote = self
            .call_provider("get_invoice_status", self.provider.get_invoice_status(&invoice_id))
            .await?;

        let mut events = Vec::new();
        if remote.status == RemoteStatus::Scheduled {
            events.push(LifecycleEvent::SendScheduled {
                delivery_method: None,
                public_url: remote.public_url.clone(),
                invoice_version: remote.version,
            });
        } else if remote.status.is_published() {
            events.push(LifecycleEvent::Sent {
                delivery_method: None,
                public_url: remote.public_url.clone(),
                invoice_version: remote.version,
            });
        }
        if let Some(paid_to_date) = remote.paid_amount {
            events.push(LifecycleEvent::PaymentTotalReported {
                paid_to_date,
                external_ref: Some(invoice_id.clone()),
            });
        }
        match remote.status {
            RemoteStatus::Canceled => events.push(LifecycleEvent::ProviderCanceled),
            RemoteStatus::Failed => events.push(LifecycleEvent::ChargeFailed {
                reason: Some("reported by provider on refresh".to_string()),
            }),
            _ => {}
        }

        for event in &events {
            match self.drive(payment_id, event, "refresh", None).await {
                Ok(_) => {}
                Err(DriveError::Rejected(e)) => {
                    debug!(payment_id = %payment_id, event = event.name(), reason = %e, "Refresh step not applicable");
                }
                Err(DriveError::Failed(e)) => return Err(e),
            }
        }

        Ok(PaymentWithRemote {
            payment: self.load(payment_id).await?,
            remote: Some(remote),
        })
    }

    #[instrument(skip(self, input), fields(payment_id = %payment_id, reminder_type = %input.reminder_type))]
    pub async fn schedule_reminder(
        &self,
        payment_id: Uuid,
        input: ScheduleReminderInput,
    ) -> Result<PaymentReminder, PaymentError> {
        let payment = self.load(payment_id).await?;
        if payment.status.is_terminal() {
            return Err(PaymentError::InvalidTransition {
                from: payment.status,
                event: "schedule_reminder",
            });
        }
        let reminder = self
            .store
            .insert_reminder(NewReminder {
                payment_id,
                reminder_type: input.reminder_type,
                method: input.method,
                scheduled_at: input.scheduled_at,
                message: input.message,
            })
            .await?;
        Ok(reminder)
    }

    // ---------------------------------------------------------------------
    // Webhooks
    // ---------------------------------------------------------------------

    /// Apply a verified provider callback exactly once per event id.
    #[instrument(skip(self, webhook), fields(event_id = %webhook.event_id, event_type = %webhook.event_type))]
    pub async fn apply_webhook_event(&self, webhook: ParsedWebhook) -> WebhookOutcome {
        let outcome = self.reconcile(&webhook).await;
        WEBHOOK_EVENTS_TOTAL
            .with_label_values(&[webhook.event_type.as_str(), outcome.label()])
            .inc();
        match &outcome {
            WebhookOutcome::Processed { payment_id, status } => {
                info!(event_id = %webhook.event_id, payment_id = %payment_id, status = %status, "Webhook applied")
            }
            WebhookOutcome::Duplicate => {
                info!(event_id = %webhook.event_id, "Duplicate webhook delivery")
            }
            WebhookOutcome::Ignored { reason, .. } => {
                info!(event_id = %webhook.event_id, reason = %reason, "Webhook ignored")
            }
            WebhookOutcome::Failed { reason } => {
                warn!(event_id = %webhook.event_id, reason = %reason, "Webhook failed");
                ERRORS_TOTAL.with_label_values(&["webhook_failed"]).inc();
            }
        }
        outcome
    }

    async fn reconcile(&self, webhook: &ParsedWebhook) -> WebhookOutcome {
        let record = match self
            .store
            .log_webhook_event(NewWebhookEvent {
                event_id: webhook.event_id.clone(),
                event_type: webhook.event_type.clone(),
                source: webhook.source.to_string(),
                raw_payload: webhook.payload.clone(),
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                return WebhookOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        };
        if record.status == WebhookEventStatus::Processed {
            return WebhookOutcome::Duplicate;
        }

        let event = match parse_event(webhook) {
            Ok(event) => event,
            Err(e) => return self.ignore(&webhook.event_id, None, e.to_string()).await,
        };

        let payment = match self.resolve_payment(&event).await {
            Ok(Some(payment)) => payment,
            Ok(None) => {
                let reason = match &event {
                    WebhookEvent::Unknown { event_type } => {
                        format!("unhandled event type {}", event_type)
                    }
                    WebhookEvent::Refunded { order_id, .. } => {
                        format!("no payment for provider order {}", order_id)
                    }
                    other => format!(
                        "no payment for invoice {}",
                        other.invoice_id().unwrap_or_default()
                    ),
                };
                return self.ignore(&webhook.event_id, None, reason).await;
            }
            Err(e) => return self.fail(&webhook.event_id, None, e.to_string()).await,
        };

        let lifecycle_event = match to_lifecycle_event(&payment, webhook, event) {
            Ok(event) => event,
            Err(reason) => {
                return self
                    .ignore(&webhook.event_id, Some(payment.id), reason)
                    .await
            }
        };

        match self
            .drive(payment.id, &lifecycle_event, "webhook", Some(&webhook.event_id))
            .await
        {
            Ok(applied) => WebhookOutcome::Processed {
                payment_id: applied.payment.id,
                status: applied.payment.status,
            },
            Err(DriveError::Rejected(e)) => {
                self.ignore(&webhook.event_id, Some(payment.id), e.to_string())
                    .await
            }
            Err(DriveError::Failed(PaymentError::Store(StoreError::AlreadyProcessed(_)))) => {
                WebhookOutcome::Duplicate
            }
            Err(DriveError::Failed(PaymentError::AlreadyRecorded(reason))) => {
                self.ignore(&webhook.event_id, Some(payment.id), reason).await
            }
            Err(DriveError::Failed(PaymentError::NotFound(what))) => {
                self.ignore(&webhook.event_id, Some(payment.id), format!("{} not found", what))
                    .await
            }
            Err(DriveError::Failed(e)) => {
                self.fail(&webhook.event_id, Some(payment.id), e.to_string())
                    .await
            }
        }
    }

    async fn resolve_payment(&self, event: &WebhookEvent) -> Result<Option<Payment>, StoreError> {
        match event {
            WebhookEvent::Refunded { order_id, .. } => {
                self.store.get_payment_by_external_order_id(order_id).await
            }
            WebhookEvent::Unknown { .. } => Ok(None),
            other => match other.invoice_id() {
                Some(invoice_id) => self.store.get_payment_by_external_invoice_id(invoice_id).await,
                None => Ok(None),
            },
        }
    }

    async fn ignore(&self, event_id: &str, payment_id: Option<Uuid>, reason: String) -> WebhookOutcome {
        match self
            .store
            .mark_webhook_event(
                event_id,
                WebhookEventStatus::Ignored,
                payment_id,
                Some(reason.clone()),
            )
            .await
        {
            Ok(_) => WebhookOutcome::Ignored { payment_id, reason },
            Err(StoreError::AlreadyProcessed(_)) => WebhookOutcome::Duplicate,
            Err(e) => WebhookOutcome::Failed {
                reason: e.to_string(),
            },
        }
    }

    async fn fail(&self, event_id: &str, payment_id: Option<Uuid>, reason: String) -> WebhookOutcome {
        match self
            .store
            .mark_webhook_event(
                event_id,
                WebhookEventStatus::Failed,
                payment_id,
                Some(reason.clone()),
            )
            .await
        {
            Err(StoreError::AlreadyProcessed(_)) => WebhookOutcome::Duplicate,
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "Could not record webhook failure");
                WebhookOutcome::Failed { reason }
            }
            Ok(_) => WebhookOutcome::Failed { reason },
        }
    }

    // ---------------------------------------------------------------------
    // Reads
    // ---------------------------------------------------------------------

    pub async fn get_payment_details(&self, payment_id: Uuid) -> Result<PaymentDetails, PaymentError> {
        self.store
            .get_payment_details(payment_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment {}", payment_id)))
    }

    pub async fn list_payments(
        &self,
        filter: &ListPaymentsFilter,
    ) -> Result<Page<Payment>, PaymentError> {
        Ok(self.store.list_payments(filter).await?)
    }

    pub async fn latest_payment_for_order(&self, order_id: Uuid) -> Result<Payment, PaymentError> {
        self.store
            .latest_payment_for_order(order_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound(format!("payment for order {}", order_id)))
    }

    /// Latest payment for the order with a best-effort provider snapshot.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn order_status(&self, order_id: Uuid) -> Result<PaymentWithRemote, PaymentError> {
        let payment = self.latest_payment_for_order(order_id).await?;
        let remote = match payment.square_invoice_id.as_deref() {
            Some(invoice_id) => self
                .call_provider("get_invoice_status", self.provider.get_invoice_status(invoice_id))
                .await
                .map_err(|e| {
                    warn!(payment_id = %payment.id, error = %e, "Remote status unavailable");
                })
                .ok(),
            None => None,
        };
        Ok(PaymentWithRemote { payment, remote })
    }

    // ---------------------------------------------------------------------
    // Internals
    // ---------------------------------------------------------------------

    /// Read, plan, compare-and-set; re-plan on a version conflict.
    async fn drive(
        &self,
        payment_id: Uuid,
        event: &LifecycleEvent,
        trigger: &'static str,
        claim_event_id: Option<&str>,
    ) -> Result<AppliedChange, DriveError> {
        let policy = self.policy();

        for attempt in 1..=MAX_ATTEMPTS {
            let current = self.load(payment_id).await.map_err(DriveError::Failed)?;
            let plan = plan(&current, event, &policy, Utc::now()).map_err(DriveError::Rejected)?;

            let change = LedgerChange {
                payment_id,
                expected_version: current.version,
                update: plan.update,
                transaction: plan.transaction,
                claim_event_id: claim_event_id.map(str::to_string),
            };
            match self.store.apply_change(change).await {
                Ok(applied) => {
                    self.after_change(&current, &applied, plan.new_status, plan.overpaid, trigger)
                        .await;
                    return Ok(applied);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(
                        payment_id = %payment_id,
                        attempt,
                        event = event.name(),
                        "Version conflict, re-planning"
                    );
                }
                Err(e) => return Err(DriveError::Failed(e.into())),
            }
        }

        warn!(payment_id = %payment_id, event = event.name(), "Gave up after repeated version conflicts");
        ERRORS_TOTAL.with_label_values(&["version_conflict"]).inc();
        Err(DriveError::Failed(PaymentError::Conflict(payment_id.to_string())))
    }

    async fn after_change(
        &self,
        before: &Payment,
        applied: &AppliedChange,
        new_status: Option<PaymentStatus>,
        overpaid: bool,
        trigger: &'static str,
    ) {
        let payment = &applied.payment;

        if let Some(transaction) = &applied.transaction {
            TRANSACTION_AMOUNT_TOTAL
                .with_label_values(&[transaction.transaction_type.as_str(), payment.currency.as_str()])
                .inc_by(transaction.amount.unsigned_abs() as f64);
        }

        if overpaid {
            warn!(
                payment_id = %payment.id,
                paid_amount = payment.paid_amount,
                total_amount = payment.total_amount,
                "Payment received more than the invoice total"
            );
            ERRORS_TOTAL.with_label_values(&["overpayment"]).inc();
        }

        if let Some(to) = new_status {
            PAYMENT_TRANSITIONS_TOTAL
                .with_label_values(&[to.as_str(), trigger])
                .inc();
            info!(
                payment_id = %payment.id,
                from = %before.status,
                to = %to,
                trigger,
                "Payment status changed"
            );

            if matches!(to, PaymentStatus::Paid | PaymentStatus::Canceled) {
                match self.store.cancel_scheduled_reminders(payment.id).await {
                    Ok(0) => {}
                    Ok(count) => {
                        debug!(payment_id = %payment.id, count, "Canceled scheduled reminders")
                    }
                    Err(e) => {
                        warn!(payment_id = %payment.id, error = %e, "Failed to cancel scheduled reminders")
                    }
                }
            }
        }
    }

    /// Run a provider call under the adapter timeout, with metrics.
    async fn call_provider<T, F>(&self, operation: &'static str, call: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let timeout = self.billing.adapter_timeout();
        let timer = PROVIDER_CALL_DURATION
            .with_label_values(&[operation])
            .start_timer();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };
        timer.observe_duration();

        let label = match &result {
            Ok(_) => "ok",
            Err(ProviderError::Timeout(_)) => "timeout",
            Err(_) => "error",
        };
        PROVIDER_CALLS_TOTAL
            .with_label_values(&[operation, label])
            .inc();
        if let Err(e) = &result {
            warn!(provider = self.provider.name(), operation, error = %e, "Invoice provider call failed");
            ERRORS_TOTAL.with_label_values(&["provider_error"]).inc();
        }
        result
    }
}

fn published_event(payment: &Payment, invoice: InvoiceSnapshot) -> LifecycleEvent {
    let scheduled = invoice
        .status
        .as_deref()
        .map(RemoteStatus::from_provider)
        == Some(RemoteStatus::Scheduled);
    if scheduled && payment.status == PaymentStatus::Draft {
        LifecycleEvent::SendScheduled {
            delivery_method: None,
            public_url: invoice.public_url,
            invoice_version: invoice.version,
        }
    } else {
        LifecycleEvent::Sent {
            delivery_method: None,
            public_url: invoice.public_url,
            invoice_version: invoice.version,
        }
    }
}

fn reminder_method_for(delivery_method: DeliveryMethod) -> Option<ReminderMethod> {
    match delivery_method {
        DeliveryMethod::Email => Some(ReminderMethod::Email),
        DeliveryMethod::Sms => Some(ReminderMethod::Sms),
        DeliveryMethod::ShareManually => None,
    }
}

/// Translate a provider event for `payment`. `Err` carries the reason to
/// ignore it.
fn to_lifecycle_event(
    payment: &Payment,
    webhook: &ParsedWebhook,
    event: WebhookEvent,
) -> Result<LifecycleEvent, String> {
    let event = match event {
        WebhookEvent::Published(invoice) => published_event(payment, invoice),
        WebhookEvent::Viewed(_) => LifecycleEvent::Viewed,
        WebhookEvent::PaymentMade {
            paid_to_date,
            invoice,
        } => LifecycleEvent::PaymentTotalReported {
            paid_to_date,
            external_ref: Some(format!("{}:{}", invoice.invoice_id, webhook.event_id)),
        },
        WebhookEvent::Canceled(_) => LifecycleEvent::ProviderCanceled,
        WebhookEvent::ChargeFailed(_) => LifecycleEvent::ChargeFailed {
            reason: Some("scheduled charge failed".to_string()),
        },
        // A refund already on the ledger is rejected by the store inside the
        // same change that would record it.
        WebhookEvent::Refunded {
            refund_id,
            order_id,
            payment_id,
            amount,
            status,
        } => {
            if status != "COMPLETED" {
                return Err(format!("refund {} is {}", refund_id, status));
            }
            LifecycleEvent::Refund {
                amount,
                external_ref: Some(refund_id),
                metadata: Some(json!({
                    "order_id": order_id,
                    "event_id": webhook.event_id,
                })),
                provider_payment_id: payment_id,
            }
        }
        WebhookEvent::Unknown { event_type } => {
            return Err(format!("unhandled event type {}", event_type))
        }
    };
    Ok(event)
}

/// The single line item billed for a rental order.
fn rental_line_item(payment: &NewPayment, tax_rate_bps: u32) -> NewLineItem {
    let name = match payment.dumpster_size.as_deref().map(str::trim) {
        Some(size) if !size.is_empty() => format!("{} Yard Dumpster Rental", size),
        _ => "Dumpster Rental".to_string(),
    };
    let description = match (payment.scheduled_delivery_date, payment.scheduled_pickup_date) {
        (Some(delivery), Some(pickup)) => Some(format!("Delivery {} - Pickup {}", delivery, pickup)),
        (Some(delivery), None) => Some(format!("Delivery {}", delivery)),
        (None, Some(pickup)) => Some(format!("Pickup {}", pickup)),
        (None, None) => None,
    };
    NewLineItem {
        name,
        description,
        quantity: 1,
        unit_price: payment.subtotal_amount,
        total_price: Some(payment.subtotal_amount),
        tax_rate_bps: i32::try_from(tax_rate_bps).ok(),
        tax_amount: Some(payment.tax_amount),
        category: Some("rental".to_string()),
        sku: payment
            .dumpster_size
            .as_deref()
            .map(|size| format!("DUMPSTER-{}YD", size.trim())),
    }
}
