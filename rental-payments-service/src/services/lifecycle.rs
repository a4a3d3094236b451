//! Payment status transition table.
//!
//! [`plan`] is pure: given the current payment and an event it returns the
//! exact ledger mutation to perform, or why the event does not apply. The
//! manager feeds the plan to `LedgerStore::apply_change` and re-plans on a
//! version conflict.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::models::{
    DeliveryMethod, NewTransaction, Payment, PaymentStatus, PaymentUpdate, TransactionType,
};
use PaymentStatus::*;

/// What to do with a refund that leaves money on the payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialRefundPolicy {
    /// PAID or PARTIALLY_PAID stays where it is.
    #[default]
    KeepStatus,
    /// Any refund moves the payment to REFUNDED.
    MarkRefunded,
}

impl FromStr for PartialRefundPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "keep_status" | "keep" => Ok(PartialRefundPolicy::KeepStatus),
            "mark_refunded" | "refunded" => Ok(PartialRefundPolicy::MarkRefunded),
            other => Err(format!(
                "expected 'keep_status' or 'mark_refunded', got '{}'",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LifecyclePolicy {
    pub partial_refund: PartialRefundPolicy,
}

/// Remote identifiers captured after the provider created the invoice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteRefs {
    pub invoice_id: String,
    pub invoice_version: Option<i32>,
    pub customer_id: Option<String>,
    pub order_id: Option<String>,
    pub location_id: Option<String>,
    pub public_url: Option<String>,
}

/// Everything that can move a payment.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    RemoteInvoiceCreated(RemoteRefs),
    /// Provider accepted the send but will deliver later.
    SendScheduled {
        delivery_method: Option<DeliveryMethod>,
        public_url: Option<String>,
        invoice_version: Option<i32>,
    },
    /// Admin send, or the provider reporting the invoice as published.
    Sent {
        delivery_method: Option<DeliveryMethod>,
        public_url: Option<String>,
        invoice_version: Option<i32>,
    },
    Viewed,
    /// A payment of a known amount.
    PaymentMade {
        amount: i64,
        external_ref: Option<String>,
        metadata: Option<serde_json::Value>,
    },
    /// The provider reported the cumulative amount collected so far; only
    /// the part not yet recorded is charged.
    PaymentTotalReported {
        paid_to_date: i64,
        external_ref: Option<String>,
    },
    Cancel {
        reason: Option<String>,
    },
    ProviderCanceled,
    DueDatePassed,
    ChargeFailed {
        reason: Option<String>,
    },
    Refund {
        amount: i64,
        external_ref: Option<String>,
        metadata: Option<serde_json::Value>,
        /// Provider payment the refund was issued against.
        provider_payment_id: Option<String>,
    },
    /// FEE or ADJUSTMENT entries. Status and totals are untouched.
    LedgerEntry {
        transaction_type: TransactionType,
        amount: i64,
        external_ref: Option<String>,
        metadata: Option<serde_json::Value>,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::RemoteInvoiceCreated(_) => "remote_invoice_created",
            LifecycleEvent::SendScheduled { .. } => "send_scheduled",
            LifecycleEvent::Sent { .. } => "sent",
            LifecycleEvent::Viewed => "viewed",
            LifecycleEvent::PaymentMade { .. } => "payment_made",
            LifecycleEvent::PaymentTotalReported { .. } => "payment_made",
            LifecycleEvent::Cancel { .. } => "cancel",
            LifecycleEvent::ProviderCanceled => "provider_canceled",
            LifecycleEvent::DueDatePassed => "due_date_passed",
            LifecycleEvent::ChargeFailed { .. } => "charge_failed",
            LifecycleEvent::Refund { .. } => "refund",
            LifecycleEvent::LedgerEntry { .. } => "ledger_entry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot apply '{event}' to a payment in status {from}")]
pub struct InvalidTransition {
    pub from: PaymentStatus,
    pub event: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error("invalid amount: {0}")]
    Amount(String),

    /// The event carries nothing that is not already recorded.
    #[error("nothing to apply: {0}")]
    NothingToApply(String),
}

/// The mutation to perform for one event.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub update: PaymentUpdate,
    pub transaction: Option<NewTransaction>,
    /// Status after the change, when it differs from the current one.
    pub new_status: Option<PaymentStatus>,
    /// More money arrived than the invoice total. Manual charges record
    /// all of it; provider-reported totals are capped at the total.
    pub overpaid: bool,
}

impl Plan {
    fn status_change(payment: &Payment, to: PaymentStatus) -> Self {
        Plan {
            update: PaymentUpdate {
                status: Some(to),
                ..Default::default()
            },
            transaction: None,
            new_status: (payment.status != to).then_some(to),
            overpaid: false,
        }
    }
}

fn require(
    payment: &Payment,
    event: &LifecycleEvent,
    allowed: &[PaymentStatus],
) -> Result<(), InvalidTransition> {
    if allowed.contains(&payment.status) {
        Ok(())
    } else {
        Err(InvalidTransition {
            from: payment.status,
            event: event.name(),
        })
    }
}

fn require_non_terminal(payment: &Payment, event: &LifecycleEvent) -> Result<(), InvalidTransition> {
    if payment.status.is_terminal() {
        Err(InvalidTransition {
            from: payment.status,
            event: event.name(),
        })
    } else {
        Ok(())
    }
}

fn appended_note(existing: Option<&str>, note: &str) -> String {
    match existing.map(str::trim).filter(|s| !s.is_empty()) {
        Some(existing) => format!("{}\n{}", existing, note),
        None => note.to_string(),
    }
}

/// Compute the mutation `event` causes on `payment`.
pub fn plan(
    payment: &Payment,
    event: &LifecycleEvent,
    policy: &LifecyclePolicy,
    now: DateTime<Utc>,
) -> Result<Plan, PlanError> {
    match event {
        LifecycleEvent::RemoteInvoiceCreated(refs) => {
            require(payment, event, &[Draft])?;
            Ok(Plan {
                update: PaymentUpdate {
                    square_invoice_id: Some(refs.invoice_id.clone()),
                    square_invoice_version: refs.invoice_version,
                    square_customer_id: refs.customer_id.clone(),
                    square_order_id: refs.order_id.clone(),
                    square_location_id: refs.location_id.clone(),
                    public_payment_url: refs.public_url.clone(),
                    ..Default::default()
                },
                transaction: None,
                new_status: None,
                overpaid: false,
            })
        }

        LifecycleEvent::SendScheduled {
            delivery_method,
            public_url,
            invoice_version,
        } => {
            require(payment, event, &[Draft])?;
            let mut plan = Plan::status_change(payment, Pending);
            plan.update.delivery_method = *delivery_method;
            plan.update.public_payment_url = public_url.clone();
            plan.update.square_invoice_version = *invoice_version;
            Ok(plan)
        }

        LifecycleEvent::Sent {
            delivery_method,
            public_url,
            invoice_version,
        } => {
            require(payment, event, &[Draft, Pending])?;
            let mut plan = Plan::status_change(payment, Sent);
            plan.update.delivery_method = *delivery_method;
            plan.update.public_payment_url = public_url.clone();
            plan.update.square_invoice_version = *invoice_version;
            plan.update.sent_at = Some(now);
            Ok(plan)
        }

        LifecycleEvent::Viewed => {
            require(payment, event, &[Sent])?;
            let mut plan = Plan::status_change(payment, Viewed);
            plan.update.viewed_at = Some(now);
            Ok(plan)
        }

        LifecycleEvent::PaymentMade {
            amount,
            external_ref,
            metadata,
        } => plan_charge(
            payment,
            event,
            *amount,
            external_ref.clone(),
            metadata.clone(),
            now,
        ),

        LifecycleEvent::PaymentTotalReported {
            paid_to_date,
            external_ref,
        } => {
            // Terminal states reject before the amount is even looked at.
            require_non_terminal(payment, event)?;
            let reported = paid_to_date - payment.paid_amount;
            // Provider totals settle the invoice at most; only manual charges overpay.
            let amount = reported.min(payment.balance_due());
            if amount <= 0 {
                return Err(PlanError::NothingToApply(format!(
                    "provider reports {} collected, {} already recorded",
                    paid_to_date, payment.paid_amount
                )));
            }
            let excess = reported - amount;
            let mut metadata = serde_json::json!({ "paid_to_date": paid_to_date });
            if excess > 0 {
                metadata["excess"] = serde_json::json!(excess);
            }
            let mut plan =
                plan_charge(payment, event, amount, external_ref.clone(), Some(metadata), now)?;
            plan.overpaid = excess > 0;
            Ok(plan)
        }

        LifecycleEvent::Cancel { reason } => {
            require(payment, event, &[Draft, Pending, Sent, Viewed, PartiallyPaid])?;
            let mut plan = Plan::status_change(payment, Canceled);
            plan.update.canceled_at = Some(now);
            let note = match reason.as_deref().map(str::trim).filter(|r| !r.is_empty()) {
                Some(reason) => format!("Canceled: {}", reason),
                None => "Canceled".to_string(),
            };
            plan.update.notes = Some(appended_note(payment.notes.as_deref(), &note));
            Ok(plan)
        }

        LifecycleEvent::ProviderCanceled => {
            require_non_terminal(payment, event)?;
            let mut plan = Plan::status_change(payment, Canceled);
            plan.update.canceled_at = Some(now);
            plan.update.notes = Some(appended_note(
                payment.notes.as_deref(),
                "Canceled by payment provider",
            ));
            Ok(plan)
        }

        LifecycleEvent::DueDatePassed => {
            require(payment, event, &[Sent, Viewed])?;
            Ok(Plan::status_change(payment, Overdue))
        }

        LifecycleEvent::ChargeFailed { reason } => {
            require(payment, event, &[Pending, Sent, Viewed, Overdue])?;
            let mut plan = Plan::status_change(payment, Failed);
            plan.update.failed_at = Some(now);
            if let Some(reason) = reason.as_deref().filter(|r| !r.trim().is_empty()) {
                plan.update.notes = Some(appended_note(
                    payment.notes.as_deref(),
                    &format!("Charge failed: {}", reason),
                ));
            }
            Ok(plan)
        }

        LifecycleEvent::Refund {
            amount,
            external_ref,
            metadata,
            provider_payment_id,
        } => {
            require(payment, event, &[Paid, PartiallyPaid])?;
            TransactionType::Refund
                .validate_amount(*amount)
                .map_err(PlanError::Amount)?;
            let refundable = payment.refundable_amount();
            if *amount > refundable {
                return Err(PlanError::Amount(format!(
                    "refund of {} exceeds refundable amount {}",
                    amount, refundable
                )));
            }

            let refunded = payment.refunded_amount + amount;
            let fully_refunded = refunded >= payment.paid_amount;
            let to = if fully_refunded || policy.partial_refund == PartialRefundPolicy::MarkRefunded
            {
                Refunded
            } else {
                payment.status
            };

            Ok(Plan {
                update: PaymentUpdate {
                    status: Some(to),
                    refunded_amount: Some(refunded),
                    square_payment_id: provider_payment_id.clone(),
                    ..Default::default()
                },
                transaction: Some(NewTransaction::completed(
                    payment.id,
                    TransactionType::Refund,
                    *amount,
                    external_ref.clone(),
                    metadata.clone(),
                )),
                new_status: (payment.status != to).then_some(to),
                overpaid: false,
            })
        }

        LifecycleEvent::LedgerEntry {
            transaction_type,
            amount,
            external_ref,
            metadata,
        } => {
            if matches!(transaction_type, TransactionType::Charge | TransactionType::Refund) {
                return Err(PlanError::Amount(format!(
                    "{} entries must go through the payment or refund path",
                    transaction_type
                )));
            }
            transaction_type
                .validate_amount(*amount)
                .map_err(PlanError::Amount)?;
            Ok(Plan {
                update: PaymentUpdate::default(),
                transaction: Some(NewTransaction::completed(
                    payment.id,
                    *transaction_type,
                    *amount,
                    external_ref.clone(),
                    metadata.clone(),
                )),
                new_status: None,
                overpaid: false,
            })
        }
    }
}

fn plan_charge(
    payment: &Payment,
    event: &LifecycleEvent,
    amount: i64,
    external_ref: Option<String>,
    metadata: Option<serde_json::Value>,
    now: DateTime<Utc>,
) -> Result<Plan, PlanError> {
    TransactionType::Charge
        .validate_amount(amount)
        .map_err(PlanError::Amount)?;

    let to = if payment.is_fully_paid_with(amount) {
        require_non_terminal(payment, event)?;
        Paid
    } else {
        require(payment, event, &[Sent, Viewed, PartiallyPaid])?;
        PartiallyPaid
    };

    let paid = payment.paid_amount + amount;
    let mut update = PaymentUpdate {
        status: Some(to),
        paid_amount: Some(paid),
        ..Default::default()
    };
    if to == Paid {
        update.paid_at = Some(now);
    }

    Ok(Plan {
        update,
        transaction: Some(NewTransaction::completed(
            payment.id,
            TransactionType::Charge,
            amount,
            external_ref,
            metadata,
        )),
        new_status: (payment.status != to).then_some(to),
        overpaid: paid > payment.total_amount,
    })
}
