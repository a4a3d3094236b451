//! In-process invoice provider.
//!
//! Selected with `PAYMENTS_PROVIDER=mock` and used by the integration tests.
//! Keeps invoices in memory, records every call, and can be told to fail or
//! stall. Webhooks are verified with the same HMAC scheme as Square.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{
    parse_envelope, verify_square_signature, CreateInvoiceOptions, InvoiceProvider, ParsedWebhook,
    ProviderError, RemoteInvoice, RemoteInvoiceStatus, RemoteStatus,
};
use crate::models::{Order, Payment};

#[derive(Debug, Clone)]
struct MockInvoice {
    id: String,
    version: i32,
    status: RemoteStatus,
    public_url: String,
    paid_amount: i64,
}

impl MockInvoice {
    fn snapshot(&self) -> RemoteInvoiceStatus {
        RemoteInvoiceStatus {
            external_id: self.id.clone(),
            status: self.status.clone(),
            version: Some(self.version),
            public_url: Some(self.public_url.clone()),
            paid_amount: Some(self.paid_amount),
        }
    }
}

#[derive(Default)]
struct MockState {
    invoices: HashMap<String, MockInvoice>,
    by_idempotency_key: HashMap<String, String>,
    calls: Vec<String>,
    failure: Option<String>,
    delay: Option<Duration>,
    schedule_sends: bool,
    counter: u64,
}

pub struct MockInvoiceProvider {
    signature_key: String,
    notification_url: String,
    state: Mutex<MockState>,
}

impl MockInvoiceProvider {
    pub fn new(signature_key: impl Into<String>, notification_url: impl Into<String>) -> Self {
        Self {
            signature_key: signature_key.into(),
            notification_url: notification_url.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail every call with an API error until cleared with `None`.
    pub fn set_failure(&self, message: Option<&str>) {
        self.state().failure = message.map(str::to_string);
    }

    /// Stall every call for `delay` before answering.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// Report sends as SCHEDULED instead of UNPAID.
    pub fn schedule_sends(&self, scheduled: bool) {
        self.state().schedule_sends = scheduled;
    }

    /// Simulate money collected on the remote invoice.
    pub fn set_paid_amount(&self, external_id: &str, paid_amount: i64) {
        if let Some(invoice) = self.state().invoices.get_mut(external_id) {
            invoice.paid_amount = paid_amount;
            invoice.version += 1;
        }
    }

    pub fn set_remote_status(&self, external_id: &str, status: RemoteStatus) {
        if let Some(invoice) = self.state().invoices.get_mut(external_id) {
            invoice.status = status;
            invoice.version += 1;
        }
    }

    /// Calls received so far, as `operation:argument`.
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Signature header value for `body`, as the provider would send it.
    pub fn sign(&self, body: &str) -> String {
        service_core::utils::signature::hmac_sha256_base64(
            &self.signature_key,
            &format!("{}{}", self.notification_url, body),
        )
        .unwrap_or_default()
    }

    async fn enter(&self, call: String) -> Result<(), ProviderError> {
        let (delay, failure) = {
            let mut state = self.state();
            state.calls.push(call);
            (state.delay, state.failure.clone())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(message) => Err(ProviderError::Api {
                status: 503,
                message,
            }),
            None => Ok(()),
        }
    }

    fn with_invoice<T>(
        &self,
        external_id: &str,
        f: impl FnOnce(&mut MockInvoice, bool) -> T,
    ) -> Result<T, ProviderError> {
        let mut state = self.state();
        let scheduled = state.schedule_sends;
        let invoice = state
            .invoices
            .get_mut(external_id)
            .ok_or_else(|| ProviderError::Api {
                status: 404,
                message: format!("NOT_FOUND: invoice {} does not exist", external_id),
            })?;
        Ok(f(invoice, scheduled))
    }
}

#[async_trait]
impl InvoiceProvider for MockInvoiceProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_invoice(
        &self,
        payment: &Payment,
        _order: &Order,
        options: &CreateInvoiceOptions,
    ) -> Result<RemoteInvoice, ProviderError> {
        self.enter(format!("create:{}", payment.id)).await?;

        let mut state = self.state();
        let existing = state
            .by_idempotency_key
            .get(&options.idempotency_key)
            .and_then(|id| state.invoices.get(id))
            .cloned();
        let invoice = match existing {
            Some(invoice) => invoice,
            None => {
                state.counter += 1;
                let id = format!("inv_mock_{:04}", state.counter);
                let invoice = MockInvoice {
                    id: id.clone(),
                    version: 0,
                    status: RemoteStatus::Draft,
                    public_url: format!("https://pay.example.test/invoice/{}", id),
                    paid_amount: 0,
                };
                state.invoices.insert(id.clone(), invoice.clone());
                state
                    .by_idempotency_key
                    .insert(options.idempotency_key.clone(), id);
                invoice
            }
        };

        Ok(RemoteInvoice {
            external_id: invoice.id.clone(),
            version: invoice.version,
            status: invoice.status.clone(),
            public_url: None,
            customer_id: Some(format!("cust_mock_{}", payment.order_id.simple())),
            order_id: Some(format!("ord_{}", invoice.id)),
            location_id: payment.square_location_id.clone(),
        })
    }

    async fn send_invoice(&self, external_id: &str) -> Result<RemoteInvoiceStatus, ProviderError> {
        self.enter(format!("send:{}", external_id)).await?;
        self.with_invoice(external_id, |invoice, scheduled| {
            if invoice.status == RemoteStatus::Draft {
                invoice.status = if scheduled {
                    RemoteStatus::Scheduled
                } else {
                    RemoteStatus::Unpaid
                };
                invoice.version += 1;
            }
            invoice.snapshot()
        })
    }

    async fn get_invoice_status(
        &self,
        external_id: &str,
    ) -> Result<RemoteInvoiceStatus, ProviderError> {
        self.enter(format!("status:{}", external_id)).await?;
        self.with_invoice(external_id, |invoice, _| invoice.snapshot())
    }

    async fn cancel_invoice(
        &self,
        external_id: &str,
        _reason: Option<&str>,
    ) -> Result<RemoteInvoiceStatus, ProviderError> {
        self.enter(format!("cancel:{}", external_id)).await?;
        self.with_invoice(external_id, |invoice, _| {
            invoice.status = RemoteStatus::Canceled;
            invoice.version += 1;
            invoice.snapshot()
        })
    }

    fn verify_and_parse_webhook(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<ParsedWebhook, ProviderError> {
        verify_square_signature(&self.signature_key, &self.notification_url, raw_body, signature)?;
        parse_envelope(self.name(), raw_body)
    }
}
