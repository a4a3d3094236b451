//! Square Invoices API client.
//!
//! Creating an invoice takes three calls: find or create the customer by
//! email, create an order at the configured location, then create the
//! invoice with a single BALANCE payment request. Each create carries an
//! idempotency key derived from the payment id, so repeating it returns
//! the original object.

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{
    parse_envelope, verify_square_signature, CreateInvoiceOptions, InvoiceProvider, ParsedWebhook,
    ProviderError, RemoteInvoice, RemoteInvoiceStatus, RemoteStatus,
};
use crate::config::SquareConfig;
use crate::models::{Order, Payment};
use crate::services::webhook::SquareInvoice;

/// Square client for interacting with the Square REST API.
#[derive(Clone)]
pub struct SquareInvoiceProvider {
    client: Client,
    config: SquareConfig,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
struct CustomerSearchResponse {
    #[serde(default)]
    customers: Vec<IdOnly>,
}

#[derive(Debug, Deserialize)]
struct CustomerResponse {
    customer: IdOnly,
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    order: IdOnly,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    invoice: SquareInvoice,
}

/// Square API error response.
#[derive(Debug, Deserialize)]
struct SquareErrors {
    #[serde(default)]
    errors: Vec<SquareErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct SquareErrorDetail {
    code: String,
    detail: Option<String>,
}

fn to_status(invoice: &SquareInvoice) -> RemoteInvoiceStatus {
    RemoteInvoiceStatus {
        external_id: invoice.id.clone(),
        status: RemoteStatus::from_provider(invoice.status.as_deref().unwrap_or_default()),
        version: invoice.version,
        public_url: invoice.public_url.clone(),
        paid_amount: invoice.paid_to_date(),
    }
}

impl SquareInvoiceProvider {
    /// Create a new Square client.
    pub fn new(config: SquareConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    /// Check if Square is configured (credentials are set).
    pub fn is_configured(&self) -> bool {
        !self.config.access_token.expose_secret().is_empty() && !self.config.location_id.is_empty()
    }

    async fn call<B, R>(&self, method: Method, path: &str, body: Option<&B>) -> Result<R, ProviderError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        if !self.is_configured() {
            return Err(ProviderError::NotConfigured(
                "Square access token or location id not configured".to_string(),
            ));
        }

        let url = format!("{}{}", self.config.api_base_url.trim_end_matches('/'), path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .bearer_auth(self.config.access_token.expose_secret())
            .header("Square-Version", &self.config.api_version)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;

        debug!(method = %method, path = %path, status = %status, "Square API response");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited);
        }
        if !status.is_success() {
            let message = serde_json::from_str::<SquareErrors>(&text)
                .ok()
                .filter(|e| !e.errors.is_empty())
                .map(|e| {
                    e.errors
                        .iter()
                        .map(|d| match &d.detail {
                            Some(detail) => format!("{}: {}", d.code, detail),
                            None => d.code.clone(),
                        })
                        .collect::<Vec<_>>()
                        .join("; ")
                })
                .unwrap_or_else(|| format!("unexpected response body: {}", text));
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        serde_json::from_str(&text).map_err(|e| {
            ProviderError::InvalidResponse(format!("{} {}: {}", method, path, e))
        })
    }

    async fn fetch_invoice(&self, external_id: &str) -> Result<SquareInvoice, ProviderError> {
        let path = format!("/v2/invoices/{}", external_id);
        let response: InvoiceResponse = self.call::<(), _>(Method::GET, &path, None).await?;
        Ok(response.invoice)
    }

    /// Reuse the customer with this email, or create one.
    async fn resolve_customer(&self, payment: &Payment, order: &Order) -> Result<String, ProviderError> {
        if let Some(email) = order.email.as_deref().filter(|e| !e.trim().is_empty()) {
            let search = json!({
                "query": { "filter": { "email_address": { "exact": email.trim() } } },
                "limit": 1
            });
            let found: CustomerSearchResponse = self
                .call(Method::POST, "/v2/customers/search", Some(&search))
                .await?;
            if let Some(customer) = found.customers.into_iter().next() {
                return Ok(customer.id);
            }
        }

        let body = json!({
            "idempotency_key": format!("{}-customer", payment.id),
            "given_name": order.first_name,
            "family_name": order.last_name,
            "email_address": order.email,
            "phone_number": order.phone,
            "reference_id": order.order_number,
        });
        let created: CustomerResponse = self.call(Method::POST, "/v2/customers", Some(&body)).await?;
        info!(customer_id = %created.customer.id, "Square customer created");
        Ok(created.customer.id)
    }

    async fn create_order(
        &self,
        payment: &Payment,
        customer_id: &str,
        location_id: &str,
    ) -> Result<String, ProviderError> {
        let rental_name = match payment.dumpster_size.as_deref() {
            Some(size) => format!("{} Yard Dumpster Rental", size),
            None => "Dumpster Rental".to_string(),
        };
        let mut line_items = vec![json!({
            "name": rental_name,
            "quantity": "1",
            "base_price_money": { "amount": payment.subtotal_amount, "currency": payment.currency },
        })];
        if payment.tax_amount > 0 {
            line_items.push(json!({
                "name": "Sales Tax",
                "quantity": "1",
                "base_price_money": { "amount": payment.tax_amount, "currency": payment.currency },
            }));
        }

        let body = json!({
            "idempotency_key": format!("{}-order", payment.id),
            "order": {
                "location_id": location_id,
                "customer_id": customer_id,
                "reference_id": payment.payment_number,
                "line_items": line_items,
            }
        });
        let created: OrderResponse = self.call(Method::POST, "/v2/orders", Some(&body)).await?;
        Ok(created.order.id)
    }
}

#[async_trait]
impl InvoiceProvider for SquareInvoiceProvider {
    fn name(&self) -> &'static str {
        "square"
    }

    #[instrument(skip(self, payment, order, options), fields(payment_id = %payment.id))]
    async fn create_invoice(
        &self,
        payment: &Payment,
        order: &Order,
        options: &CreateInvoiceOptions,
    ) -> Result<RemoteInvoice, ProviderError> {
        let location_id = payment
            .square_location_id
            .clone()
            .unwrap_or_else(|| self.config.location_id.clone());

        let customer_id = self.resolve_customer(payment, order).await?;
        let order_id = self.create_order(payment, &customer_id, &location_id).await?;

        let mut invoice = json!({
            "location_id": location_id,
            "order_id": order_id,
            "primary_recipient": { "customer_id": customer_id },
            "payment_requests": [{
                "request_type": "BALANCE",
                "due_date": options.due_date.format("%Y-%m-%d").to_string(),
            }],
            "delivery_method": options.delivery_method.as_str(),
            "invoice_number": payment.payment_number,
            "accepted_payment_methods": { "card": true, "bank_account": true },
        });
        if let Some(title) = &options.title {
            invoice["title"] = json!(title);
        }
        if let Some(message) = &options.message {
            invoice["description"] = json!(message);
        }

        let body = json!({
            "idempotency_key": options.idempotency_key,
            "invoice": invoice,
        });
        let created: InvoiceResponse = self.call(Method::POST, "/v2/invoices", Some(&body)).await?;
        let invoice = created.invoice;

        info!(invoice_id = %invoice.id, order_id = %order_id, "Square invoice created");

        Ok(RemoteInvoice {
            external_id: invoice.id.clone(),
            version: invoice.version.unwrap_or_default(),
            status: RemoteStatus::from_provider(invoice.status.as_deref().unwrap_or("DRAFT")),
            public_url: invoice.public_url.clone(),
            customer_id: invoice
                .primary_recipient
                .and_then(|r| r.customer_id)
                .or(Some(customer_id)),
            order_id: invoice.order_id.or(Some(order_id)),
            location_id: invoice.location_id.or(Some(location_id)),
        })
    }

    #[instrument(skip(self))]
    async fn send_invoice(&self, external_id: &str) -> Result<RemoteInvoiceStatus, ProviderError> {
        let current = self.fetch_invoice(external_id).await?;
        let version = current.version.unwrap_or_default();
        let body = json!({
            "version": version,
            "idempotency_key": format!("{}-publish-{}", external_id, version),
        });
        let path = format!("/v2/invoices/{}/publish", external_id);
        let published: InvoiceResponse = self.call(Method::POST, &path, Some(&body)).await?;

        info!(invoice_id = %external_id, status = ?published.invoice.status, "Square invoice published");

        Ok(to_status(&published.invoice))
    }

    #[instrument(skip(self))]
    async fn get_invoice_status(
        &self,
        external_id: &str,
    ) -> Result<RemoteInvoiceStatus, ProviderError> {
        let invoice = self.fetch_invoice(external_id).await?;
        Ok(to_status(&invoice))
    }

    #[instrument(skip(self))]
    async fn cancel_invoice(
        &self,
        external_id: &str,
        reason: Option<&str>,
    ) -> Result<RemoteInvoiceStatus, ProviderError> {
        let current = self.fetch_invoice(external_id).await?;
        let version = current.version.unwrap_or_default();

        // Drafts cannot be canceled, only deleted.
        if current.status.as_deref() == Some("DRAFT") {
            let path = format!("/v2/invoices/{}?version={}", external_id, version);
            let _: serde_json::Value = self.call::<(), _>(Method::DELETE, &path, None).await?;
            info!(invoice_id = %external_id, reason = ?reason, "Square draft invoice deleted");
            return Ok(RemoteInvoiceStatus {
                external_id: external_id.to_string(),
                status: RemoteStatus::Canceled,
                version: Some(version),
                public_url: None,
                paid_amount: current.paid_to_date(),
            });
        }

        let path = format!("/v2/invoices/{}/cancel", external_id);
        let canceled: InvoiceResponse = self
            .call(Method::POST, &path, Some(&json!({ "version": version })))
            .await?;

        info!(invoice_id = %external_id, reason = ?reason, "Square invoice canceled");

        Ok(to_status(&canceled.invoice))
    }

    fn verify_and_parse_webhook(
        &self,
        raw_body: &[u8],
        signature: Option<&str>,
    ) -> Result<ParsedWebhook, ProviderError> {
        let key = self.config.webhook_signature_key.expose_secret();
        if key.is_empty() {
            warn!("Rejecting webhook: signature key not configured");
            return Err(ProviderError::Signature(
                "webhook signature key not configured".to_string(),
            ));
        }
        verify_square_signature(key, &self.config.webhook_notification_url, raw_body, signature)?;
        parse_envelope(self.name(), raw_body)
    }
}
