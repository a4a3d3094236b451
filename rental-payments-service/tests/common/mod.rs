#![allow(dead_code)]

use std::str::FromStr;
use std::sync::{Arc, Once};

use rental_payments_service::config::{
    BillingConfig, Config, ObservabilityConfig, ProviderBackend, ServerConfig, SquareConfig,
    StoreBackend,
};
use rental_payments_service::models::Order;
use rental_payments_service::services::{
    MemoryLedgerStore, MemoryOrderSource, MockInvoiceProvider, PaymentLifecycleManager,
};
use rental_payments_service::startup::{Application, Components};
use rust_decimal::Decimal;
use secrecy::Secret;
use serde_json::{json, Value};
use uuid::Uuid;

pub const SIGNATURE_KEY: &str = "test-signature-key";
pub const NOTIFICATION_URL: &str = "https://payments.example.test/webhooks/square";
pub const SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

static TRACING: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("warn,rental_payments_service=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub store: Arc<MemoryLedgerStore>,
    pub orders: Arc<MemoryOrderSource>,
    pub provider: Arc<MockInvoiceProvider>,
    pub manager: Arc<PaymentLifecycleManager>,
}

pub fn test_config(billing: BillingConfig) -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            allowed_origins: Vec::new(),
        },
        store: StoreBackend::Memory,
        database: None,
        provider: ProviderBackend::Mock,
        square: SquareConfig {
            access_token: Secret::new(String::new()),
            api_base_url: "http://127.0.0.1:1".to_string(),
            api_version: "2024-01-18".to_string(),
            location_id: "LOC_TEST".to_string(),
            webhook_signature_key: Secret::new(SIGNATURE_KEY.to_string()),
            webhook_notification_url: NOTIFICATION_URL.to_string(),
        },
        billing,
        observability: ObservabilityConfig {
            log_level: "warn".to_string(),
            otlp_endpoint: None,
        },
        service_name: "rental-payments-service-test".to_string(),
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(BillingConfig::default()).await
    }

    pub async fn spawn_with(billing: BillingConfig) -> Self {
        init_tracing();
        let store = Arc::new(MemoryLedgerStore::new());
        let orders = Arc::new(MemoryOrderSource::new());
        let provider = Arc::new(MockInvoiceProvider::new(SIGNATURE_KEY, NOTIFICATION_URL));

        let app = Application::build_with(
            test_config(billing),
            Components {
                store: store.clone(),
                orders: orders.clone(),
                provider: provider.clone(),
            },
        )
        .await
        .expect("Failed to build test application");

        let address = format!("http://127.0.0.1:{}", app.port());
        let manager = app.state().manager.clone();

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        for _ in 0..50 {
            if client
                .get(format!("{}/health", address))
                .send()
                .await
                .is_ok()
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        TestApp {
            address,
            client,
            store,
            orders,
            provider,
            manager,
        }
    }

    /// Insert an order priced at `price` dollars and return its id.
    pub async fn seed_order(&self, price: &str) -> Uuid {
        let order = order_fixture(Some(price));
        let id = order.id;
        self.orders.insert(order).await;
        id
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    pub async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn post_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    pub async fn delete_json(&self, path: &str, body: &Value) -> reqwest::Response {
        self.client
            .delete(self.url(path))
            .json(body)
            .send()
            .await
            .expect("Failed to execute request")
    }

    /// Create and publish an invoice for `order_id`; returns the response body.
    pub async fn create_sent_invoice(&self, order_id: Uuid) -> Value {
        let response = self
            .post_json(
                "/invoices",
                &json!({ "orderId": order_id, "deliveryMethod": "EMAIL" }),
            )
            .await;
        assert_eq!(response.status().as_u16(), 201);
        response.json().await.expect("invoice body")
    }

    /// Post a webhook body signed the way the provider signs it.
    pub async fn post_webhook(&self, body: &Value) -> reqwest::Response {
        let raw = serde_json::to_string(body).expect("serialize webhook");
        let signature = self.provider.sign(&raw);
        self.post_raw_webhook(raw, Some(signature)).await
    }

    pub async fn post_raw_webhook(&self, raw: String, signature: Option<String>) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url("/webhooks/square"))
            .header("content-type", "application/json")
            .body(raw);
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        request.send().await.expect("Failed to execute request")
    }
}

/// A 20 yard rental order for Pat Doe. `price` is the quote in dollars.
pub fn order_fixture(price: Option<&str>) -> Order {
    let id = Uuid::new_v4();
    Order {
        id,
        order_number: Some(format!("ORD-{}", &id.simple().to_string()[..6])),
        first_name: "Pat".to_string(),
        last_name: "Doe".to_string(),
        email: Some("pat@example.com".to_string()),
        phone: Some("+15555550100".to_string()),
        address: Some("12 Elm St".to_string()),
        city: Some("Springfield".to_string()),
        state: Some("IL".to_string()),
        zip: Some("62701".to_string()),
        dumpster_size: Some("20".to_string()),
        quoted_price: price.map(|p| Decimal::from_str(p).expect("price")),
        final_price: None,
        scheduled_delivery_date: None,
        scheduled_pickup_date: None,
    }
}

/// An `invoice.*` notification for `invoice_id`. `paid_to_date` fills the
/// completed amount of the single payment request.
pub fn invoice_event(
    event_id: &str,
    event_type: &str,
    invoice_id: &str,
    status: &str,
    paid_to_date: Option<i64>,
) -> Value {
    let mut invoice = json!({
        "id": invoice_id,
        "version": 2,
        "status": status,
        "public_url": format!("https://pay.example.test/invoice/{}", invoice_id),
    });
    if let Some(amount) = paid_to_date {
        invoice["payment_requests"] = json!([
            { "total_completed_amount_money": { "amount": amount, "currency": "USD" } }
        ]);
    }
    json!({
        "merchant_id": "MERCHANT_TEST",
        "type": event_type,
        "event_id": event_id,
        "created_at": "2026-10-19T12:00:00Z",
        "data": { "type": "invoice", "id": invoice_id, "object": { "invoice": invoice } }
    })
}

pub fn refund_event(
    event_id: &str,
    event_type: &str,
    refund_id: &str,
    order_id: &str,
    amount: i64,
    status: &str,
) -> Value {
    json!({
        "merchant_id": "MERCHANT_TEST",
        "type": event_type,
        "event_id": event_id,
        "created_at": "2026-10-19T12:00:00Z",
        "data": { "type": "refund", "id": refund_id, "object": { "refund": {
            "id": refund_id,
            "status": status,
            "order_id": order_id,
            "amount_money": { "amount": amount, "currency": "USD" }
        } } }
    })
}
