mod common;

use std::sync::Arc;

use common::order_fixture;
use rental_payments_service::config::{BillingConfig, SquareConfig};
use rental_payments_service::models::{DeliveryMethod, PaymentMethod, PaymentStatus};
use rental_payments_service::services::manager::CreatePaymentInput;
use rental_payments_service::services::provider::{ProviderError, RemoteStatus};
use rental_payments_service::services::{
    InvoiceProvider, LedgerStore, MemoryLedgerStore, MemoryOrderSource, PaymentError,
    PaymentLifecycleManager, SquareInvoiceProvider,
};
use secrecy::Secret;
use serde_json::json;
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "sq-test-token";
const NOTIFICATION_URL: &str = "https://payments.example.test/webhooks/square";

fn square_config(base_url: &str, token: &str) -> SquareConfig {
    SquareConfig {
        access_token: Secret::new(token.to_string()),
        api_base_url: base_url.to_string(),
        api_version: "2024-01-18".to_string(),
        location_id: "LOC_TEST".to_string(),
        webhook_signature_key: Secret::new("sq-signature-key".to_string()),
        webhook_notification_url: NOTIFICATION_URL.to_string(),
    }
}

struct Harness {
    manager: PaymentLifecycleManager,
    order_id: Uuid,
}

async fn harness(server: &MockServer, token: &str) -> Harness {
    let orders = Arc::new(MemoryOrderSource::new());
    let order = order_fixture(Some("300"));
    let order_id = order.id;
    orders.insert(order).await;

    let manager = PaymentLifecycleManager::new(
        Arc::new(MemoryLedgerStore::new()),
        orders,
        Arc::new(SquareInvoiceProvider::new(square_config(&server.uri(), token))),
        BillingConfig::default(),
    );
    Harness { manager, order_id }
}

async fn draft_payment(h: &Harness) -> Uuid {
    h.manager
        .create_payment_from_order(CreatePaymentInput {
            order_id: h.order_id,
            method: PaymentMethod::SquareInvoice,
            due_date: None,
            notes: None,
            custom_fields: None,
        })
        .await
        .unwrap()
        .id
}

fn invoice_body(id: &str, version: i32, status: &str) -> serde_json::Value {
    let public_url = (status != "DRAFT").then(|| format!("https://squareup.test/pay/{}", id));
    json!({
        "invoice": {
            "id": id,
            "version": version,
            "status": status,
            "location_id": "LOC_TEST",
            "order_id": "sq-order-1",
            "public_url": public_url,
            "primary_recipient": { "customer_id": "sq-cust-1" },
            "payment_requests": [{ "request_type": "BALANCE" }]
        }
    })
}

async fn mount_create_flow(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v2/customers/search"))
        .and(header("authorization", format!("Bearer {}", TOKEN).as_str()))
        .and(header("square-version", "2024-01-18"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "customers": [{ "id": "sq-cust-1" }]
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/orders"))
        .and(body_partial_json(json!({
            "order": { "location_id": "LOC_TEST", "customer_id": "sq-cust-1" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "order": { "id": "sq-order-1" }
        })))
        .expect(1)
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/invoices"))
        .and(body_partial_json(json!({
            "invoice": { "order_id": "sq-order-1", "delivery_method": "EMAIL" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(invoice_body("sq-inv-1", 0, "DRAFT")))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_create_invoice_records_square_ids() {
    let server = MockServer::start().await;
    mount_create_flow(&server).await;
    let h = harness(&server, TOKEN).await;
    let payment_id = draft_payment(&h).await;
    let payment = h.manager.store().get_payment(payment_id).await.unwrap().unwrap();
    let options = h
        .manager
        .invoice_options(&payment, DeliveryMethod::Email, Some("Thanks!".to_string()));

    let result = h
        .manager
        .create_remote_invoice(payment_id, &options)
        .await
        .unwrap();

    assert_eq!(result.payment.status, PaymentStatus::Draft);
    assert_eq!(result.payment.square_invoice_id.as_deref(), Some("sq-inv-1"));
    assert_eq!(result.payment.square_order_id.as_deref(), Some("sq-order-1"));
    assert_eq!(result.payment.square_customer_id.as_deref(), Some("sq-cust-1"));
    assert_eq!(result.payment.square_location_id.as_deref(), Some("LOC_TEST"));
    assert_eq!(result.remote.unwrap().status, RemoteStatus::Draft);
}

#[tokio::test]
async fn test_missing_customer_is_created() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/customers/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/customers"))
        .and(body_partial_json(json!({
            "given_name": "Pat",
            "family_name": "Doe",
            "email_address": "pat@example.com"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "customer": { "id": "sq-cust-new" }
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/orders"))
        .and(body_partial_json(json!({ "order": { "customer_id": "sq-cust-new" } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "order": { "id": "sq-order-1" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/invoices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "invoice": { "id": "sq-inv-1", "version": 0, "status": "DRAFT" }
        })))
        .mount(&server)
        .await;

    let h = harness(&server, TOKEN).await;
    let payment_id = draft_payment(&h).await;
    let payment = h.manager.store().get_payment(payment_id).await.unwrap().unwrap();
    let options = h.manager.invoice_options(&payment, DeliveryMethod::Email, None);

    let result = h
        .manager
        .create_remote_invoice(payment_id, &options)
        .await
        .unwrap();

    assert_eq!(result.payment.square_customer_id.as_deref(), Some("sq-cust-new"));
    assert_eq!(result.payment.square_order_id.as_deref(), Some("sq-order-1"));
}

#[tokio::test]
async fn test_send_publishes_current_version() {
    let server = MockServer::start().await;
    mount_create_flow(&server).await;
    Mock::given(method("GET"))
        .and(path("/v2/invoices/sq-inv-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(invoice_body("sq-inv-1", 0, "DRAFT")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/invoices/sq-inv-1/publish"))
        .and(body_partial_json(json!({ "version": 0 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(invoice_body("sq-inv-1", 1, "UNPAID")))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(&server, TOKEN).await;
    let payment_id = draft_payment(&h).await;
    let payment = h.manager.store().get_payment(payment_id).await.unwrap().unwrap();
    let options = h.manager.invoice_options(&payment, DeliveryMethod::Email, None);
    h.manager
        .create_remote_invoice(payment_id, &options)
        .await
        .unwrap();

    let result = h
        .manager
        .send_invoice(payment_id, DeliveryMethod::Email, None)
        .await
        .unwrap();

    assert_eq!(result.payment.status, PaymentStatus::Sent);
    assert_eq!(result.payment.square_invoice_version, Some(1));
    assert_eq!(
        result.payment.public_payment_url.as_deref(),
        Some("https://squareup.test/pay/sq-inv-1")
    );
    assert_eq!(result.remote.unwrap().status, RemoteStatus::Unpaid);
}

#[tokio::test]
async fn test_square_error_body_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/customers/search"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [{
                "category": "INVALID_REQUEST_ERROR",
                "code": "INVALID_EMAIL_ADDRESS",
                "detail": "Email address is not valid"
            }]
        })))
        .mount(&server)
        .await;

    let h = harness(&server, TOKEN).await;
    let payment_id = draft_payment(&h).await;
    let payment = h.manager.store().get_payment(payment_id).await.unwrap().unwrap();
    let options = h.manager.invoice_options(&payment, DeliveryMethod::Email, None);

    let err = h
        .manager
        .create_remote_invoice(payment_id, &options)
        .await
        .unwrap_err();

    match err {
        PaymentError::Adapter(ProviderError::Api { status, message }) => {
            assert_eq!(status, 400);
            assert_eq!(message, "INVALID_EMAIL_ADDRESS: Email address is not valid");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    let payment = h.manager.store().get_payment(payment_id).await.unwrap().unwrap();
    assert_eq!(payment.status, PaymentStatus::Draft);
    assert!(payment.square_invoice_id.is_none());
}

#[tokio::test]
async fn test_rate_limit_is_distinguished() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/invoices/sq-inv-9"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    let provider = SquareInvoiceProvider::new(square_config(&server.uri(), TOKEN));

    let err = provider.get_invoice_status("sq-inv-9").await.unwrap_err();

    assert!(matches!(err, ProviderError::RateLimited));
}

#[tokio::test]
async fn test_status_reports_collected_amount() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/invoices/sq-inv-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "invoice": {
                "id": "sq-inv-2",
                "version": 4,
                "status": "PARTIALLY_PAID",
                "payment_requests": [
                    { "total_completed_amount_money": { "amount": 12_000, "currency": "USD" } },
                    { "total_completed_amount_money": { "amount": 3_000, "currency": "USD" } }
                ]
            }
        })))
        .mount(&server)
        .await;
    let provider = SquareInvoiceProvider::new(square_config(&server.uri(), TOKEN));

    let status = provider.get_invoice_status("sq-inv-2").await.unwrap();

    assert_eq!(status.status, RemoteStatus::PartiallyPaid);
    assert_eq!(status.version, Some(4));
    assert_eq!(status.paid_amount, Some(15_000));
}

#[tokio::test]
async fn test_cancel_deletes_draft_invoice() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/invoices/sq-inv-3"))
        .respond_with(ResponseTemplate::new(200).set_body_json(invoice_body("sq-inv-3", 2, "DRAFT")))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v2/invoices/sq-inv-3"))
        .and(query_param("version", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;
    let provider = SquareInvoiceProvider::new(square_config(&server.uri(), TOKEN));

    let status = provider
        .cancel_invoice("sq-inv-3", Some("order withdrawn"))
        .await
        .unwrap();

    assert_eq!(status.status, RemoteStatus::Canceled);
}

#[tokio::test]
async fn test_cancel_published_invoice() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/invoices/sq-inv-4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(invoice_body("sq-inv-4", 3, "UNPAID")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/invoices/sq-inv-4/cancel"))
        .and(body_partial_json(json!({ "version": 3 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(invoice_body("sq-inv-4", 4, "CANCELED")))
        .expect(1)
        .mount(&server)
        .await;
    let provider = SquareInvoiceProvider::new(square_config(&server.uri(), TOKEN));

    let status = provider.cancel_invoice("sq-inv-4", None).await.unwrap();

    assert_eq!(status.status, RemoteStatus::Canceled);
    assert_eq!(status.version, Some(4));
}

#[tokio::test]
async fn test_unconfigured_provider_makes_no_calls() {
    let server = MockServer::start().await;
    let provider = SquareInvoiceProvider::new(square_config(&server.uri(), ""));

    let err = provider.get_invoice_status("sq-inv-1").await.unwrap_err();

    assert!(matches!(err, ProviderError::NotConfigured(_)));
    assert!(server.received_requests().await.unwrap_or_default().is_empty());
}

#[test]
fn test_webhook_signature_uses_notification_url() {
    let provider = SquareInvoiceProvider::new(square_config("http://127.0.0.1:1", TOKEN));
    let body = r#"{"merchant_id":"M1","type":"invoice.viewed","event_id":"evt-sq-1","data":{}}"#;
    let signature = service_core::utils::signature::hmac_sha256_base64(
        "sq-signature-key",
        &format!("{}{}", NOTIFICATION_URL, body),
    )
    .unwrap();

    let parsed = provider
        .verify_and_parse_webhook(body.as_bytes(), Some(&signature))
        .unwrap();
    assert_eq!(parsed.source, "square");
    assert_eq!(parsed.event_id, "evt-sq-1");
    assert_eq!(parsed.event_type, "invoice.viewed");

    // Signing the body alone, without the URL, must not verify.
    let body_only = service_core::utils::signature::hmac_sha256_base64("sq-signature-key", body).unwrap();
    assert!(matches!(
        provider.verify_and_parse_webhook(body.as_bytes(), Some(&body_only)),
        Err(ProviderError::Signature(_))
    ));
}
