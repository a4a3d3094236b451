mod common;

use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::{order_fixture, TestApp};
use rental_payments_service::config::BillingConfig;
use rental_payments_service::models::ListPaymentsFilter;
use serde_json::{json, Value};
use uuid::Uuid;

#[tokio::test]
async fn test_health_reports_provider() {
    let app = TestApp::spawn().await;

    let response = app.get("/health").await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["provider"], "mock");
}

#[tokio::test]
async fn test_create_invoice_with_delivery_sends_it() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300.00").await;

    let body = app.create_sent_invoice(order_id).await;

    let payment = &body["payment"];
    assert_eq!(payment["status"], "SENT");
    assert_eq!(payment["orderId"], order_id.to_string());
    assert_eq!(payment["subtotalAmount"], 30_000);
    assert_eq!(payment["taxAmount"], 2_400);
    assert_eq!(payment["totalAmount"], 32_400);
    assert_eq!(payment["balanceDue"], 32_400);
    assert_eq!(payment["display"]["total"], "$324.00");
    assert_eq!(payment["squareInvoiceId"], "inv_mock_0001");
    assert_eq!(payment["squareOrderId"], "ord_inv_mock_0001");
    assert_eq!(payment["deliveryMethod"], "EMAIL");
    assert_eq!(payment["customerName"], "Pat Doe");
    assert_eq!(
        payment["publicPaymentUrl"],
        "https://pay.example.test/invoice/inv_mock_0001"
    );
    assert!(payment["sentAt"].is_string());
    assert_eq!(body["remoteInvoice"]["status"], "UNPAID");

    let payment_id = payment["id"].as_str().unwrap();
    let details: Value = app
        .get(&format!("/payments/{}", payment_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(details["lineItems"][0]["name"], "20 Yard Dumpster Rental");
    assert_eq!(details["lineItems"][0]["sku"], "DUMPSTER-20YD");
    assert_eq!(details["reminders"][0]["type"], "INITIAL");
    assert_eq!(details["reminders"][0]["status"], "SENT");
}

#[tokio::test]
async fn test_create_invoice_without_delivery_stays_draft() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("450").await;

    let response = app
        .post_json("/invoices", &json!({ "orderId": order_id }))
        .await;

    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "DRAFT");
    assert_eq!(body["payment"]["squareInvoiceId"], "inv_mock_0001");
    assert_eq!(body["remoteInvoice"]["status"], "DRAFT");
    assert_eq!(app.provider.calls().len(), 1);

    let response = app
        .post_json(
            &format!("/invoices/{}/send", order_id),
            &json!({ "deliveryMethod": "SMS", "message": "Thanks for your order" }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "SENT");
    assert_eq!(body["payment"]["deliveryMethod"], "SMS");
}

#[tokio::test]
async fn test_cash_payment_skips_provider() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("200").await;

    let response = app
        .post_json("/invoices", &json!({ "orderId": order_id, "method": "CASH" }))
        .await;

    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["method"], "CASH");
    assert_eq!(body["payment"]["status"], "DRAFT");
    assert!(body["payment"]["squareInvoiceId"].is_null());
    assert!(body["remoteInvoice"].is_null());
    assert!(app.provider.calls().is_empty());
}

#[tokio::test]
async fn test_scheduled_send_moves_to_pending() {
    let app = TestApp::spawn().await;
    app.provider.schedule_sends(true);
    let order_id = app.seed_order("300").await;

    let body = app.create_sent_invoice(order_id).await;

    assert_eq!(body["payment"]["status"], "PENDING");
    assert!(body["payment"]["sentAt"].is_null());
    assert_eq!(body["remoteInvoice"]["status"], "SCHEDULED");
}

#[tokio::test]
async fn test_create_invoice_for_unknown_order_is_404() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json("/invoices", &json!({ "orderId": Uuid::new_v4() }))
        .await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_create_invoice_for_unpriced_order_is_422() {
    let app = TestApp::spawn().await;
    let order = order_fixture(None);
    let order_id = order.id;
    app.orders.insert(order).await;

    let response = app
        .post_json("/invoices", &json!({ "orderId": order_id }))
        .await;

    assert_eq!(response.status().as_u16(), 422);
    assert!(app.provider.calls().is_empty());
}

#[tokio::test]
async fn test_create_invoice_with_past_due_date_is_422() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let yesterday = Utc::now().date_naive() - ChronoDuration::days(1);

    let response = app
        .post_json(
            "/invoices",
            &json!({ "orderId": order_id, "dueDate": yesterday }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn test_invoice_status_includes_remote_snapshot() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    app.create_sent_invoice(order_id).await;

    let response = app.get(&format!("/invoices/{}/status", order_id)).await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "SENT");
    assert_eq!(body["remoteInvoice"]["externalId"], "inv_mock_0001");
    assert_eq!(body["remoteInvoice"]["paidAmount"], 0);
}

#[tokio::test]
async fn test_invoice_status_survives_provider_outage() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    app.create_sent_invoice(order_id).await;
    app.provider.set_failure(Some("maintenance"));

    let response = app.get(&format!("/invoices/{}/status", order_id)).await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "SENT");
    assert!(body["remoteInvoice"].is_null());
}

#[tokio::test]
async fn test_invoice_status_for_order_without_payment_is_404() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;

    let response = app.get(&format!("/invoices/{}/status", order_id)).await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_cancel_invoice_records_reason() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    app.create_sent_invoice(order_id).await;

    let response = app
        .delete_json(
            &format!("/invoices/{}", order_id),
            &json!({ "reason": "customer changed plans" }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "CANCELED");
    assert!(body["payment"]["canceledAt"].is_string());
    assert!(body["payment"]["notes"]
        .as_str()
        .unwrap()
        .contains("Canceled: customer changed plans"));
    assert_eq!(body["remoteInvoice"]["status"], "CANCELED");
    assert!(app
        .provider
        .calls()
        .contains(&"cancel:inv_mock_0001".to_string()));
}

#[tokio::test]
async fn test_cancel_without_body_is_accepted() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    app.create_sent_invoice(order_id).await;

    let response = app
        .client
        .delete(app.url(&format!("/invoices/{}", order_id)))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "CANCELED");
}

#[tokio::test]
async fn test_cancel_paid_invoice_is_409() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap().to_string();

    let response = app
        .post_json(
            &format!("/payments/{}/transactions", payment_id),
            &json!({ "type": "CHARGE", "amount": 32_400 }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let response = app
        .delete_json(&format!("/invoices/{}", order_id), &json!({}))
        .await;

    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn test_provider_failure_on_send_is_502_and_payment_stays_draft() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let response = app
        .post_json("/invoices", &json!({ "orderId": order_id }))
        .await;
    assert_eq!(response.status().as_u16(), 201);

    app.provider.set_failure(Some("upstream unavailable"));
    let response = app
        .post_json(
            &format!("/invoices/{}/send", order_id),
            &json!({ "deliveryMethod": "EMAIL" }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 502);
    let payment = app.manager.latest_payment_for_order(order_id).await.unwrap();
    assert_eq!(payment.status.as_str(), "DRAFT");
    assert!(payment.sent_at.is_none());
}

#[tokio::test]
async fn test_provider_timeout_is_504() {
    let billing = BillingConfig {
        adapter_timeout_ms: 50,
        ..BillingConfig::default()
    };
    let app = TestApp::spawn_with(billing).await;
    app.provider.set_delay(Some(Duration::from_millis(500)));
    let order_id = app.seed_order("300").await;

    let response = app
        .post_json(
            "/invoices",
            &json!({ "orderId": order_id, "deliveryMethod": "EMAIL" }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 504);
    let payment = app.manager.latest_payment_for_order(order_id).await.unwrap();
    assert_eq!(payment.status.as_str(), "DRAFT");
    assert!(payment.square_invoice_id.is_none());
}

#[tokio::test]
async fn test_retry_after_provider_failure_reuses_draft() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;

    app.provider.set_failure(Some("upstream unavailable"));
    let response = app
        .post_json(
            "/invoices",
            &json!({ "orderId": order_id, "deliveryMethod": "EMAIL" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 502);
    let draft = app.manager.latest_payment_for_order(order_id).await.unwrap();

    app.provider.set_failure(None);
    let response = app
        .post_json(
            "/invoices",
            &json!({ "orderId": order_id, "deliveryMethod": "EMAIL" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["id"], draft.id.to_string());
    assert_eq!(body["payment"]["paymentNumber"], draft.payment_number);
    assert_eq!(body["payment"]["status"], "SENT");

    let create_calls: Vec<String> = app
        .provider
        .calls()
        .into_iter()
        .filter(|call| call.starts_with("create:"))
        .collect();
    assert_eq!(
        create_calls,
        vec![format!("create:{}", draft.id), format!("create:{}", draft.id)]
    );

    let page = app
        .manager
        .list_payments(&ListPaymentsFilter {
            order_id: Some(order_id),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(page.total, 1);
}

#[tokio::test]
async fn test_retry_after_send_failure_keeps_remote_invoice() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let response = app
        .post_json("/invoices", &json!({ "orderId": order_id }))
        .await;
    assert_eq!(response.status().as_u16(), 201);

    let response = app
        .post_json(
            "/invoices",
            &json!({ "orderId": order_id, "deliveryMethod": "EMAIL" }),
        )
        .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["squareInvoiceId"], "inv_mock_0001");
    assert_eq!(body["payment"]["status"], "SENT");
    assert_eq!(
        app.provider
            .calls()
            .iter()
            .filter(|call| call.starts_with("create:"))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_refresh_applies_remote_payment() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    app.create_sent_invoice(order_id).await;
    app.provider.set_paid_amount("inv_mock_0001", 32_400);

    let response = app
        .post_json(&format!("/invoices/{}/refresh", order_id), &json!({}))
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "PAID");
    assert_eq!(body["payment"]["paidAmount"], 32_400);
    assert_eq!(body["payment"]["balanceDue"], 0);
    assert_eq!(body["remoteInvoice"]["paidAmount"], 32_400);

    // Nothing new on the provider side, so a second refresh changes nothing.
    let response = app
        .post_json(&format!("/invoices/{}/refresh", order_id), &json!({}))
        .await;
    assert_eq!(response.status().as_u16(), 200);
    let payment_id: Uuid = body["payment"]["id"].as_str().unwrap().parse().unwrap();
    let details = app.manager.get_payment_details(payment_id).await.unwrap();
    assert_eq!(details.transactions.len(), 1);
}

#[tokio::test]
async fn test_refresh_without_remote_invoice_is_422() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    app.post_json("/invoices", &json!({ "orderId": order_id, "method": "CHECK" }))
        .await;

    let response = app
        .post_json(&format!("/invoices/{}/refresh", order_id), &json!({}))
        .await;

    assert_eq!(response.status().as_u16(), 422);
}

#[tokio::test]
async fn test_invalid_request_body_is_rejected() {
    let app = TestApp::spawn().await;

    let response = app
        .post_json("/invoices", &json!({ "orderId": "not-a-uuid" }))
        .await;

    assert!(response.status().is_client_error());
}
