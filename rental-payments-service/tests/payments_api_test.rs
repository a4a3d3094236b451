mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::TestApp;
use serde_json::{json, Value};
use uuid::Uuid;

async fn create(app: &TestApp, order_id: Uuid, body: Value) -> Value {
    let mut request = body;
    request["orderId"] = json!(order_id);
    let response = app.post_json("/invoices", &request).await;
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    body["payment"].clone()
}

async fn record(app: &TestApp, payment_id: &str, body: Value) -> reqwest::Response {
    app.post_json(&format!("/payments/{}/transactions", payment_id), &body)
        .await
}

#[tokio::test]
async fn test_list_payments_filters_and_pages() {
    let app = TestApp::spawn().await;
    let first = app.seed_order("300").await;
    let second = app.seed_order("400").await;
    let third = app.seed_order("250").await;
    app.create_sent_invoice(first).await;
    app.create_sent_invoice(second).await;
    let cash = create(&app, third, json!({ "method": "CASH" })).await;

    let all: Value = app.get("/payments").await.json().await.unwrap();
    assert_eq!(all["total"], 3);
    assert_eq!(all["items"].as_array().unwrap().len(), 3);
    assert_eq!(all["hasMore"], false);

    let sent: Value = app.get("/payments?status=SENT").await.json().await.unwrap();
    assert_eq!(sent["total"], 2);

    let mixed: Value = app
        .get("/payments?status=sent,draft&method=CASH")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(mixed["total"], 1);
    assert_eq!(mixed["items"][0]["id"], cash["id"]);

    let page: Value = app.get("/payments?limit=2&page=1").await.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 2);
    assert_eq!(page["limit"], 2);
    assert_eq!(page["hasMore"], true);

    let page: Value = app.get("/payments?limit=2&page=2").await.json().await.unwrap();
    assert_eq!(page["items"].as_array().unwrap().len(), 1);
    assert_eq!(page["hasMore"], false);

    let by_order: Value = app
        .get(&format!("/payments?orderId={}", second))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(by_order["total"], 1);
    assert_eq!(by_order["items"][0]["totalAmount"], 43_200);

    let by_amount: Value = app
        .get("/payments?minAmount=30000&maxAmount=33000")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(by_amount["total"], 1);
    assert_eq!(by_amount["items"][0]["totalAmount"], 32_400);
}

#[tokio::test]
async fn test_list_payments_search_matches_payment_number() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let payment = create(&app, order_id, json!({})).await;
    let number = payment["paymentNumber"].as_str().unwrap();

    let found: Value = app
        .get(&format!("/payments?search={}", number.to_lowercase()))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(found["total"], 1);

    let none: Value = app.get("/payments?search=nobody").await.json().await.unwrap();
    assert_eq!(none["total"], 0);
}

#[tokio::test]
async fn test_list_payments_rejects_bad_filters() {
    let app = TestApp::spawn().await;

    let response = app.get("/payments?status=LOST").await;
    assert_eq!(response.status().as_u16(), 422);

    let response = app.get("/payments?minAmount=500&maxAmount=100").await;
    assert_eq!(response.status().as_u16(), 422);

    let response = app.get("/payments?limit=1000").await;
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn test_get_unknown_payment_is_404() {
    let app = TestApp::spawn().await;

    let response = app.get(&format!("/payments/{}", Uuid::new_v4())).await;

    assert_eq!(response.status().as_u16(), 404);
}

#[tokio::test]
async fn test_manual_full_payment_on_cash_invoice() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let payment = create(&app, order_id, json!({ "method": "CASH" })).await;
    let payment_id = payment["id"].as_str().unwrap();

    let response = record(
        &app,
        payment_id,
        json!({ "type": "CHARGE", "amount": 32_400, "externalRef": "receipt-881" }),
    )
    .await;

    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "PAID");
    assert_eq!(body["payment"]["balanceDue"], 0);
    assert_eq!(body["transaction"]["type"], "CHARGE");
    assert_eq!(body["transaction"]["status"], "COMPLETED");
    assert_eq!(body["transaction"]["externalRef"], "receipt-881");
    assert_eq!(body["transaction"]["amountDisplay"], "$324.00");
}

#[tokio::test]
async fn test_partial_payment_on_draft_is_409() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let payment = create(&app, order_id, json!({ "method": "CHECK" })).await;

    let response = record(
        &app,
        payment["id"].as_str().unwrap(),
        json!({ "type": "CHARGE", "amount": 10_000 }),
    )
    .await;

    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn test_non_positive_charge_is_422() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap();

    for amount in [0, -500] {
        let response = record(&app, payment_id, json!({ "type": "CHARGE", "amount": amount })).await;
        assert_eq!(response.status().as_u16(), 422);
    }
}

#[tokio::test]
async fn test_overpayment_is_recorded_in_full() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap();

    let response = record(&app, payment_id, json!({ "type": "CHARGE", "amount": 40_000 })).await;

    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "PAID");
    assert_eq!(body["payment"]["paidAmount"], 40_000);
    assert_eq!(body["transaction"]["amount"], 40_000);
}

#[tokio::test]
async fn test_fee_and_adjustment_leave_status_alone() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap();

    let response = record(
        &app,
        payment_id,
        json!({ "type": "FEE", "amount": 350, "metadata": { "reason": "card surcharge" } }),
    )
    .await;
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "SENT");
    assert_eq!(body["payment"]["paidAmount"], 0);

    let response = record(&app, payment_id, json!({ "type": "ADJUSTMENT", "amount": -1_000 })).await;
    assert_eq!(response.status().as_u16(), 201);

    let details: Value = app
        .get(&format!("/payments/{}", payment_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(details["status"], "SENT");
    assert_eq!(details["transactions"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn test_manual_refund_requires_collected_money() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap();

    let response = record(&app, payment_id, json!({ "type": "REFUND", "amount": 1_000 })).await;
    assert_eq!(response.status().as_u16(), 409);

    record(&app, payment_id, json!({ "type": "CHARGE", "amount": 32_400 })).await;
    let response = record(&app, payment_id, json!({ "type": "REFUND", "amount": 32_400 })).await;
    assert_eq!(response.status().as_u16(), 201);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["payment"]["status"], "REFUNDED");
    assert_eq!(body["payment"]["refundedAmount"], 32_400);
}

#[tokio::test]
async fn test_refund_with_recorded_ref_is_409() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap();
    record(&app, payment_id, json!({ "type": "CHARGE", "amount": 32_400 })).await;

    let refund = json!({ "type": "REFUND", "amount": 5_000, "externalRef": "rf-desk-7" });
    let response = record(&app, payment_id, refund.clone()).await;
    assert_eq!(response.status().as_u16(), 201);

    let response = record(&app, payment_id, refund).await;
    assert_eq!(response.status().as_u16(), 409);

    let details: Value = app
        .get(&format!("/payments/{}", payment_id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(details["refundedAmount"], 5_000);
}

#[tokio::test]
async fn test_schedule_reminder() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap();
    let when = Utc::now() + ChronoDuration::days(3);

    let response = app
        .post_json(
            &format!("/payments/{}/reminders", payment_id),
            &json!({
                "type": "FOLLOW_UP",
                "method": "SMS",
                "scheduledAt": when,
                "message": "Your dumpster invoice is due soon"
            }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 201);
    let reminder: Value = response.json().await.unwrap();
    assert_eq!(reminder["type"], "FOLLOW_UP");
    assert_eq!(reminder["status"], "SCHEDULED");
    assert_eq!(reminder["paymentId"], payment_id);
}

#[tokio::test]
async fn test_paying_cancels_scheduled_reminders() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap();
    app.post_json(
        &format!("/payments/{}/reminders", payment_id),
        &json!({
            "type": "FOLLOW_UP",
            "method": "EMAIL",
            "scheduledAt": Utc::now() + ChronoDuration::days(3)
        }),
    )
    .await;

    record(&app, payment_id, json!({ "type": "CHARGE", "amount": 32_400 })).await;

    let details: Value = app
        .get(&format!("/payments/{}", payment_id))
        .await
        .json()
        .await
        .unwrap();
    let follow_up = details["reminders"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["type"] == "FOLLOW_UP")
        .unwrap()
        .clone();
    assert_eq!(follow_up["status"], "CANCELED");
}

#[tokio::test]
async fn test_reminder_on_canceled_payment_is_409() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    let body = app.create_sent_invoice(order_id).await;
    let payment_id = body["payment"]["id"].as_str().unwrap();
    app.delete_json(&format!("/invoices/{}", order_id), &json!({}))
        .await;

    let response = app
        .post_json(
            &format!("/payments/{}/reminders", payment_id),
            &json!({ "type": "FOLLOW_UP", "method": "EMAIL", "scheduledAt": Utc::now() }),
        )
        .await;

    assert_eq!(response.status().as_u16(), 409);
}

#[tokio::test]
async fn test_overdue_sweep_moves_sent_invoices() {
    let app = TestApp::spawn().await;
    let today = Utc::now().date_naive();
    let sent_order = app.seed_order("300").await;
    let draft_order = app.seed_order("300").await;
    let sent = app.create_sent_invoice(sent_order).await;
    create(&app, draft_order, json!({ "dueDate": today })).await;

    let as_of = today + ChronoDuration::days(30);
    let response = app
        .post_json("/payments/overdue-sweep", &json!({ "asOf": as_of }))
        .await;

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["count"], 1);
    assert_eq!(body["transitioned"][0], sent["payment"]["id"]);

    let details: Value = app
        .get(&format!("/payments/{}", sent["payment"]["id"].as_str().unwrap()))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(details["status"], "OVERDUE");
    assert!(details["reminders"]
        .as_array()
        .unwrap()
        .iter()
        .any(|r| r["type"] == "OVERDUE"));

    // A second sweep finds nothing new.
    let body: Value = app
        .post_json("/payments/overdue-sweep", &json!({ "asOf": as_of }))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_overdue_sweep_defaults_to_today() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    app.create_sent_invoice(order_id).await;

    let response = app
        .client
        .post(app.url("/payments/overdue-sweep"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status().as_u16(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["asOf"], Utc::now().date_naive().to_string());
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_counters() {
    let app = TestApp::spawn().await;
    let order_id = app.seed_order("300").await;
    app.create_sent_invoice(order_id).await;

    let response = app.get("/metrics").await;

    assert_eq!(response.status().as_u16(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains("payments_transitions_total"));
}
