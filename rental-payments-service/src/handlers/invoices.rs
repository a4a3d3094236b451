use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::{CancelInvoiceRequest, CreateInvoiceRequest, InvoiceResponse, SendInvoiceRequest};
use crate::models::{DeliveryMethod, PaymentMethod};
use crate::services::manager::{CreatePaymentInput, PaymentWithRemote};
use crate::startup::AppState;

/// Create a payment for an order and, for Square invoices, the remote
/// invoice. A `deliveryMethod` also publishes it. Retrying after a failed
/// step resumes the order's unsent draft.
#[tracing::instrument(skip(state, request), fields(order_id = %request.order_id))]
pub async fn create_invoice(
    State(state): State<AppState>,
    Json(request): Json<CreateInvoiceRequest>,
) -> Result<(StatusCode, Json<InvoiceResponse>), AppError> {
    request.validate()?;

    let method = request.method.unwrap_or_default();
    let payment = state
        .manager
        .create_payment_from_order(CreatePaymentInput {
            order_id: request.order_id,
            method,
            due_date: request.due_date,
            notes: request.notes,
            custom_fields: request.custom_fields,
        })
        .await?;

    if method != PaymentMethod::SquareInvoice {
        return Ok((
            StatusCode::CREATED,
            Json(
                PaymentWithRemote {
                    payment,
                    remote: None,
                }
                .into(),
            ),
        ));
    }

    // A resumed draft may already carry its remote invoice.
    let mut result = if payment.square_invoice_id.is_some() {
        PaymentWithRemote {
            payment,
            remote: None,
        }
    } else {
        let options = state.manager.invoice_options(
            &payment,
            request.delivery_method.unwrap_or(DeliveryMethod::Email),
            request.message.clone(),
        );
        state
            .manager
            .create_remote_invoice(payment.id, &options)
            .await?
    };

    if let Some(delivery_method) = request.delivery_method {
        result = state
            .manager
            .send_invoice(result.payment.id, delivery_method, request.message)
            .await?;
    }

    tracing::info!(
        payment_id = %result.payment.id,
        status = %result.payment.status,
        "Invoice created"
    );
    Ok((StatusCode::CREATED, Json(result.into())))
}

#[tracing::instrument(skip(state))]
pub async fn invoice_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let result = state.manager.order_status(order_id).await?;
    Ok(Json(result.into()))
}

#[tracing::instrument(skip(state, request))]
pub async fn send_invoice(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(request): Json<SendInvoiceRequest>,
) -> Result<Json<InvoiceResponse>, AppError> {
    request.validate()?;
    let payment = state.manager.latest_payment_for_order(order_id).await?;
    let result = state
        .manager
        .send_invoice(payment.id, request.delivery_method, request.message)
        .await?;
    Ok(Json(result.into()))
}

/// The body is optional; `{"reason": "..."}` is appended to the payment notes.
#[tracing::instrument(skip(state, request))]
pub async fn cancel_invoice(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    request: Option<Json<CancelInvoiceRequest>>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    request.validate()?;
    let payment = state.manager.latest_payment_for_order(order_id).await?;
    let result = state
        .manager
        .cancel_payment(payment.id, request.reason)
        .await?;
    Ok(Json(result.into()))
}

#[tracing::instrument(skip(state))]
pub async fn refresh_invoice(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<InvoiceResponse>, AppError> {
    let payment = state.manager.latest_payment_for_order(order_id).await?;
    let result = state.manager.refresh_from_provider(payment.id).await?;
    Ok(Json(result.into()))
}
