use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

use crate::dtos::payments::page_response;
use crate::dtos::{
    ListPaymentsQuery, OverdueSweepRequest, OverdueSweepResponse, PageResponse,
    PaymentDetailsResponse, PaymentResponse, RecordTransactionRequest, RecordTransactionResponse,
    ReminderResponse, ScheduleReminderRequest,
};
use crate::services::manager::{RecordTransactionInput, ScheduleReminderInput};
use crate::startup::AppState;

#[tracing::instrument(skip(state, query))]
pub async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<ListPaymentsQuery>,
) -> Result<Json<PageResponse<PaymentResponse>>, AppError> {
    query.validate()?;
    let filter = query
        .into_filter()
        .map_err(|e| AppError::Unprocessable(anyhow::anyhow!(e)))?;
    let page = state.manager.list_payments(&filter).await?;
    Ok(Json(page_response(page, &filter)))
}

#[tracing::instrument(skip(state))]
pub async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<PaymentDetailsResponse>, AppError> {
    let details = state.manager.get_payment_details(payment_id).await?;
    Ok(Json(details.into()))
}

#[tracing::instrument(skip(state, request), fields(transaction_type = %request.transaction_type))]
pub async fn record_transaction(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<RecordTransactionRequest>,
) -> Result<(StatusCode, Json<RecordTransactionResponse>), AppError> {
    request.validate()?;
    let applied = state
        .manager
        .record_transaction(
            payment_id,
            RecordTransactionInput {
                transaction_type: request.transaction_type,
                amount: request.amount,
                external_ref: request.external_ref,
                metadata: request.metadata,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(applied.into())))
}

#[tracing::instrument(skip(state, request))]
pub async fn schedule_reminder(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
    Json(request): Json<ScheduleReminderRequest>,
) -> Result<(StatusCode, Json<ReminderResponse>), AppError> {
    request.validate()?;
    let reminder = state
        .manager
        .schedule_reminder(
            payment_id,
            ScheduleReminderInput {
                reminder_type: request.reminder_type,
                method: request.method,
                scheduled_at: request.scheduled_at,
                message: request.message,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(reminder.into())))
}

/// Called by an external scheduler. Without `asOf` the sweep uses today.
#[tracing::instrument(skip(state, request))]
pub async fn overdue_sweep(
    State(state): State<AppState>,
    request: Option<Json<OverdueSweepRequest>>,
) -> Result<Json<OverdueSweepResponse>, AppError> {
    let as_of = request
        .and_then(|Json(r)| r.as_of)
        .unwrap_or_else(|| Utc::now().date_naive());
    let transitioned = state.manager.check_overdue(as_of).await?;
    Ok(Json(OverdueSweepResponse {
        as_of,
        count: transitioned.len(),
        transitioned,
    }))
}
