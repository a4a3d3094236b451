//! Errors surfaced by the lifecycle manager.

use service_core::error::AppError;
use thiserror::Error;

use crate::models::PaymentStatus;
use crate::services::lifecycle::{InvalidTransition, PlanError};
use crate::services::provider::ProviderError;
use crate::services::store::StoreError;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("cannot apply '{event}' to a payment in status {from}")]
    InvalidTransition {
        from: PaymentStatus,
        event: &'static str,
    },

    #[error("invoice provider error: {0}")]
    Adapter(#[from] ProviderError),

    #[error("payment {0} is being modified concurrently, retry the request")]
    Conflict(String),

    #[error("{0}")]
    AlreadyRecorded(String),

    #[error("storage error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for PaymentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => PaymentError::NotFound(what),
            StoreError::Validation(message) => PaymentError::Validation(message),
            StoreError::VersionConflict { payment_id, .. } => {
                PaymentError::Conflict(payment_id.to_string())
            }
            e @ StoreError::DuplicateRefund { .. } => PaymentError::AlreadyRecorded(e.to_string()),
            other => PaymentError::Store(other),
        }
    }
}

impl From<InvalidTransition> for PaymentError {
    fn from(err: InvalidTransition) -> Self {
        PaymentError::InvalidTransition {
            from: err.from,
            event: err.event,
        }
    }
}

impl From<PlanError> for PaymentError {
    fn from(err: PlanError) -> Self {
        match err {
            PlanError::Transition(t) => t.into(),
            PlanError::Amount(message) => PaymentError::Validation(message),
            PlanError::NothingToApply(message) => PaymentError::Validation(message),
        }
    }
}

impl From<PaymentError> for AppError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::Validation(message) => AppError::Unprocessable(anyhow::anyhow!(message)),
            PaymentError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            e @ PaymentError::InvalidTransition { .. } => AppError::Conflict(anyhow::anyhow!(e)),
            e @ PaymentError::Conflict(_) => AppError::Conflict(anyhow::anyhow!(e)),
            e @ PaymentError::AlreadyRecorded(_) => AppError::Conflict(anyhow::anyhow!(e)),
            PaymentError::Adapter(ProviderError::Timeout(after)) => {
                AppError::GatewayTimeout(format!("invoice provider did not answer within {:?}", after))
            }
            PaymentError::Adapter(ProviderError::Signature(message)) => {
                AppError::Unauthorized(anyhow::anyhow!("invalid webhook signature: {}", message))
            }
            PaymentError::Adapter(ProviderError::InvalidRequest(message)) => {
                AppError::BadRequest(anyhow::anyhow!(message))
            }
            PaymentError::Adapter(ProviderError::NotConfigured(message)) => {
                tracing::error!(error = %message, "Invoice provider is not configured");
                AppError::ServiceUnavailable
            }
            PaymentError::Adapter(e) => AppError::BadGateway(e.to_string()),
            PaymentError::Store(e) => AppError::DatabaseError(anyhow::anyhow!(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::time::Duration;
    use uuid::Uuid;

    fn status(err: PaymentError) -> StatusCode {
        AppError::from(err).status_code()
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status(PaymentError::Validation("bad".into())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(status(PaymentError::NotFound("payment".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status(PaymentError::InvalidTransition {
                from: PaymentStatus::Paid,
                event: "cancel"
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(PaymentError::Adapter(ProviderError::Timeout(Duration::from_secs(5)))),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            status(PaymentError::Adapter(ProviderError::Signature("x".into()))),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status(PaymentError::Adapter(ProviderError::RateLimited)),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(PaymentError::Store(StoreError::Unavailable("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_version_conflict_becomes_conflict() {
        let err: PaymentError = StoreError::VersionConflict {
            payment_id: Uuid::nil(),
            expected: 3,
        }
        .into();
        assert!(matches!(err, PaymentError::Conflict(_)));
    }

    #[test]
    fn test_duplicate_refund_is_a_conflict() {
        let err: PaymentError = StoreError::DuplicateRefund {
            payment_id: Uuid::nil(),
            external_ref: "rf_1".to_string(),
        }
        .into();
        assert!(matches!(err, PaymentError::AlreadyRecorded(ref m) if m.contains("rf_1")));
        assert_eq!(status(err), StatusCode::CONFLICT);
    }
}
