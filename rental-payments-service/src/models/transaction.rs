//! Transaction model: append-only ledger entries under a payment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

text_enum! {
    /// Kind of money movement.
    pub enum TransactionType {
        Charge => "CHARGE",
        Refund => "REFUND",
        Adjustment => "ADJUSTMENT",
        Fee => "FEE",
    }
}

text_enum! {
    pub enum TransactionStatus {
        Pending => "PENDING",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Canceled => "CANCELED",
    }
}

impl TransactionType {
    /// Direction is carried by the type, so charges, refunds and fees are
    /// strictly positive. Adjustments may go either way but not be zero.
    pub fn validate_amount(&self, amount: i64) -> Result<(), String> {
        match self {
            TransactionType::Adjustment if amount == 0 => {
                Err("adjustment amount must not be zero".to_string())
            }
            TransactionType::Adjustment => Ok(()),
            _ if amount <= 0 => Err(format!(
                "{} amount must be positive (got {})",
                self.as_str().to_lowercase(),
                amount
            )),
            _ => Ok(()),
        }
    }
}

/// Stored ledger entry. Never mutated once COMPLETED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransaction {
    pub id: Uuid,
    pub payment_id: Uuid,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub status: TransactionStatus,
    pub external_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Input for appending a ledger entry.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransaction {
    pub payment_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount: i64,
    pub status: TransactionStatus,
    pub external_ref: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl NewTransaction {
    /// A completed entry processed now.
    pub fn completed(
        payment_id: Uuid,
        transaction_type: TransactionType,
        amount: i64,
        external_ref: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            payment_id,
            transaction_type,
            amount,
            status: TransactionStatus::Completed,
            external_ref,
            metadata,
            processed_at: Some(Utc::now()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_amount_direction_rules() {
        assert!(TransactionType::Charge.validate_amount(100).is_ok());
        assert!(TransactionType::Charge.validate_amount(0).is_err());
        assert!(TransactionType::Refund.validate_amount(-100).is_err());
        assert!(TransactionType::Fee.validate_amount(-1).is_err());
        assert!(TransactionType::Adjustment.validate_amount(-250).is_ok());
        assert!(TransactionType::Adjustment.validate_amount(0).is_err());
    }
}
