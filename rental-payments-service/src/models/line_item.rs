//! Line item model: an itemized charge under a payment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::tax_for;

/// Stored line item. `total_price == unit_price * quantity` always holds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentLineItem {
    pub id: Uuid,
    pub payment_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: i64,
    pub tax_rate_bps: Option<i32>,
    pub tax_amount: Option<i64>,
    pub category: Option<String>,
    pub sku: Option<String>,
    pub sort_order: i32,
    pub created_at: DateTime<Utc>,
}

/// Input for a line item. `total_price`, when supplied, must agree with
/// `unit_price * quantity`; it is recomputed either way.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewLineItem {
    pub name: String,
    pub description: Option<String>,
    pub quantity: i32,
    pub unit_price: i64,
    pub total_price: Option<i64>,
    pub tax_rate_bps: Option<i32>,
    pub tax_amount: Option<i64>,
    pub category: Option<String>,
    pub sku: Option<String>,
}

impl NewLineItem {
    /// Validate and return `(total_price, tax_amount)` as they will be stored.
    pub fn checked_amounts(&self) -> Result<(i64, Option<i64>), String> {
        if self.name.trim().is_empty() {
            return Err("line item name is required".to_string());
        }
        if self.quantity <= 0 {
            return Err(format!(
                "line item quantity must be positive (got {})",
                self.quantity
            ));
        }
        if self.unit_price < 0 {
            return Err(format!(
                "line item unit_price must not be negative (got {})",
                self.unit_price
            ));
        }

        let total = self
            .unit_price
            .checked_mul(i64::from(self.quantity))
            .ok_or_else(|| "line item total overflows".to_string())?;

        if let Some(claimed) = self.total_price {
            if claimed != total {
                return Err(format!(
                    "line item total_price {} does not equal unit_price {} x quantity {}",
                    claimed, self.unit_price, self.quantity
                ));
            }
        }

        let tax = match (self.tax_amount, self.tax_rate_bps) {
            (Some(amount), _) if amount < 0 => {
                return Err(format!("line item tax_amount must not be negative (got {})", amount))
            }
            (Some(amount), _) => Some(amount),
            (None, Some(bps)) if bps < 0 => {
                return Err(format!("line item tax_rate_bps must not be negative (got {})", bps))
            }
            (None, Some(bps)) => Some(tax_for(total, bps as u32)),
            (None, None) => None,
        };

        Ok((total, tax))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: i32, unit_price: i64, total_price: Option<i64>) -> NewLineItem {
        NewLineItem {
            name: "20 Yard Dumpster Rental".to_string(),
            quantity,
            unit_price,
            total_price,
            ..Default::default()
        }
    }

    #[test]
    fn test_total_is_recomputed() {
        assert_eq!(item(2, 12_500, None).checked_amounts(), Ok((25_000, None)));
        assert_eq!(
            item(2, 12_500, Some(25_000)).checked_amounts(),
            Ok((25_000, None))
        );
    }

    #[test]
    fn test_mismatched_total_rejected() {
        assert!(item(2, 12_500, Some(12_500)).checked_amounts().is_err());
    }

    #[test]
    fn test_quantity_must_be_positive() {
        assert!(item(0, 100, None).checked_amounts().is_err());
        assert!(item(-1, 100, None).checked_amounts().is_err());
    }

    #[test]
    fn test_tax_from_rate() {
        let mut input = item(1, 50_000, None);
        input.tax_rate_bps = Some(800);
        assert_eq!(input.checked_amounts(), Ok((50_000, Some(4_000))));
    }
}
