//! Order snapshot as read from the order source. Read-only here.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub order_number: Option<String>,
    pub first_name: String,
    pub last_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub zip: Option<String>,
    pub dumpster_size: Option<String>,
    pub quoted_price: Option<Decimal>,
    pub final_price: Option<Decimal>,
    pub scheduled_delivery_date: Option<NaiveDate>,
    pub scheduled_pickup_date: Option<NaiveDate>,
}

impl Order {
    pub fn customer_name(&self) -> String {
        format!("{} {}", self.first_name.trim(), self.last_name.trim())
            .trim()
            .to_string()
    }

    /// Single-line service address, e.g. `12 Elm St, Springfield, IL 62701`.
    pub fn service_address(&self) -> Option<String> {
        let street = self.address.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let state_zip = [self.state.as_deref(), self.zip.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        let parts: Vec<&str> = [Some(street), self.city.as_deref().map(str::trim), Some(state_zip.as_str())]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect();
        Some(parts.join(", "))
    }

    /// The price to bill: final price when set, otherwise the quote.
    pub fn billable_price(&self) -> Option<Decimal> {
        self.final_price.or(self.quoted_price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order() -> Order {
        Order {
            id: Uuid::new_v4(),
            order_number: Some("ORD-1001".to_string()),
            first_name: "Pat".to_string(),
            last_name: "Doe".to_string(),
            email: Some("pat@example.com".to_string()),
            phone: None,
            address: Some("12 Elm St".to_string()),
            city: Some("Springfield".to_string()),
            state: Some("IL".to_string()),
            zip: Some("62701".to_string()),
            dumpster_size: Some("20".to_string()),
            quoted_price: Some(Decimal::from(450)),
            final_price: None,
            scheduled_delivery_date: None,
            scheduled_pickup_date: None,
        }
    }

    #[test]
    fn test_service_address() {
        assert_eq!(
            order().service_address().as_deref(),
            Some("12 Elm St, Springfield, IL 62701")
        );
        let mut o = order();
        o.address = None;
        assert_eq!(o.service_address(), None);
    }

    #[test]
    fn test_final_price_wins_over_quote() {
        let mut o = order();
        assert_eq!(o.billable_price(), Some(Decimal::from(450)));
        o.final_price = Some(Decimal::from(500));
        assert_eq!(o.billable_price(), Some(Decimal::from(500)));
    }
}
