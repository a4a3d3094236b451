//! Conversions between order prices (decimal dollars) and ledger cents.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

/// Convert a decimal dollar amount to integer cents, rounding half away from zero.
pub fn dollars_to_cents(amount: Decimal) -> Option<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
}

/// Render cents as a two-decimal dollar string, e.g. `54000` -> `"540.00"`.
pub fn cents_to_display(cents: i64) -> String {
    Decimal::new(cents, 2).to_string()
}

/// Tax on `subtotal` at `rate_bps` basis points, rounded half up to the cent.
pub fn tax_for(subtotal: i64, rate_bps: u32) -> i64 {
    let raw = i128::from(subtotal) * i128::from(rate_bps);
    ((raw + 5_000) / 10_000) as i64
}
