//! Nigerian tax rules applied at checkout
//!
//! Stamp duty is a flat ₦50 on NGN payments above ₦10,000 and is borne by the
//! platform, so it is added to the charge but never taken from a vendor's
//! allocation. VAT at 7.5% applies to the platform's commission only.

use crate::payments::types::Money;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

/// ₦50 in kobo
pub const STAMP_DUTY_KOBO: i64 = 5_000;
/// ₦10,000 in kobo; duty applies strictly above this
pub const STAMP_DUTY_THRESHOLD_KOBO: i64 = 1_000_000;

pub fn vat_rate() -> Decimal {
    Decimal::new(75, 3)
}

pub fn stamp_duty(amount: &Money) -> i64 {
    if amount.currency.as_str() == "NGN" && amount.amount_minor > STAMP_DUTY_THRESHOLD_KOBO {
        STAMP_DUTY_KOBO
    } else {
        0
    }
}

/// `floor(commission * 7.5%)`
pub fn vat_on_commission(commission_minor: i64) -> i64 {
    if commission_minor <= 0 {
        return 0;
    }
    (Decimal::from(commission_minor) * vat_rate())
        .floor()
        .to_i64()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payments::types::CurrencyCode;

    fn ngn(amount: i64) -> Money {
        Money::new(amount, CurrencyCode::parse("NGN").unwrap())
    }

    #[test]
    fn stamp_duty_threshold_is_exclusive() {
        assert_eq!(stamp_duty(&ngn(1_000_000)), 0);
        assert_eq!(stamp_duty(&ngn(1_000_001)), STAMP_DUTY_KOBO);
    }

    #[test]
    fn stamp_duty_is_naira_only() {
        let usd = Money::new(50_000_000, CurrencyCode::parse("USD").unwrap());
        assert_eq!(stamp_duty(&usd), 0);
    }

    #[test]
    fn vat_is_floored() {
        assert_eq!(vat_on_commission(12_000), 900);
        assert_eq!(vat_on_commission(13), 0);
        assert_eq!(vat_on_commission(1_001), 75);
        assert_eq!(vat_on_commission(-5), 0);
    }
}
