//! Rail selection
//!
//! Pure functions over static tables: no I/O, no clock. Settlement-currency
//! fit wins over geographic habit; the region only breaks ties.

use crate::payments::types::{CurrencyCode, Region, Rail};

/// Rails that settle natively in a currency, best fit first.
const CURRENCY_RAILS: &[(&str, &[Rail])] = &[
    ("NGN", &[Rail::Paystack, Rail::Flutterwave]),
    ("GHS", &[Rail::Paystack, Rail::Flutterwave]),
    ("KES", &[Rail::Flutterwave, Rail::Stripe]),
    ("ZAR", &[Rail::Flutterwave, Rail::Stripe]),
    ("UGX", &[Rail::Flutterwave]),
    ("TZS", &[Rail::Flutterwave]),
    ("XOF", &[Rail::Flutterwave]),
    ("EUR", &[Rail::Stripe, Rail::PayPal]),
    ("USD", &[Rail::Stripe, Rail::PayPal, Rail::Flutterwave]),
    ("GBP", &[Rail::Stripe, Rail::PayPal]),
    ("CAD", &[Rail::Stripe, Rail::PayPal]),
    ("AUD", &[Rail::Stripe, Rail::PayPal]),
];

pub fn rails_for_currency(currency: &CurrencyCode) -> &'static [Rail] {
    CURRENCY_RAILS
        .iter()
        .find(|(code, _)| *code == currency.as_str())
        .map(|(_, rails)| *rails)
        .unwrap_or(&[])
}

/// Rails every vendor in a checkout can receive funds on. `None` means the
/// checkout has no splits and any rail will do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorRailHints {
    pub receivable: Option<Vec<Rail>>,
}

impl VendorRailHints {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn only(rails: Vec<Rail>) -> Self {
        Self {
            receivable: Some(rails),
        }
    }

    pub fn allows(&self, rail: Rail) -> bool {
        match &self.receivable {
            Some(rails) => rails.contains(&rail),
            None => true,
        }
    }
}

/// Pick the primary rail.
///
/// 1. rails that natively support `currency`, kept in that table's order,
///    restricted to the region's preferred rails
/// 2. otherwise the first currency-capable rail
/// 3. otherwise the region's first preferred rail
///
/// Vendor hints narrow every step; if they rule out everything the unhinted
/// answer is returned and the caller's candidate filter has the final say.
pub fn select_optimal_gateway(
    region: Region,
    currency: &CurrencyCode,
    hints: &VendorRailHints,
) -> Rail {
    let currency_rails = rails_for_currency(currency);
    let preferred = region.preferred_rails();

    let pick = |hinted: bool| -> Option<Rail> {
        let allowed = |rail: &&Rail| !hinted || hints.allows(**rail);
        currency_rails
            .iter()
            .filter(allowed)
            .find(|rail| preferred.contains(*rail))
            .or_else(|| currency_rails.iter().find(allowed))
            .or_else(|| preferred.iter().find(allowed))
            .copied()
    };

    pick(true)
        .or_else(|| pick(false))
        .unwrap_or(preferred[0])
}

/// Full attempt order: the primary rail, then the region's remaining
/// preferences, then any other currency-capable rail. Rails that are not
/// registered or that some vendor cannot receive on are dropped.
pub fn rank_candidates(
    region: Region,
    currency: &CurrencyCode,
    hints: &VendorRailHints,
    registered: &[Rail],
) -> Vec<Rail> {
    let primary = select_optimal_gateway(region, currency, hints);

    let mut ordered: Vec<Rail> = Vec::with_capacity(Rail::ALL.len());
    let chain = std::iter::once(primary)
        .chain(region.preferred_rails().iter().copied())
        .chain(rails_for_currency(currency).iter().copied());
    for rail in chain {
        if !ordered.contains(&rail) {
            ordered.push(rail);
        }
    }

    ordered
        .into_iter()
        .filter(|rail| registered.contains(rail) && hints.allows(*rail))
        .collect()
}
