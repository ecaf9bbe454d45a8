//! Marketplace split arithmetic
//!
//! Pure functions only. Every fee is floored, so for each split
//! `vendor_net_amount + platform_fee == allocated_amount` holds exactly and the
//! platform never takes more than its percentage.

use crate::error::{AppError, AppErrorKind, DomainError};
use crate::payments::types::{SplitCalculation, VendorSplit};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SplitError {
    #[error("vendor allocations {allocated} exceed payment total {total}")]
    SplitMismatch { allocated: i64, total: i64 },

    #[error("invalid split for vendor '{vendor_id}': {reason}")]
    InvalidSplit { vendor_id: String, reason: String },
}

impl From<SplitError> for AppError {
    fn from(err: SplitError) -> Self {
        match err {
            SplitError::SplitMismatch { allocated, total } => AppError::new(AppErrorKind::Domain(
                DomainError::SplitMismatch { allocated, total },
            )),
            SplitError::InvalidSplit { vendor_id, reason } => {
                AppError::validation("splits", format!("{}: {}", vendor_id, reason))
            }
        }
    }
}

/// `floor(allocated * fee_percentage / 100)`, never more than `allocated`.
pub fn platform_fee(allocated: i64, fee_percentage: Decimal) -> i64 {
    if allocated <= 0 || fee_percentage <= Decimal::ZERO {
        return 0;
    }
    let fee = (Decimal::from(allocated) * fee_percentage / Decimal::ONE_HUNDRED).floor();
    fee.to_i64().unwrap_or(allocated).clamp(0, allocated)
}

pub fn calculate_split(split: &VendorSplit) -> SplitCalculation {
    let fee = platform_fee(split.allocated_amount, split.fee_percentage);
    SplitCalculation {
        vendor_id: split.vendor_id.clone(),
        total: split.allocated_amount,
        vendor_net_amount: split.allocated_amount - fee,
        platform_fee: fee,
        fee_percentage: split.fee_percentage,
        service_type: split.service_type,
    }
}

pub fn calculate_splits(splits: &[VendorSplit]) -> Vec<SplitCalculation> {
    splits.iter().map(calculate_split).collect()
}

pub fn total_allocated(splits: &[VendorSplit]) -> i64 {
    splits.iter().map(|s| s.allocated_amount).sum()
}

pub fn total_platform_fee(calculations: &[SplitCalculation]) -> i64 {
    calculations.iter().map(|c| c.platform_fee).sum()
}

/// Reject splits that cannot be paid out of `total` before any money moves.
pub fn validate_splits(splits: &[VendorSplit], total: i64) -> Result<(), SplitError> {
    let mut seen = HashSet::new();
    for split in splits {
        let invalid = |reason: &str| SplitError::InvalidSplit {
            vendor_id: split.vendor_id.clone(),
            reason: reason.to_string(),
        };

        if split.vendor_id.trim().is_empty() {
            return Err(invalid("vendor id is required"));
        }
        if !seen.insert(split.vendor_id.as_str()) {
            return Err(invalid("vendor appears more than once"));
        }
        if split.allocated_amount <= 0 {
            return Err(invalid("allocated amount must be greater than zero"));
        }
        if split.fee_percentage < Decimal::ZERO || split.fee_percentage > Decimal::ONE_HUNDRED {
            return Err(invalid("fee percentage must be between 0 and 100"));
        }
    }

    let allocated = splits
        .iter()
        .try_fold(0i64, |acc, s| acc.checked_add(s.allocated_amount))
        .unwrap_or(i64::MAX);
    if allocated > total {
        return Err(SplitError::SplitMismatch { allocated, total });
    }
    Ok(())
}
