//! Fee Estimation
//!
//! The fee attributed to a code is a placeholder policy, so it sits behind a trait the
//! scanner receives at construction.

use rust_decimal::Decimal;

/// Default proportional rate: 0.05% of the transferred value
pub const DEFAULT_FEE_RATE: Decimal = Decimal::from_parts(5, 0, 0, false, 4);

/// Strategy computing the fee estimate recorded with an attribution
#[cfg_attr(test, mockall::automock)]
pub trait FeeEstimator: Send + Sync {
    /// Estimate the fee for a transaction moving `value` native units
    fn estimate(&self, value: Decimal) -> Decimal;
}

/// Fee as a fixed fraction of the transferred value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProportionalFee {
    rate: Decimal,
}

impl ProportionalFee {
    pub fn new(rate: Decimal) -> Self {
        Self { rate }
    }

    pub fn rate(&self) -> Decimal {
        self.rate
    }
}

impl Default for ProportionalFee {
    fn default() -> Self {
        Self::new(DEFAULT_FEE_RATE)
    }
}

impl FeeEstimator for ProportionalFee {
    fn estimate(&self, value: Decimal) -> Decimal {
        if value <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        value
            .checked_mul(self.rate)
            .map(|fee| fee.normalize())
            .unwrap_or(Decimal::ZERO)
    }
}
