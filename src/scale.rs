//! Decimal <-> chain fixed-point conversion.
//!
//! Withdrawals and trade/funding margins use distinct scales on the
//! settlement contracts, so the scale is always an explicit argument.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("value {0} does not fit the chain's fixed-point range at scale {1}")]
    OutOfRange(Decimal, u32),

    #[error("chain value {0} at scale {1} exceeds the decimal range")]
    RawOutOfRange(i128, u32),
}

/// Convert a ledger decimal into the chain's fixed-point integer.
/// Rounds midpoints away from zero at the target scale; the reconciler's
/// epsilon absorbs the rounding on the way back.
pub fn to_fixed(value: Decimal, scale: u32) -> Result<i128, ScaleError> {
    let scaled = value
        .checked_mul(pow10(scale))
        .ok_or(ScaleError::OutOfRange(value, scale))?
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    scaled
        .to_i128()
        .ok_or(ScaleError::OutOfRange(value, scale))
}

/// Convert a chain fixed-point integer back into a decimal. Fails when the
/// magnitude does not fit Decimal's 96-bit coefficient; callers treat that
/// as undecodable chain data, not a value to clamp.
pub fn from_fixed(raw: i128, scale: u32) -> Result<Decimal, ScaleError> {
    Decimal::try_from_i128_with_scale(raw, scale)
        .map_err(|_| ScaleError::RawOutOfRange(raw, scale))
}

fn pow10(scale: u32) -> Decimal {
    Decimal::from(10u64.pow(scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_to_fixed_margin_scale() {
        let v = Decimal::from_str("100.000000").unwrap();
        assert_eq!(to_fixed(v, 6).unwrap(), 100_000_000);
    }

    #[test]
    fn test_to_fixed_rounds() {
        let v = Decimal::from_str("0.0000015").unwrap();
        assert_eq!(to_fixed(v, 6).unwrap(), 2); // half-up at scale 6
    }

    #[test]
    fn test_negative_funding_amount() {
        let v = Decimal::from_str("-12.5").unwrap();
        assert_eq!(to_fixed(v, 6).unwrap(), -12_500_000);
        assert_eq!(from_fixed(-12_500_000, 6).unwrap(), v);
    }

    #[test]
    fn test_round_trip_within_epsilon() {
        let v = Decimal::from_str("3.1415926535").unwrap();
        let back = from_fixed(to_fixed(v, 6).unwrap(), 6).unwrap();
        let eps = Decimal::from_str("0.000015").unwrap();
        assert!((v - back).abs() <= eps);
    }

    #[test]
    fn test_from_fixed_rejects_oversized_raw() {
        assert!(matches!(
            from_fixed(1i128 << 100, 6),
            Err(ScaleError::RawOutOfRange(..))
        ));
        assert!(matches!(
            from_fixed(-(1i128 << 100), 6),
            Err(ScaleError::RawOutOfRange(..))
        ));
    }
}
