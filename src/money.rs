// 💰 Money - decimal amounts and tolerances
// No floats for money. Scores and confidences stay f64.

use rust_decimal::Decimal;
use rust_decimal::RoundingStrategy;

/// Allowed drift between confirmed allocations and a fact's absolute amount
pub const TOLERANCE: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Two-decimal rendering used in fingerprints and payout keys
pub fn format_2dp(amount: Decimal) -> String {
    let rounded = amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);
    format!("{:.2}", rounded)
}

/// `|a - b| <= 0.01`
pub fn within_tolerance(a: Decimal, b: Decimal) -> bool {
    (a - b).abs() <= TOLERANCE
}

pub fn sum<'a, I>(amounts: I) -> Decimal
where
    I: IntoIterator<Item = &'a Decimal>,
{
    amounts.into_iter().copied().sum()
}

/// Lossy view for scoring only
pub fn to_f64(amount: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    amount.to_f64().unwrap_or(0.0)
}

/// Round a score to 3 decimals
pub fn round_score(score: f64) -> f64 {
    (score * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tolerance_constant() {
        assert_eq!(TOLERANCE, dec!(0.01));
    }

    #[test]
    fn test_format_2dp() {
        assert_eq!(format_2dp(dec!(-1000)), "-1000.00");
        assert_eq!(format_2dp(dec!(12.345)), "12.35");
        assert_eq!(format_2dp(dec!(-12.345)), "-12.35");
        assert_eq!(format_2dp(dec!(0.1)), "0.10");
    }

    #[test]
    fn test_within_tolerance() {
        assert!(within_tolerance(dec!(1000.00), dec!(999.99)));
        assert!(within_tolerance(dec!(1000.00), dec!(1000.01)));
        assert!(!within_tolerance(dec!(1000.00), dec!(999.98)));
        assert!(!within_tolerance(dec!(700), dec!(1000)));
    }

    #[test]
    fn test_round_score() {
        assert_eq!(round_score(0.66666), 0.667);
        assert_eq!(round_score(1.0), 1.0);
    }
}
