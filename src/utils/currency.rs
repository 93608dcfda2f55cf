/// Currency utility functions for splitting and rounding job amounts
///
/// Shares are computed in minor units (1 unit = 100 minor) to avoid
/// floating-point drift when a fee is divided between parties.

/// Convert a currency amount to minor units
pub fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// Convert minor units back to a currency amount
pub fn from_minor_units(minor: i64) -> f64 {
    minor as f64 / 100.0
}

/// Round an amount to two decimal places
pub fn round_currency(amount: f64) -> f64 {
    from_minor_units(to_minor_units(amount))
}

/// Split `amount` so the first share gets `percent` and the second the remainder.
/// The two shares always add back up to the rounded amount.
pub fn split_by_percent(amount: f64, percent: i64) -> (f64, f64) {
    let total = to_minor_units(amount);
    let first = total * percent / 100;
    (from_minor_units(first), from_minor_units(total - first))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_minor_units() {
        assert_eq!(to_minor_units(100.0), 10000);
        assert_eq!(to_minor_units(0.50), 50);
        assert_eq!(to_minor_units(123.45), 12345);
    }

    #[test]
    fn test_round_currency() {
        assert_eq!(round_currency(1000.004), 1000.0);
        assert_eq!(round_currency(10.126), 10.13);
    }

    #[test]
    fn test_split_by_percent() {
        assert_eq!(split_by_percent(500.0, 80), (400.0, 100.0));
        assert_eq!(split_by_percent(0.0, 80), (0.0, 0.0));
        let (worker, platform) = split_by_percent(33.33, 80);
        assert_eq!(to_minor_units(worker) + to_minor_units(platform), 3333);
    }
}
