use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SizingError {
    #[error("price must be positive, got {0}")]
    NonPositivePrice(f64),

    #[error("tick size must be positive, got {0}")]
    NonPositiveTick(f64),

    #[error("notional {notional:.4} below exchange minimum {min_notional:.4}")]
    BelowMinNotional { notional: f64, min_notional: f64 },
}

/// Convert a target notional into an exchange-compliant order quantity.
///
/// The raw quantity is rounded to the nearest multiple of `base_tick` (never
/// down to zero), then re-rounded at the decimal precision implied by the
/// tick so float artifacts like 0.30000000000000004 cannot reach the
/// exchange. If the resulting notional is below `min_notional` exactly one
/// tick is added; if that is still too small the order is rejected.
pub fn size_order(
    target_notional: f64,
    price: f64,
    base_tick: f64,
    min_notional: f64,
) -> Result<f64, SizingError> {
    if price <= 0.0 {
        return Err(SizingError::NonPositivePrice(price));
    }
    if base_tick <= 0.0 {
        return Err(SizingError::NonPositiveTick(base_tick));
    }

    let raw = target_notional / price;
    let mut steps = (raw / base_tick).round();
    if steps < 1.0 {
        steps = 1.0;
    }

    let decimals = tick_decimals(base_tick);
    let mut quantity = round_to(steps * base_tick, decimals);

    if quantity * price < min_notional {
        quantity = round_to(quantity + base_tick, decimals);
    }

    let notional = quantity * price;
    if notional < min_notional {
        return Err(SizingError::BelowMinNotional {
            notional,
            min_notional,
        });
    }

    Ok(quantity)
}

/// Number of fractional digits implied by a tick size, e.g. 0.01 -> 2
fn tick_decimals(tick: f64) -> u32 {
    let formatted = format!("{:.12}", tick);
    let trimmed = formatted.trim_end_matches('0');
    trimmed
        .split_once('.')
        .map(|(_, frac)| frac.len() as u32)
        .unwrap_or(0)
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_min_notional_is_accepted() {
        // 10 USDC at 125: raw 0.08, lands exactly on the minimum
        let quantity = size_order(10.0, 125.0, 0.01, 10.0).unwrap();
        assert_eq!(quantity, 0.08);
        assert_eq!(quantity * 125.0, 10.0);
    }

    #[test]
    fn test_one_tick_bump_covers_min_notional() {
        // raw 0.101 rounds to 0.1 -> notional 9.9, one tick fixes it
        let quantity = size_order(10.0, 99.0, 0.1, 10.0).unwrap();
        assert_eq!(quantity, 0.2);
    }

    #[test]
    fn test_rejected_when_bump_is_not_enough() {
        let result = size_order(5.0, 100.0, 0.001, 10.0);
        assert!(matches!(
            result,
            Err(SizingError::BelowMinNotional { .. })
        ));
    }

    #[test]
    fn test_never_rounds_to_zero() {
        // raw 0.004 would round to zero steps; forced up to one tick
        let quantity = size_order(0.4, 100.0, 0.01, 0.0).unwrap();
        assert_eq!(quantity, 0.01);
    }

    #[test]
    fn test_float_artifacts_are_eliminated() {
        // 3 * 0.1 = 0.30000000000000004 without precision rounding
        let quantity = size_order(30.0, 100.0, 0.1, 10.0).unwrap();
        assert_eq!(quantity, 0.3);
    }

    #[test]
    fn test_tick_decimals() {
        assert_eq!(tick_decimals(1.0), 0);
        assert_eq!(tick_decimals(0.1), 1);
        assert_eq!(tick_decimals(0.01), 2);
        assert_eq!(tick_decimals(0.001), 3);
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            size_order(10.0, 0.0, 0.01, 10.0),
            Err(SizingError::NonPositivePrice(_))
        ));
        assert!(matches!(
            size_order(10.0, 100.0, 0.0, 10.0),
            Err(SizingError::NonPositiveTick(_))
        ));
    }
}
