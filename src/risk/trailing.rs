use crate::config::RiskParams;
use crate::models::Side;

/// Which rule produced the effective stop. Exactly one tier applies at any
/// peak-profit level; the tag travels with stop-loss closes for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopTier {
    /// Entry-relative stop loss, no profit tier armed
    Base,
    /// Tier 1: fixed stop locking a small entry-relative profit
    FeeLock,
    /// Tier 2: stop trailing the watermark at a fixed callback
    Ratchet,
}

impl StopTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopTier::Base => "base",
            StopTier::FeeLock => "tier1_fee_lock",
            StopTier::Ratchet => "tier2_ratchet",
        }
    }
}

/// Outcome of one risk evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskDecision {
    Hold,
    TakeProfit,
    StopOut(StopTier),
}

/// Advance the favorable watermark with a new mark observation.
///
/// The watermark is clamped to the entry price first (a row restored with a
/// stale or zeroed watermark must not report negative peak profit), then
/// moved only in the favorable direction. For longs it is non-decreasing,
/// for shorts non-increasing.
pub fn advance_watermark(side: Side, entry_price: f64, extreme_price: f64, mark: f64) -> f64 {
    match side {
        Side::Long => extreme_price.max(entry_price).max(mark),
        Side::Short => {
            let extreme = if extreme_price <= 0.0 {
                entry_price
            } else {
                extreme_price.min(entry_price)
            };
            extreme.min(mark)
        }
    }
}

/// Peak unrealized profit fraction implied by the watermark.
/// Non-negative whenever the watermark is tracked correctly.
pub fn favorable_pct(side: Side, entry_price: f64, extreme_price: f64) -> f64 {
    match side {
        Side::Long => (extreme_price - entry_price) / entry_price,
        Side::Short => (entry_price - extreme_price) / entry_price,
    }
}

/// Fixed take-profit threshold, independent of the stop tier
pub fn take_profit_price(side: Side, entry_price: f64, params: &RiskParams) -> f64 {
    match side {
        Side::Long => entry_price * (1.0 + params.take_profit_pct),
        Side::Short => entry_price * (1.0 - params.take_profit_pct),
    }
}

/// The effective stop and the tier that produced it.
///
/// Tiers are evaluated high to low and are mutually exclusive:
/// - Ratchet once peak profit reached `tier2_activation`: the stop trails
///   the watermark and, because the watermark is monotonic, never retreats.
/// - FeeLock once peak profit reached `tier1_activation`: fixed
///   entry-relative stop, does not move within the tier.
/// - Base otherwise: plain entry-relative stop loss.
pub fn effective_stop(
    side: Side,
    entry_price: f64,
    extreme_price: f64,
    params: &RiskParams,
) -> (StopTier, f64) {
    let peak_pct = favorable_pct(side, entry_price, extreme_price);

    match side {
        Side::Long => {
            if peak_pct >= params.tier2_activation {
                (StopTier::Ratchet, extreme_price * (1.0 - params.trail_callback))
            } else if peak_pct >= params.tier1_activation {
                (StopTier::FeeLock, entry_price * (1.0 + params.tier1_lock))
            } else {
                (StopTier::Base, entry_price * (1.0 - params.stop_loss_pct))
            }
        }
        Side::Short => {
            if peak_pct >= params.tier2_activation {
                (StopTier::Ratchet, extreme_price * (1.0 + params.trail_callback))
            } else if peak_pct >= params.tier1_activation {
                (StopTier::FeeLock, entry_price * (1.0 - params.tier1_lock))
            } else {
                (StopTier::Base, entry_price * (1.0 + params.stop_loss_pct))
            }
        }
    }
}

/// One risk decision for an open position at the current mark.
/// The caller must have already advanced the watermark with this mark.
pub fn evaluate(
    side: Side,
    entry_price: f64,
    extreme_price: f64,
    mark: f64,
    params: &RiskParams,
) -> RiskDecision {
    let take_profit = take_profit_price(side, entry_price, params);
    let (tier, stop) = effective_stop(side, entry_price, extreme_price, params);

    match side {
        Side::Long => {
            if mark >= take_profit {
                RiskDecision::TakeProfit
            } else if mark <= stop {
                RiskDecision::StopOut(tier)
            } else {
                RiskDecision::Hold
            }
        }
        Side::Short => {
            if mark <= take_profit {
                RiskDecision::TakeProfit
            } else if mark >= stop {
                RiskDecision::StopOut(tier)
            } else {
                RiskDecision::Hold
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> RiskParams {
        RiskParams {
            take_profit_pct: 0.30,
            stop_loss_pct: 0.02,
            tier1_activation: 0.015,
            tier1_lock: 0.002,
            tier2_activation: 0.025,
            trail_callback: 0.015,
            ..RiskParams::default()
        }
    }

    #[test]
    fn test_watermark_is_monotonic_for_longs() {
        let marks = [100.0, 103.0, 101.0, 105.0, 99.0, 104.0];
        let mut extreme = 100.0;
        let mut previous = extreme;

        for mark in marks {
            extreme = advance_watermark(Side::Long, 100.0, extreme, mark);
            assert!(extreme >= previous);
            assert!(extreme >= 100.0);
            previous = extreme;
        }
        assert_eq!(extreme, 105.0);
    }

    #[test]
    fn test_watermark_is_monotonic_for_shorts() {
        let marks = [100.0, 98.0, 99.5, 96.0, 101.0];
        let mut extreme = 100.0;
        let mut previous = extreme;

        for mark in marks {
            extreme = advance_watermark(Side::Short, 100.0, extreme, mark);
            assert!(extreme <= previous);
            assert!(extreme <= 100.0);
            previous = extreme;
        }
        assert_eq!(extreme, 96.0);
    }

    #[test]
    fn test_watermark_recovers_from_bad_restored_state() {
        // Long watermark below entry gets clamped up
        assert_eq!(advance_watermark(Side::Long, 100.0, 95.0, 98.0), 100.0);
        // Short watermark of zero initializes to entry
        assert_eq!(advance_watermark(Side::Short, 100.0, 0.0, 99.0), 99.0);
    }

    #[test]
    fn test_exactly_one_tier_applies() {
        let params = test_params();

        // Below tier 1: base
        let (tier, _) = effective_stop(Side::Long, 100.0, 101.0, &params);
        assert_eq!(tier, StopTier::Base);

        // Between activations: fee lock
        let (tier, _) = effective_stop(Side::Long, 100.0, 101.6, &params);
        assert_eq!(tier, StopTier::FeeLock);

        // At and above tier 2: ratchet
        let (tier, _) = effective_stop(Side::Long, 100.0, 102.5, &params);
        assert_eq!(tier, StopTier::Ratchet);
        let (tier, _) = effective_stop(Side::Long, 100.0, 110.0, &params);
        assert_eq!(tier, StopTier::Ratchet);
    }

    #[test]
    fn test_no_premature_tiering_long() {
        let params = test_params();
        let entry = 100.0;

        // 1% peak profit: still the base stop at 98.0
        let extreme = advance_watermark(Side::Long, entry, entry, 101.0);
        let (tier, stop) = effective_stop(Side::Long, entry, extreme, &params);
        assert_eq!(tier, StopTier::Base);
        assert_eq!(stop, 98.0);
        assert_eq!(evaluate(Side::Long, entry, extreme, 101.0, &params), RiskDecision::Hold);

        // 1.6% peak profit: tier 1 locks 100.2
        let extreme = advance_watermark(Side::Long, entry, extreme, 101.6);
        let (tier, stop) = effective_stop(Side::Long, entry, extreme, &params);
        assert_eq!(tier, StopTier::FeeLock);
        assert!((stop - 100.2).abs() < 1e-9);

        // Peak 103 then retreat to 101.4: ratchet stop 103 * 0.985 = 101.455
        let extreme = advance_watermark(Side::Long, entry, extreme, 103.0);
        let extreme = advance_watermark(Side::Long, entry, extreme, 101.4);
        assert_eq!(extreme, 103.0);
        let (tier, stop) = effective_stop(Side::Long, entry, extreme, &params);
        assert_eq!(tier, StopTier::Ratchet);
        assert!((stop - 101.455).abs() < 1e-9);
        assert_eq!(
            evaluate(Side::Long, entry, extreme, 101.4, &params),
            RiskDecision::StopOut(StopTier::Ratchet)
        );
    }

    #[test]
    fn test_short_side_symmetry() {
        let params = test_params();
        let entry = 100.0;

        // Peak low 97 is 3% profit, ratchet armed at 97 * 1.015 = 98.455
        let extreme = advance_watermark(Side::Short, entry, entry, 97.0);
        assert_eq!(extreme, 97.0);
        let (tier, stop) = effective_stop(Side::Short, entry, extreme, &params);
        assert_eq!(tier, StopTier::Ratchet);
        assert!((stop - 98.455).abs() < 1e-9);

        // Bounce to 99.0 crosses the stop
        let extreme = advance_watermark(Side::Short, entry, extreme, 99.0);
        assert_eq!(extreme, 97.0);
        assert_eq!(
            evaluate(Side::Short, entry, extreme, 99.0, &params),
            RiskDecision::StopOut(StopTier::Ratchet)
        );
    }

    #[test]
    fn test_ratchet_never_retreats() {
        let params = test_params();
        let entry = 100.0;
        let mut extreme = entry;
        let mut best_stop = f64::MIN;

        for mark in [103.0, 104.0, 102.0, 106.0, 103.5] {
            extreme = advance_watermark(Side::Long, entry, extreme, mark);
            let (tier, stop) = effective_stop(Side::Long, entry, extreme, &params);
            assert_eq!(tier, StopTier::Ratchet);
            assert!(stop >= best_stop);
            best_stop = best_stop.max(stop);
        }
    }

    #[test]
    fn test_take_profit_is_tier_independent() {
        let params = test_params();

        assert_eq!(take_profit_price(Side::Long, 100.0, &params), 130.0);
        assert_eq!(take_profit_price(Side::Short, 100.0, &params), 70.0);

        // TP fires even while the ratchet is armed
        assert_eq!(
            evaluate(Side::Long, 100.0, 131.0, 131.0, &params),
            RiskDecision::TakeProfit
        );
        assert_eq!(
            evaluate(Side::Short, 100.0, 69.0, 69.0, &params),
            RiskDecision::TakeProfit
        );
    }

    #[test]
    fn test_base_stop_fires_on_plain_loss() {
        let params = test_params();

        assert_eq!(
            evaluate(Side::Long, 100.0, 100.0, 97.9, &params),
            RiskDecision::StopOut(StopTier::Base)
        );
        assert_eq!(
            evaluate(Side::Short, 100.0, 100.0, 102.1, &params),
            RiskDecision::StopOut(StopTier::Base)
        );
    }

    #[test]
    fn test_fee_lock_stop_holds_inside_band() {
        let params = test_params();

        // Peak 1.6%, mark drifts back to 100.5: above the 100.2 lock, hold
        assert_eq!(
            evaluate(Side::Long, 100.0, 101.6, 100.5, &params),
            RiskDecision::Hold
        );
        // Mark through the lock: stop out, tagged tier 1
        assert_eq!(
            evaluate(Side::Long, 100.0, 101.6, 100.15, &params),
            RiskDecision::StopOut(StopTier::FeeLock)
        );
    }
}
