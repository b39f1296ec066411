use crate::config::RiskParams;
use chrono::{DateTime, Utc};

/// Hours a position has been held. Both timestamps are UTC; mixing time
/// references here would silently corrupt the age gate, so callers must
/// only pass ledger timestamps stored as TIMESTAMPTZ.
pub fn hours_held(entry_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (now - entry_time).num_seconds() as f64 / 3600.0
}

/// Age gate: positions at or under the limit are never escalated
pub fn held_too_long(hours_held: f64, params: &RiskParams) -> bool {
    hours_held > params.max_hold_hours
}

/// Winner gate: positions already in the Tier 2 profit zone are left to the
/// ratchet instead of being second-guessed by the reviewer
pub fn winner_exempt(pnl_pct: f64, params: &RiskParams) -> bool {
    pnl_pct >= params.tier2_activation
}

/// Whether a position should be escalated to the external reviewer
pub fn needs_review(hours_held: f64, pnl_pct: f64, params: &RiskParams) -> bool {
    held_too_long(hours_held, params) && !winner_exempt(pnl_pct, params)
}
