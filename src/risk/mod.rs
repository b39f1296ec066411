// Risk management module
pub mod stale;
pub mod trailing;

pub use stale::{held_too_long, hours_held, needs_review, winner_exempt};
pub use trailing::{
    advance_watermark, effective_stop, evaluate, favorable_pct, take_profit_price, RiskDecision,
    StopTier,
};
