use serde::{Deserialize, Serialize};

/// Risk-engine parameters. All percentages are fractions (0.02 = 2%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskParams {
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,
    /// Peak-profit fraction that arms the Tier 1 fee-covering lock
    pub tier1_activation: f64,
    /// Entry-relative profit locked by Tier 1
    pub tier1_lock: f64,
    /// Peak-profit fraction that arms the Tier 2 dynamic ratchet
    pub tier2_activation: f64,
    /// Trailing distance from the watermark once Tier 2 is armed
    pub trail_callback: f64,
    /// Hours before a non-winning position is escalated to the reviewer
    pub max_hold_hours: f64,
    /// Minimum signal confidence required to trade
    pub min_confidence: f64,
    pub max_open_positions: usize,
    /// Re-entry cooldown after an exit, in 15-minute candle buckets
    pub reentry_cooldown_candles: i64,
    /// Ledger-vs-exchange entry price divergence that gets surfaced
    pub entry_divergence_tolerance: f64,
    /// When true, a flagged divergence rewrites the ledger entry price and
    /// resets the watermark to it. When false the watermark is preserved.
    pub resync_on_divergence: bool,
}

impl Default for RiskParams {
    fn default() -> Self {
        Self {
            take_profit_pct: 0.30,
            stop_loss_pct: 0.02,
            tier1_activation: 0.015,
            tier1_lock: 0.002,
            tier2_activation: 0.025,
            trail_callback: 0.015,
            max_hold_hours: 12.0,
            min_confidence: 0.6,
            max_open_positions: 3,
            reentry_cooldown_candles: 3,
            entry_divergence_tolerance: 0.01,
            resync_on_divergence: false,
        }
    }
}

/// Static configuration loaded once at startup from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub exchange_base_url: String,
    pub exchange_api_key: String,
    pub database_url: String,
    pub ai_base_url: String,
    pub ai_api_key: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    /// Fast polling interval for the risk loop, seconds
    pub tick_secs: u64,
    /// Coarser cadence for the stale-position review, seconds
    pub review_interval_secs: u64,
    /// Fallback target notional when the store has no position_size
    pub default_notional: f64,
    pub risk: RiskParams,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            exchange_base_url: env_string("EXCHANGE_BASE_URL", "https://api.exchange.example"),
            exchange_api_key: env_string("EXCHANGE_API_KEY", ""),
            database_url: env_string("DATABASE_URL", "postgres://localhost/perpbot"),
            ai_base_url: env_string("AI_BASE_URL", "https://api.openai.com/v1"),
            ai_api_key: env_string("AI_API_KEY", ""),
            telegram_bot_token: std::env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: std::env::var("TELEGRAM_CHAT_ID").ok(),
            tick_secs: env_u64("TICK_SECS", 10),
            review_interval_secs: env_u64("REVIEW_INTERVAL_SECS", 3600),
            default_notional: env_f64("POSITION_SIZE_USDC", 30.0),
            risk: RiskParams {
                resync_on_divergence: env_bool("RESYNC_ON_DIVERGENCE", false),
                ..RiskParams::default()
            },
        }
    }
}

/// Mutable runtime parameters, re-read from the persisted store at the top
/// of every tick and passed into the tick as a snapshot.
#[derive(Debug, Clone)]
pub struct RuntimeSnapshot {
    pub paused: bool,
    pub target_notional: f64,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}
