use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position direction, derived from the sign of the exchange quantity
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// A positive exchange quantity is a long position, negative is short
    pub fn from_signed_qty(qty: f64) -> Self {
        if qty >= 0.0 {
            Side::Long
        } else {
            Side::Short
        }
    }

    /// Order side that closes a position in this direction
    pub fn closing_order_side(&self) -> &'static str {
        match self {
            Side::Long => "SELL",
            Side::Short => "BUY",
        }
    }
}

/// Lifecycle status of a tracked position. A position is terminated exactly
/// once: Open transitions to one of the Closed variants and never back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    ClosedTp,
    ClosedSl,
    ClosedManual,
    ClosedAiStale,
}

/// How a ledger row came to exist
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PositionOrigin {
    /// Opened by executing a consumed signal
    Signal,
    /// Adopted from an exchange position that was opened outside the engine
    Orphan,
}

/// One tracked position in the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    /// Favorable watermark: highest mark seen since open for longs, lowest
    /// for shorts. Never less favorable than the entry price.
    pub extreme_price: f64,
    pub status: PositionStatus,
    pub origin: PositionOrigin,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub realized_pnl: Option<f64>,
}

impl TrackedPosition {
    /// Create a new open position. The watermark starts at the entry price.
    pub fn open(
        symbol: String,
        side: Side,
        entry_price: f64,
        quantity: f64,
        origin: PositionOrigin,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol,
            side,
            entry_price,
            quantity,
            extreme_price: entry_price,
            status: PositionStatus::Open,
            origin,
            entry_time: Utc::now(),
            exit_time: None,
            exit_price: None,
            realized_pnl: None,
        }
    }

    /// Realized PnL of this position if it exited at `exit_price`
    pub fn pnl_at(&self, exit_price: f64) -> f64 {
        realized_pnl(self.side, self.entry_price, exit_price, self.quantity)
    }
}

/// Realized PnL for a closed quantity: (exit - entry) * qty for longs,
/// (entry - exit) * qty for shorts. `quantity` is absolute.
pub fn realized_pnl(side: Side, entry_price: f64, exit_price: f64, quantity: f64) -> f64 {
    match side {
        Side::Long => (exit_price - entry_price) * quantity,
        Side::Short => (entry_price - exit_price) * quantity,
    }
}

/// Read-only snapshot of an exchange position. The exchange is the source of
/// truth for whether a position exists; its entry price may disagree with the
/// ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed quantity: positive long, negative short
    pub quantity: f64,
    pub average_open_price: f64,
    pub mark_price: Option<f64>,
}

impl ExchangePosition {
    pub fn side(&self) -> Side {
        Side::from_signed_qty(self.quantity)
    }

    pub fn abs_qty(&self) -> f64 {
        self.quantity.abs()
    }

    pub fn is_flat(&self) -> bool {
        self.quantity == 0.0
    }
}

/// OHLCV candlestick from the exchange kline endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Top of the order book
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderBookTop {
    pub best_bid: f64,
    pub best_ask: f64,
}

impl OrderBookTop {
    pub fn midpoint(&self) -> f64 {
        (self.best_bid + self.best_ask) / 2.0
    }
}

/// Exchange trading rules for a symbol
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolRules {
    /// Minimum quantity step
    pub base_tick: f64,
    /// Minimum order value (quantity * price)
    pub min_notional: f64,
}

/// Direction requested by a trading signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// Trading signal produced by the external analyst. Consumed at most once by
/// the execution path, then kept as an audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Uuid,
    pub symbol: String,
    pub action: SignalAction,
    pub confidence: f64,
    pub entry_price: f64,
    pub reasoning: String,
}

/// Acknowledgement from the exchange after placing an order
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: Option<i64>,
    /// Zero or absent when the fill is still settling asynchronously
    pub avg_fill_price: Option<f64>,
}

/// Reviewer verdict for a stale position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Close,
    Hold,
}

/// Remote command consumed from the persisted queue
#[derive(Debug, Clone)]
pub struct Command {
    pub id: i64,
    pub kind: CommandKind,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    ClosePosition,
    CloseAll,
    ForceReview,
}

impl CommandKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "CLOSE_POSITION" => Some(CommandKind::ClosePosition),
            "CLOSE_ALL" => Some(CommandKind::CloseAll),
            "FORCE_REVIEW" => Some(CommandKind::ForceReview),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_side_from_signed_qty() {
        assert_eq!(Side::from_signed_qty(5.0), Side::Long);
        assert_eq!(Side::from_signed_qty(-0.25), Side::Short);
    }

    #[test]
    fn test_closing_order_side() {
        assert_eq!(Side::Long.closing_order_side(), "SELL");
        assert_eq!(Side::Short.closing_order_side(), "BUY");
    }

    #[test]
    fn test_open_position_initializes_watermark_to_entry() {
        let position = TrackedPosition::open(
            "PERP_ETH_USDC".to_string(),
            Side::Long,
            2500.0,
            0.1,
            PositionOrigin::Signal,
        );

        assert_eq!(position.extreme_price, 2500.0);
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.exit_price.is_none());
        assert!(position.realized_pnl.is_none());
    }

    #[test]
    fn test_realized_pnl_long_and_short() {
        // Long: bought 2 @ 100, sold @ 110 -> +20
        assert_eq!(realized_pnl(Side::Long, 100.0, 110.0, 2.0), 20.0);
        // Short: sold 2 @ 100, bought back @ 110 -> -20
        assert_eq!(realized_pnl(Side::Short, 100.0, 110.0, 2.0), -20.0);
    }

    #[test]
    fn test_exchange_position_side() {
        let pos = ExchangePosition {
            symbol: "PERP_SOL_USDC".to_string(),
            quantity: -3.0,
            average_open_price: 150.0,
            mark_price: None,
        };

        assert_eq!(pos.side(), Side::Short);
        assert_eq!(pos.abs_qty(), 3.0);
        assert!(!pos.is_flat());
    }

    #[test]
    fn test_command_kind_parse() {
        assert_eq!(
            CommandKind::parse("CLOSE_POSITION"),
            Some(CommandKind::ClosePosition)
        );
        assert_eq!(CommandKind::parse("CLOSE_ALL"), Some(CommandKind::CloseAll));
        assert_eq!(CommandKind::parse("NOPE"), None);
    }
}
