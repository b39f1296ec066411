use crate::api::ExchangeClient;
use crate::config::RiskParams;
use crate::models::{PositionOrigin, Side, Signal, SignalAction, TrackedPosition};
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Duration};

/// Grace period before re-querying the exchange for an asynchronous fill
const FILL_CONFIRM_DELAY_MS: u64 = 1000;

/// Seconds per cooldown bucket (15-minute candles)
const COOLDOWN_CANDLE_SECS: i64 = 900;

/// Why a signal was not executed
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    HoldSignal,
    LowConfidence(f64),
    AlreadyPositioned,
    PositionLimitReached,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::HoldSignal => write!(f, "hold signal"),
            SkipReason::LowConfidence(c) => write!(f, "low confidence {:.2}", c),
            SkipReason::AlreadyPositioned => write!(f, "already have open position"),
            SkipReason::PositionLimitReached => write!(f, "max open positions reached"),
        }
    }
}

/// Decide whether a signal is eligible for execution. Pure so the gate can
/// be tested without any exchange or ledger.
pub fn validate_signal(
    signal: &Signal,
    has_open_position: bool,
    open_count: usize,
    params: &RiskParams,
) -> Result<(), SkipReason> {
    if signal.action == SignalAction::Hold {
        return Err(SkipReason::HoldSignal);
    }
    if signal.confidence < params.min_confidence {
        return Err(SkipReason::LowConfidence(signal.confidence));
    }
    if has_open_position {
        return Err(SkipReason::AlreadyPositioned);
    }
    if open_count >= params.max_open_positions {
        return Err(SkipReason::PositionLimitReached);
    }
    Ok(())
}

/// Re-entry discipline: true while `now` falls within
/// `cooldown_candles` 15-minute buckets of the last exit. Bucket indices are
/// compared, not raw durations, so an exit late in a candle still blocks the
/// same candle.
pub fn in_cooldown(last_exit: DateTime<Utc>, now: DateTime<Utc>, cooldown_candles: i64) -> bool {
    let last_bucket = last_exit.timestamp() / COOLDOWN_CANDLE_SECS;
    let current_bucket = now.timestamp() / COOLDOWN_CANDLE_SECS;
    current_bucket - last_bucket < cooldown_candles
}

/// Places orders on the exchange and resolves realized prices.
pub struct Executor {
    exchange: ExchangeClient,
}

impl Executor {
    pub fn new(exchange: ExchangeClient) -> Self {
        Self { exchange }
    }

    /// Close a position with an opposing reduce-only market order and return
    /// the realized exit price.
    ///
    /// Resolution order: average price from the immediate ack; after a short
    /// wait, the order queried by id; finally the mark price that triggered
    /// the close. Bounded: one wait, one re-query, never a poll loop.
    pub async fn close_position(
        &self,
        symbol: &str,
        quantity: f64,
        side: Side,
        trigger_mark: f64,
    ) -> anyhow::Result<f64> {
        let order_side = side.closing_order_side();
        tracing::info!(
            "Closing {} {:.6} {} at market (reduce-only)",
            order_side,
            quantity,
            symbol
        );

        let ack = self
            .exchange
            .place_order(symbol, order_side, quantity, true)
            .await?;

        if let Some(price) = ack.avg_fill_price {
            return Ok(price);
        }

        if let Some(order_id) = ack.order_id {
            tracing::info!("Close order {} pending, waiting for fill...", order_id);
            sleep(Duration::from_millis(FILL_CONFIRM_DELAY_MS)).await;

            match self.exchange.get_order(order_id).await {
                Ok(detail) => {
                    if let Some(price) = detail.avg_fill_price {
                        tracing::info!("Actual exit price for {}: {}", symbol, price);
                        return Ok(price);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to fetch close order {}: {}", order_id, e);
                }
            }
        }

        tracing::warn!(
            "No realized exit price for {}, falling back to trigger mark {}",
            symbol,
            trigger_mark
        );
        Ok(trigger_mark)
    }

    /// Execute a consumed signal and return the resulting ledger row
    /// (not yet persisted).
    ///
    /// Entry price resolution mirrors the close path: ack average, then the
    /// exchange position after a short wait, then the signal's own price.
    pub async fn open_from_signal(
        &self,
        signal: &Signal,
        quantity: f64,
    ) -> anyhow::Result<TrackedPosition> {
        let (order_side, side) = match signal.action {
            SignalAction::Buy => ("BUY", Side::Long),
            SignalAction::Sell => ("SELL", Side::Short),
            SignalAction::Hold => anyhow::bail!("hold signal cannot be executed"),
        };

        tracing::info!(
            "Executing {} {:.6} {} ({:.2} notional)",
            order_side,
            quantity,
            signal.symbol,
            quantity * signal.entry_price
        );

        let ack = self
            .exchange
            .place_order(&signal.symbol, order_side, quantity, false)
            .await?;

        let mut entry_price = ack.avg_fill_price;

        if entry_price.is_none() {
            tracing::info!("Waiting for fill confirmation on {}...", signal.symbol);
            sleep(Duration::from_millis(FILL_CONFIRM_DELAY_MS)).await;

            match self.exchange.get_position(&signal.symbol).await {
                Ok(Some(position)) if position.average_open_price > 0.0 => {
                    entry_price = Some(position.average_open_price);
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!("Failed to confirm fill for {}: {}", signal.symbol, e);
                }
            }
        }

        let entry_price = entry_price.unwrap_or(signal.entry_price);
        tracing::info!(
            "Trade executed: {} {:.6} {} @ {}",
            order_side,
            quantity,
            signal.symbol,
            entry_price
        );

        Ok(TrackedPosition::open(
            signal.symbol.clone(),
            side,
            entry_price,
            quantity,
            PositionOrigin::Signal,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample_signal(action: SignalAction, confidence: f64) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "PERP_ETH_USDC".to_string(),
            action,
            confidence,
            entry_price: 2500.0,
            reasoning: "test".to_string(),
        }
    }

    fn executor_for(server: &mockito::Server) -> Executor {
        Executor::new(ExchangeClient::new(server.url(), "test-key".to_string()))
    }

    #[test]
    fn test_validate_signal_gates() {
        let params = RiskParams::default();

        assert_eq!(
            validate_signal(&sample_signal(SignalAction::Hold, 0.9), false, 0, &params),
            Err(SkipReason::HoldSignal)
        );
        assert_eq!(
            validate_signal(&sample_signal(SignalAction::Buy, 0.5), false, 0, &params),
            Err(SkipReason::LowConfidence(0.5))
        );
        assert_eq!(
            validate_signal(&sample_signal(SignalAction::Buy, 0.9), true, 1, &params),
            Err(SkipReason::AlreadyPositioned)
        );
        assert_eq!(
            validate_signal(&sample_signal(SignalAction::Buy, 0.9), false, 3, &params),
            Err(SkipReason::PositionLimitReached)
        );
        assert!(validate_signal(&sample_signal(SignalAction::Sell, 0.9), false, 1, &params).is_ok());
    }

    #[test]
    fn test_cooldown_buckets() {
        let exit = DateTime::parse_from_rfc3339("2024-01-01T10:07:00Z")
            .unwrap()
            .with_timezone(&Utc);

        // Same candle
        let now = DateTime::parse_from_rfc3339("2024-01-01T10:14:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(in_cooldown(exit, now, 3));

        // Two candles later, still inside a 3-candle cooldown
        let now = DateTime::parse_from_rfc3339("2024-01-01T10:40:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(in_cooldown(exit, now, 3));

        // Three full candles later, cooldown expired
        let now = DateTime::parse_from_rfc3339("2024-01-01T10:46:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(!in_cooldown(exit, now, 3));
    }

    #[tokio::test]
    async fn test_exit_price_from_immediate_ack() {
        let mut server = mockito::Server::new_async().await;
        let _order = server
            .mock("POST", "/v1/order")
            .with_status(200)
            .with_body(
                r#"{"success": true, "data": {"order_id": 42, "average_executed_price": 101.5}}"#,
            )
            .create_async()
            .await;

        let exit = executor_for(&server)
            .close_position("PERP_ETH_USDC", 0.5, Side::Long, 100.0)
            .await
            .unwrap();

        assert_eq!(exit, 101.5);
    }

    #[tokio::test]
    async fn test_exit_price_from_order_requery() {
        let mut server = mockito::Server::new_async().await;
        let _order = server
            .mock("POST", "/v1/order")
            .with_status(200)
            .with_body(r#"{"success": true, "data": {"order_id": 42, "average_executed_price": 0.0}}"#)
            .create_async()
            .await;
        let _detail = server
            .mock("GET", "/v1/order/42")
            .with_status(200)
            .with_body(
                r#"{"success": true, "data": {"order_id": 42, "average_executed_price": 99.25}}"#,
            )
            .create_async()
            .await;

        let exit = executor_for(&server)
            .close_position("PERP_ETH_USDC", 0.5, Side::Long, 100.0)
            .await
            .unwrap();

        assert_eq!(exit, 99.25);
    }

    #[tokio::test]
    async fn test_exit_price_falls_back_to_trigger_mark() {
        let mut server = mockito::Server::new_async().await;
        let _order = server
            .mock("POST", "/v1/order")
            .with_status(200)
            .with_body(r#"{"success": true, "data": {"order_id": 42, "average_executed_price": 0.0}}"#)
            .create_async()
            .await;
        let _detail = server
            .mock("GET", "/v1/order/42")
            .with_status(200)
            .with_body(r#"{"success": true, "data": {"order_id": 42, "average_executed_price": 0.0}}"#)
            .create_async()
            .await;

        let exit = executor_for(&server)
            .close_position("PERP_ETH_USDC", 0.5, Side::Long, 100.0)
            .await
            .unwrap();

        assert_eq!(exit, 100.0);
    }

    #[tokio::test]
    async fn test_open_uses_position_requery_for_async_fill() {
        let mut server = mockito::Server::new_async().await;
        let _order = server
            .mock("POST", "/v1/order")
            .with_status(200)
            .with_body(r#"{"success": true, "data": {"order_id": 7, "average_executed_price": null}}"#)
            .create_async()
            .await;
        let _position = server
            .mock("GET", "/v1/position/PERP_ETH_USDC")
            .with_status(200)
            .with_body(
                r#"{"success": true, "data": {"symbol": "PERP_ETH_USDC", "position_qty": 0.5, "average_open_price": 2498.5, "mark_price": null}}"#,
            )
            .create_async()
            .await;

        let position = executor_for(&server)
            .open_from_signal(&sample_signal(SignalAction::Buy, 0.9), 0.5)
            .await
            .unwrap();

        assert_eq!(position.entry_price, 2498.5);
        assert_eq!(position.extreme_price, 2498.5);
        assert_eq!(position.side, Side::Long);
    }
}
