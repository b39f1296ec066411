use crate::api::ExchangeClient;
use tokio::time::{sleep, Duration};

const BOOK_ATTEMPTS: u32 = 3;
const BOOK_RETRY_DELAY_MS: u64 = 500;

/// Resolves a current reference price for a symbol.
///
/// Order of preference: order-book midpoint (up to three attempts), then the
/// close of the most recent 1-minute candle. Returns None when both fail;
/// callers must skip the symbol for the tick rather than guess a price.
pub struct PriceOracle {
    exchange: ExchangeClient,
}

impl PriceOracle {
    pub fn new(exchange: ExchangeClient) -> Self {
        Self { exchange }
    }

    pub async fn resolve_price(&self, symbol: &str) -> Option<f64> {
        for attempt in 1..=BOOK_ATTEMPTS {
            match self.exchange.get_order_book(symbol).await {
                Ok(top) => {
                    let mid = top.midpoint();
                    if mid > 0.0 {
                        return Some(mid);
                    }
                    tracing::warn!("Non-positive midpoint for {}, ignoring", symbol);
                }
                Err(e) => {
                    tracing::warn!(
                        "Order book attempt {}/{} failed for {}: {}",
                        attempt,
                        BOOK_ATTEMPTS,
                        symbol,
                        e
                    );
                }
            }

            if attempt < BOOK_ATTEMPTS {
                sleep(Duration::from_millis(BOOK_RETRY_DELAY_MS)).await;
            }
        }

        tracing::warn!("Order book exhausted for {}, trying candle fallback", symbol);

        match self.exchange.get_recent_candles(symbol, "1m", 1).await {
            Ok(candles) => match candles.last() {
                Some(candle) if candle.close > 0.0 => {
                    tracing::info!("Fallback price for {}: {}", symbol, candle.close);
                    Some(candle.close)
                }
                _ => {
                    tracing::warn!("Candle fallback returned no usable close for {}", symbol);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("Candle fallback failed for {}: {}", symbol, e);
                None
            }
        }
    }
}
