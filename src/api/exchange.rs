use crate::models::{Candle, ExchangePosition, OrderAck, OrderBookTop, SymbolRules};
use governor::{Quota, RateLimiter};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::num::NonZeroU32;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::{sleep, Duration};

const REQUEST_TIMEOUT_SECS: u64 = 10;
const RATE_LIMIT_RPM: u32 = 120;
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

// Type alias for the rate limiter to simplify signatures
type ExchangeRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Errors from the exchange gateway, grouped by how callers should react:
/// transient errors were already retried and the caller skips this tick,
/// malformed data must never be turned into a fabricated price, rejections
/// are final answers from the exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("exchange returned HTTP {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("rejected by exchange: {0}")]
    Rejected(String),
}

impl ExchangeError {
    fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Transport(_) => true,
            ExchangeError::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Standard response envelope used by the exchange REST API
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BookLevel {
    price: f64,
    #[allow(dead_code)]
    quantity: f64,
}

#[derive(Debug, Deserialize)]
struct OrderBookData {
    asks: Vec<BookLevel>,
    bids: Vec<BookLevel>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    rows: Vec<KlineRow>,
}

#[derive(Debug, Deserialize)]
struct KlineRow {
    start_timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

#[derive(Debug, Deserialize)]
struct PositionListData {
    rows: Vec<PositionRow>,
}

#[derive(Debug, Deserialize)]
struct PositionRow {
    symbol: String,
    position_qty: f64,
    average_open_price: f64,
    mark_price: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfoData {
    base_tick: f64,
    min_notional: f64,
}

#[derive(Debug, Deserialize)]
struct OrderData {
    order_id: Option<i64>,
    average_executed_price: Option<f64>,
}

/// REST client for the perp exchange gateway.
///
/// Cloneable; all clones share the same rate limiter.
#[derive(Clone)]
pub struct ExchangeClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limiter: Arc<ExchangeRateLimiter>,
}

impl ExchangeClient {
    pub fn new(base_url: String, api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        let quota = Quota::per_minute(NonZeroU32::new(RATE_LIMIT_RPM).unwrap());
        let rate_limiter = Arc::new(RateLimiter::direct(quota));

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            rate_limiter,
        }
    }

    /// Best bid/ask for a symbol
    pub async fn get_order_book(&self, symbol: &str) -> Result<OrderBookTop, ExchangeError> {
        let path = format!("/v1/orderbook/{}", symbol);
        let data: OrderBookData = self.get_json(&path).await?;

        let best_ask = data.asks.first().map(|l| l.price);
        let best_bid = data.bids.first().map(|l| l.price);

        match (best_bid, best_ask) {
            (Some(best_bid), Some(best_ask)) if best_bid > 0.0 && best_ask > 0.0 => {
                Ok(OrderBookTop { best_bid, best_ask })
            }
            _ => Err(ExchangeError::Malformed(format!(
                "empty order book for {}",
                symbol
            ))),
        }
    }

    /// Most recent candles, oldest first
    pub async fn get_recent_candles(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let path = format!(
            "/v1/kline?symbol={}&type={}&limit={}",
            symbol, interval, limit
        );
        let data: KlineData = self.get_json(&path).await?;

        let mut candles = Vec::with_capacity(data.rows.len());
        for row in data.rows {
            let timestamp = chrono::DateTime::from_timestamp_millis(row.start_timestamp)
                .ok_or_else(|| {
                    ExchangeError::Malformed(format!("bad candle timestamp {}", row.start_timestamp))
                })?;
            candles.push(Candle {
                timestamp,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        candles.sort_by_key(|c| c.timestamp);
        Ok(candles)
    }

    /// All non-zero exchange positions
    pub async fn get_open_positions(&self) -> Result<Vec<ExchangePosition>, ExchangeError> {
        let data: PositionListData = self.get_json("/v1/positions").await?;

        Ok(data
            .rows
            .into_iter()
            .filter(|row| row.position_qty != 0.0)
            .map(|row| ExchangePosition {
                symbol: row.symbol,
                quantity: row.position_qty,
                average_open_price: row.average_open_price,
                mark_price: row.mark_price.filter(|p| *p > 0.0),
            })
            .collect())
    }

    /// Current position for one symbol, None when flat
    pub async fn get_position(
        &self,
        symbol: &str,
    ) -> Result<Option<ExchangePosition>, ExchangeError> {
        let path = format!("/v1/position/{}", symbol);
        let row: PositionRow = self.get_json(&path).await?;

        if row.position_qty == 0.0 {
            return Ok(None);
        }
        Ok(Some(ExchangePosition {
            symbol: row.symbol,
            quantity: row.position_qty,
            average_open_price: row.average_open_price,
            mark_price: row.mark_price.filter(|p| *p > 0.0),
        }))
    }

    /// Trading rules (quantity step, minimum order value) for a symbol
    pub async fn get_symbol_rules(&self, symbol: &str) -> Result<SymbolRules, ExchangeError> {
        let path = format!("/v1/public/info/{}", symbol);
        let data: SymbolInfoData = self.get_json(&path).await?;

        if data.base_tick <= 0.0 {
            return Err(ExchangeError::Malformed(format!(
                "non-positive base_tick for {}",
                symbol
            )));
        }
        Ok(SymbolRules {
            base_tick: data.base_tick,
            min_notional: data.min_notional,
        })
    }

    /// Place a market order. `reduce_only` closes without flipping.
    pub async fn place_order(
        &self,
        symbol: &str,
        order_side: &str,
        quantity: f64,
        reduce_only: bool,
    ) -> Result<OrderAck, ExchangeError> {
        let body = serde_json::json!({
            "symbol": symbol,
            "order_type": "MARKET",
            "side": order_side,
            "order_quantity": quantity,
            "reduce_only": reduce_only,
        });
        let data: OrderData = self.post_json("/v1/order", &body).await?;

        Ok(OrderAck {
            order_id: data.order_id,
            avg_fill_price: data.average_executed_price.filter(|p| *p > 0.0),
        })
    }

    /// Fetch an order by id to learn its realized average price
    pub async fn get_order(&self, order_id: i64) -> Result<OrderAck, ExchangeError> {
        let path = format!("/v1/order/{}", order_id);
        let data: OrderData = self.get_json(&path).await?;

        Ok(OrderAck {
            order_id: data.order_id.or(Some(order_id)),
            avg_fill_price: data.average_executed_price.filter(|p| *p > 0.0),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ExchangeError> {
        self.request_json(|client, url| client.get(url), path).await
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T, ExchangeError> {
        let body = body.clone();
        self.request_json(move |client, url| client.post(url).json(&body), path)
            .await
    }

    /// Rate-limited request with bounded retries on transient failures.
    /// Non-transient errors (4xx, rejection, malformed body) return at once.
    async fn request_json<T, F>(&self, build: F, path: &str) -> Result<T, ExchangeError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client, String) -> reqwest::RequestBuilder,
    {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error = ExchangeError::Malformed("no attempt made".to_string());

        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            let result = build(&self.client, url.clone())
                .header("x-api-key", &self.api_key)
                .send()
                .await;

            let error = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return self.decode_envelope(response).await;
                    }
                    ExchangeError::Status(status.as_u16())
                }
                Err(e) => ExchangeError::Transport(e),
            };

            if !error.is_transient() {
                return Err(error);
            }

            if attempt < MAX_RETRIES {
                let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                tracing::warn!(
                    "Attempt {}/{} failed for {}: {}. Retrying in {}ms...",
                    attempt,
                    MAX_RETRIES,
                    path,
                    error,
                    backoff_ms
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }
            last_error = error;
        }

        Err(last_error)
    }

    async fn decode_envelope<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| ExchangeError::Malformed(e.to_string()))?;

        if !envelope.success {
            return Err(ExchangeError::Rejected(
                envelope.message.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| ExchangeError::Malformed("success response without data".to_string()))
    }
}
