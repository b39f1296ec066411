//! Cognitive reviewer for stale positions.
//!
//! Asks an OpenAI-compatible chat endpoint whether a stagnant position's
//! thesis still holds. The reviewer is strictly advisory and fail-safe:
//! every failure path (network, rate limit, malformed reply) resolves to
//! Hold so a broken collaborator can never trigger a close.

use crate::models::{Candle, Verdict};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

const MODEL: &str = "gpt-4o-mini";
const MAX_TOKENS: u32 = 512;
const REQUEST_TIMEOUT_SECS: u64 = 20;
const MAX_RETRIES: u32 = 3;
const RETRY_BACKOFF_MS: u64 = 500;
/// Candles included in the review prompt
const PROMPT_CANDLES: usize = 20;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: String,
}

#[derive(Debug, Deserialize)]
struct VerdictResponse {
    action: String,
    #[serde(default)]
    #[allow(dead_code)]
    reasoning: String,
}

pub struct AiAnalyst {
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl AiAnalyst {
    pub fn new(api_key: String, base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Ask whether to keep holding a stagnant position
    pub async fn evaluate_stale(
        &self,
        symbol: &str,
        pnl_pct: f64,
        hours_held: f64,
        candles: &[Candle],
    ) -> Verdict {
        let prompt = self.build_prompt(symbol, pnl_pct, hours_held, candles);

        let request = ChatRequest {
            model: MODEL.to_string(),
            max_tokens: MAX_TOKENS,
            temperature: 0.0,
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: "You are a risk manager for a perpetual futures account. \
                              Your job is to cut dead money: if the trend behind a position \
                              is dead or reversing, CLOSE it. Respond with valid JSON only, \
                              no markdown: {\"action\": \"CLOSE\"|\"HOLD\", \"reasoning\": \"...\"}"
                        .to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: prompt,
                },
            ],
        };

        let url = format!("{}/chat/completions", self.base_url);

        for attempt in 1..=MAX_RETRIES {
            if attempt > 1 {
                let backoff_ms = RETRY_BACKOFF_MS * 2_u64.pow(attempt - 2);
                sleep(Duration::from_millis(backoff_ms)).await;
            }

            let response = match self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {}", &self.api_key))
                .header("content-type", "application/json")
                .json(&request)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(
                        "Reviewer request failed for {} (attempt {}/{}): {}",
                        symbol,
                        attempt,
                        MAX_RETRIES,
                        e
                    );
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                tracing::warn!(
                    "Reviewer returned {} for {} (attempt {}/{})",
                    status,
                    symbol,
                    attempt,
                    MAX_RETRIES
                );
                // Retry rate limits and server errors, give up on the rest
                if status.as_u16() == 429 || status.is_server_error() {
                    continue;
                }
                return Verdict::Hold;
            }

            let chat: ChatResponse = match response.json().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Reviewer response decode failed for {}: {}", symbol, e);
                    return Verdict::Hold;
                }
            };

            let Some(choice) = chat.choices.first() else {
                tracing::warn!("Reviewer returned no choices for {}", symbol);
                return Verdict::Hold;
            };

            return parse_verdict(&choice.message.content);
        }

        tracing::warn!("Reviewer unavailable for {}, holding", symbol);
        Verdict::Hold
    }

    fn build_prompt(
        &self,
        symbol: &str,
        pnl_pct: f64,
        hours_held: f64,
        candles: &[Candle],
    ) -> String {
        let recent = if candles.len() > PROMPT_CANDLES {
            &candles[candles.len() - PROMPT_CANDLES..]
        } else {
            candles
        };

        let mut table = String::from("Timestamp | Open | High | Low | Close | Volume\n");
        for candle in recent {
            table.push_str(&format!(
                "{} | {} | {} | {} | {} | {}\n",
                candle.timestamp.format("%Y-%m-%d %H:%M"),
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                candle.volume
            ));
        }

        format!(
            "I have held a position in {} for {:.1} hours.\n\
             Current PnL: {:.2}%.\n\
             The price action has been stagnant or unfavorable.\n\
             Review the recent 15m candles below. Has the trend invalidated \
             the original thesis?\n\n{}",
            symbol,
            hours_held,
            pnl_pct * 100.0,
            table
        )
    }
}

/// Parse the reviewer's reply. Markdown code fences are stripped first since
/// some models wrap JSON despite instructions. Anything unparseable is Hold.
fn parse_verdict(content: &str) -> Verdict {
    let mut text = content.trim();
    if text.starts_with("```") {
        text = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
    }

    match serde_json::from_str::<VerdictResponse>(text) {
        Ok(reply) if reply.action.eq_ignore_ascii_case("CLOSE") => Verdict::Close,
        Ok(_) => Verdict::Hold,
        Err(e) => {
            tracing::warn!("Unparseable reviewer verdict ({}): {}", e, content);
            Verdict::Hold
        }
    }
}
