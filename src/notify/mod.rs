use tokio::time::Duration;

/// Hard cap so a slow Telegram API can never stall the trading loop
const SEND_TIMEOUT_SECS: u64 = 2;

/// Fire-and-forget Telegram notifications.
///
/// Unconfigured (missing token or chat id) the notifier is a silent no-op.
/// Send failures are logged and swallowed.
pub struct TelegramNotifier {
    api_url: Option<String>,
    chat_id: Option<String>,
    client: reqwest::Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: Option<String>, chat_id: Option<String>) -> Self {
        let api_url = bot_token
            .as_ref()
            .map(|token| format!("https://api.telegram.org/bot{}/sendMessage", token));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(SEND_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            api_url,
            chat_id,
            client,
        }
    }

    #[cfg(test)]
    fn with_api_url(api_url: String, chat_id: String) -> Self {
        Self {
            api_url: Some(api_url),
            chat_id: Some(chat_id),
            client: reqwest::Client::new(),
        }
    }

    pub async fn send(&self, text: &str) {
        let (Some(api_url), Some(chat_id)) = (&self.api_url, &self.chat_id) else {
            return;
        };

        let payload = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });

        if let Err(e) = self.client.post(api_url).json(&payload).send().await {
            tracing::warn!("Failed to send notification: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unconfigured_notifier_is_a_noop() {
        let notifier = TelegramNotifier::new(None, None);
        // Must return without any network activity
        notifier.send("hello").await;
    }

    #[tokio::test]
    async fn test_send_posts_payload() {
        let mut server = mockito::Server::new_async().await;
        let m = server
            .mock("POST", "/sendMessage")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "chat_id": "42",
                "text": "position closed",
            })))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let notifier =
            TelegramNotifier::with_api_url(format!("{}/sendMessage", server.url()), "42".into());
        notifier.send("position closed").await;

        m.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_failure_is_swallowed() {
        let notifier = TelegramNotifier::with_api_url(
            "http://127.0.0.1:9/sendMessage".to_string(),
            "42".to_string(),
        );
        // Connection refused must not panic or propagate
        notifier.send("hello").await;
    }
}
