//! Telegram notifications with graceful degradation.
//!
//! Missing credentials turn the notifier into a log-only sink instead of an
//! error, and delivery failures are logged and swallowed. Notifications must
//! never take the trading loop down.

use reqwest::Client;
use serde_json::json;
use tracing::{info, warn};

use crate::models::Position;

pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    token: String,
    chat_id: String,
    enabled: bool,
}

impl TelegramNotifier {
    pub fn new(token: &str, chat_id: &str) -> Self {
        Self::with_api_base(token, chat_id, "https://api.telegram.org")
    }

    pub fn with_api_base(token: &str, chat_id: &str, api_base: &str) -> Self {
        let enabled = !token.is_empty() && !chat_id.is_empty();
        if !enabled {
            info!("telegram credentials not set, notifications go to the log only");
        }
        Self {
            client: Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
            chat_id: chat_id.to_string(),
            enabled,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Deliver a message; failures are logged, never raised
    pub async fn send(&self, text: &str) {
        if !self.enabled {
            info!(message = text, "notification (log only)");
            return;
        }

        let url = format!("{}/bot{}/sendMessage", self.api_base, self.token);
        let body = json!({ "chat_id": self.chat_id, "text": text });

        match self.client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), "telegram rejected notification");
            }
            Err(err) => {
                warn!(error = %err, "telegram notification failed");
            }
        }
    }

    pub async fn position_opened(&self, position: &Position) {
        self.send(&format!(
            "📈 Opened {} {} qty {:.6} @ {:.4} (SL {:.4} / TP {:.4})",
            position.side.as_str(),
            position.symbol,
            position.quantity,
            position.entry_price,
            position.stop_loss,
            position.take_profit,
        ))
        .await;
    }

    pub async fn position_closed(&self, position: &Position, reason: &str, balance: f64) {
        self.send(&format!(
            "🛑 Closed {} {} @ {:.4}: {} | PnL {:+.2} | balance {:.2}",
            position.side.as_str(),
            position.symbol,
            position.close_exec.unwrap_or(0.0),
            reason,
            position.pnl,
            balance,
        ))
        .await;
    }

    pub async fn alert(&self, text: &str) {
        self.send(&format!("⚠️ {text}")).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_credentials_disable_delivery() {
        assert!(!TelegramNotifier::new("", "").is_enabled());
        assert!(!TelegramNotifier::new("token", "").is_enabled());
        assert!(!TelegramNotifier::new("", "42").is_enabled());
        assert!(TelegramNotifier::new("token", "42").is_enabled());
    }

    #[tokio::test]
    async fn test_send_posts_to_bot_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/botTEST_TOKEN/sendMessage")
            .match_body(mockito::Matcher::PartialJsonString(
                r#"{"chat_id":"42","text":"hello"}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"ok":true}"#)
            .create_async()
            .await;

        let notifier = TelegramNotifier::with_api_base("TEST_TOKEN", "42", &server.url());
        notifier.send("hello").await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_delivery_failure_does_not_panic() {
        // nothing is listening on this port
        let notifier =
            TelegramNotifier::with_api_base("TEST_TOKEN", "42", "http://127.0.0.1:9");
        notifier.send("hello").await;
    }

    #[tokio::test]
    async fn test_disabled_notifier_skips_network() {
        let notifier = TelegramNotifier::new("", "");
        // would hang or error if it tried the real API
        notifier.send("hello").await;
    }
}
