//! Push notifier — bot-API-style push messages over HTTPS.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::NotifyError;
use crate::notify::Notifier;

/// Maximum message length the push API accepts.
const PUSH_MAX_MESSAGE_LENGTH: usize = 4096;

/// Per-request timeout.
const PUSH_TIMEOUT: Duration = Duration::from_secs(15);

/// Push notifier — delivers to a chat via the bot HTTP API.
pub struct PushNotifier {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl PushNotifier {
    pub fn new(bot_token: SecretString) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PUSH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { bot_token, client }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "https://api.telegram.org/bot{}/{method}",
            self.bot_token.expose_secret()
        )
    }
}

#[async_trait]
impl Notifier for PushNotifier {
    fn name(&self) -> &str {
        "push"
    }

    async fn send(&self, summary: &str, destination: &str) -> Result<(), NotifyError> {
        let text = clip(summary, PUSH_MAX_MESSAGE_LENGTH);

        let body = serde_json::json!({
            "chat_id": destination,
            "text": text,
        });

        let response = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                transport: "push".into(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed {
                transport: "push".into(),
                reason: format!("sendMessage failed ({status}): {detail}"),
            });
        }

        tracing::debug!(destination, "Push notification sent");
        Ok(())
    }
}

/// Clip text to `max` characters.
fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        text.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_leaves_short_text_alone() {
        assert_eq!(clip("hello", 10), "hello");
    }

    #[test]
    fn clip_truncates_long_text() {
        let long = "a".repeat(5000);
        assert_eq!(clip(&long, PUSH_MAX_MESSAGE_LENGTH).chars().count(), PUSH_MAX_MESSAGE_LENGTH);
    }

    #[test]
    fn clip_counts_chars_not_bytes() {
        let text = "é".repeat(10);
        assert_eq!(clip(&text, 5).chars().count(), 5);
    }
}
