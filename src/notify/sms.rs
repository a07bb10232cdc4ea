//! SMS notifier — Twilio-style messaging REST API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::error::NotifyError;
use crate::notify::Notifier;

/// Hard SMS length limit; longer summaries are truncated with an ellipsis.
const SMS_MAX_LENGTH: usize = 160;

/// Per-request timeout.
const SMS_TIMEOUT: Duration = Duration::from_secs(15);

const SMS_API_HOST: &str = "https://api.twilio.com";

/// SMS notifier — delivers to a phone number via a messaging REST API.
pub struct SmsNotifier {
    account_sid: String,
    auth_token: SecretString,
    from_number: String,
    client: reqwest::Client,
}

impl SmsNotifier {
    pub fn new(account_sid: String, auth_token: SecretString, from_number: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(SMS_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            account_sid,
            auth_token,
            from_number,
            client,
        }
    }
}

#[async_trait]
impl Notifier for SmsNotifier {
    fn name(&self) -> &str {
        "sms"
    }

    async fn send(&self, summary: &str, destination: &str) -> Result<(), NotifyError> {
        let text = truncate_sms(summary);
        let url = format!(
            "{SMS_API_HOST}/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&[
                ("Body", text.as_str()),
                ("From", self.from_number.as_str()),
                ("To", destination),
            ])
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                transport: "sms".into(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed {
                transport: "sms".into(),
                reason: format!("message create failed ({status}): {detail}"),
            });
        }

        tracing::debug!(destination, "SMS notification sent");
        Ok(())
    }
}

/// Fit text into one SMS segment.
fn truncate_sms(text: &str) -> String {
    if text.chars().count() <= SMS_MAX_LENGTH {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(SMS_MAX_LENGTH - 3).collect();
    clipped.push_str("...");
    clipped
}
