//! Notification transports.
//!
//! A notifier delivers a terse summary to one destination and reports
//! success or failure. No retry logic lives here — the dispatcher owns
//! retry via the ledger status.

pub mod push;
pub mod sms;

use std::sync::Arc;

use async_trait::async_trait;

pub use push::PushNotifier;
pub use sms::SmsNotifier;

use crate::config::{self, NotifierConfig, NotifierKind};
use crate::error::{ConfigError, Error, NotifyError};

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Transport name, for logging.
    fn name(&self) -> &str;

    /// Deliver `summary` to `destination`.
    async fn send(&self, summary: &str, destination: &str) -> Result<(), NotifyError>;
}

/// Build the notifier variant selected by configuration.
pub fn create_notifier(config: &NotifierConfig) -> Result<Arc<dyn Notifier>, Error> {
    match config.kind {
        NotifierKind::Push => {
            let token_env = config.token_env.as_deref().ok_or_else(|| {
                ConfigError::MissingRequired {
                    key: "notifier.token_env".into(),
                    hint: "push notifications need a bot token environment variable".into(),
                }
            })?;
            let token = config::secret_from_env(token_env)?;
            Ok(Arc::new(PushNotifier::new(token)))
        }
        NotifierKind::Sms => {
            let account_sid = config.account_sid.clone().ok_or_else(|| {
                ConfigError::MissingRequired {
                    key: "notifier.account_sid".into(),
                    hint: "SMS notifications need the messaging account SID".into(),
                }
            })?;
            let auth_token_env = config.auth_token_env.as_deref().ok_or_else(|| {
                ConfigError::MissingRequired {
                    key: "notifier.auth_token_env".into(),
                    hint: "SMS notifications need an auth token environment variable".into(),
                }
            })?;
            let from_number = config.from_number.clone().ok_or_else(|| {
                ConfigError::MissingRequired {
                    key: "notifier.from_number".into(),
                    hint: "SMS notifications need a sender phone number".into(),
                }
            })?;
            let auth_token = config::secret_from_env(auth_token_env)?;
            Ok(Arc::new(SmsNotifier::new(account_sid, auth_token, from_number)))
        }
    }
}
