//! Mail backend connectors.
//!
//! Two variants, selected per account at startup: [`imap::ImapConnector`]
//! (raw IMAP over TLS) and [`rest::RestConnector`] (Graph-style mailbox
//! REST API). The core only ever sees the [`MailConnector`] trait.

pub mod imap;
pub mod rest;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use imap::ImapConnector;
pub use rest::RestConnector;

use crate::config::{AccountConfig, ConnectorKind};
use crate::error::{BackendError, ConfigError};

/// A snapshot of one mailbox message, taken during a poll.
///
/// Never mutated locally — mutations go through the connector.
#[derive(Debug, Clone)]
pub struct MailMessage {
    /// Provider-assigned id, stable across polls. This is the ledger key.
    pub id: String,
    /// Backend-native handle used for mutations within the source folder.
    /// Equals `id` on REST backends.
    pub uid: String,
    /// Account this message belongs to.
    pub account: String,
    pub sender: String,
    pub subject: String,
    /// Body text. `None` until fetched via [`MailConnector::fetch_body`].
    pub body: Option<String>,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    /// Folder the message was listed from.
    pub folder: String,
}

#[async_trait]
pub trait MailConnector: Send + Sync {
    /// The account this connector serves.
    fn account(&self) -> &str;

    /// List messages in `folder` received at or after `since`.
    ///
    /// Each call re-queries the backend; results are a fresh snapshot.
    async fn list_candidates(
        &self,
        folder: &str,
        since: DateTime<Utc>,
        unread_only: bool,
    ) -> Result<Vec<MailMessage>, BackendError>;

    /// Fetch the full body text of a message.
    async fn fetch_body(&self, message: &MailMessage) -> Result<String, BackendError>;

    /// Move a message to `folder`.
    ///
    /// Idempotent: moving a message that is no longer in its source folder
    /// is a no-op success, so a retried dispatch never fails on a move that
    /// already happened.
    async fn move_to(&self, message: &MailMessage, folder: &str) -> Result<(), BackendError>;

    /// Mark a message read. Idempotent.
    async fn mark_read(&self, message: &MailMessage) -> Result<(), BackendError>;
}

/// Build the connector variant selected by the account's configuration.
pub fn create_connector(
    name: &str,
    config: &AccountConfig,
) -> Result<Arc<dyn MailConnector>, ConfigError> {
    match config.connector {
        ConnectorKind::Imap => {
            let params = config.imap.as_ref().ok_or_else(|| ConfigError::MissingRequired {
                key: format!("accounts.{name}.imap"),
                hint: "IMAP accounts need server, username and password_env".into(),
            })?;
            Ok(Arc::new(ImapConnector::new(name, params.clone())?))
        }
        ConnectorKind::Rest => {
            let params = config.rest.as_ref().ok_or_else(|| ConfigError::MissingRequired {
                key: format!("accounts.{name}.rest"),
                hint: "REST accounts need endpoint and token_env".into(),
            })?;
            Ok(Arc::new(RestConnector::new(name, params.clone())?))
        }
    }
}

/// Strip HTML tags from content (basic).
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    // Normalize whitespace
    result.split_whitespace().collect::<Vec<_>>().join(" ")
}
