//! REST connector — Graph-style mailbox API over HTTPS.
//!
//! Talks to an OData mailbox endpoint (`/mailFolders/{name}/messages`,
//! `/messages/{id}/move`, ...) with bearer-token auth. Listing returns the
//! preview only; the full body is a separate fetch.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::config::{self, RestParams};
use crate::connector::{MailConnector, MailMessage, strip_html};
use crate::error::{BackendError, ConfigError};

/// Per-request timeout for the mailbox API.
const REST_TIMEOUT: Duration = Duration::from_secs(30);

/// Page size for message listings.
const LIST_PAGE_SIZE: u32 = 100;

/// REST mailbox connector for one account.
pub struct RestConnector {
    account: String,
    endpoint: String,
    token: SecretString,
    client: reqwest::Client,
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ListResponse {
    value: Vec<RestMessage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RestMessage {
    id: String,
    received_date_time: String,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    from: Option<Recipient>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: EmailAddress,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EmailAddress {
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BodyResponse {
    body: MessageBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageBody {
    #[serde(default)]
    content_type: String,
    #[serde(default)]
    content: String,
}

impl RestConnector {
    pub fn new(account: &str, params: RestParams) -> Result<Self, ConfigError> {
        let token = config::secret_from_env(&params.token_env)?;
        let client = reqwest::Client::builder()
            .timeout(REST_TIMEOUT)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: format!("accounts.{account}.rest"),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            account: account.to_string(),
            endpoint: params.endpoint.trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token.expose_secret())
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        context: &str,
    ) -> Result<T, BackendError> {
        let response = self
            .client
            .get(url)
            .header("Authorization", self.bearer())
            .send()
            .await
            .map_err(|e| BackendError::transient(&self.account, format!("{context}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.account, status, &body, context));
        }

        response
            .json()
            .await
            .map_err(|e| BackendError::transient(&self.account, format!("{context}: bad JSON: {e}")))
    }
}

#[async_trait]
impl MailConnector for RestConnector {
    fn account(&self) -> &str {
        &self.account
    }

    async fn list_candidates(
        &self,
        folder: &str,
        since: DateTime<Utc>,
        unread_only: bool,
    ) -> Result<Vec<MailMessage>, BackendError> {
        let filter = list_filter(since, unread_only);
        let url = self.url(&format!(
            "/mailFolders/{folder}/messages?$filter={filter}&$top={LIST_PAGE_SIZE}&$orderby=receivedDateTime desc"
        ));

        let listing: ListResponse = self.get_json(&url, "list messages").await?;

        let messages = listing
            .value
            .into_iter()
            .map(|m| {
                let received_at = DateTime::parse_from_rfc3339(&m.received_date_time)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now());
                MailMessage {
                    uid: m.id.clone(),
                    id: m.id,
                    account: self.account.clone(),
                    sender: m
                        .from
                        .and_then(|r| r.email_address.address)
                        .unwrap_or_else(|| "unknown".into()),
                    subject: m.subject.unwrap_or_else(|| "(no subject)".into()),
                    // Full body is a separate fetch
                    body: None,
                    received_at,
                    is_read: m.is_read,
                    folder: folder.to_string(),
                }
            })
            .collect::<Vec<_>>();

        debug!(
            account = %self.account,
            folder,
            count = messages.len(),
            "REST listing complete"
        );
        Ok(messages)
    }

    async fn fetch_body(&self, message: &MailMessage) -> Result<String, BackendError> {
        let url = self.url(&format!("/messages/{}?$select=body", message.uid));
        let response: BodyResponse = self.get_json(&url, "fetch body").await?;

        if response.body.content_type.eq_ignore_ascii_case("html") {
            Ok(strip_html(&response.body.content))
        } else {
            Ok(response.body.content)
        }
    }

    /// A 404 here means the message id no longer resolves in its source
    /// folder — a prior attempt already moved it, so this is the contract's
    /// idempotent no-op success.
    async fn move_to(&self, message: &MailMessage, folder: &str) -> Result<(), BackendError> {
        let url = self.url(&format!("/messages/{}/move", message.uid));
        let response = self
            .client
            .post(&url)
            .header("Authorization", self.bearer())
            .json(&serde_json::json!({ "destinationId": folder }))
            .send()
            .await
            .map_err(|e| BackendError::transient(&self.account, format!("move: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!(account = %self.account, id = %message.id, "Message already moved");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.account, status, &body, "move"));
        }
        Ok(())
    }

    async fn mark_read(&self, message: &MailMessage) -> Result<(), BackendError> {
        let url = self.url(&format!("/messages/{}", message.uid));
        let response = self
            .client
            .patch(&url)
            .header("Authorization", self.bearer())
            .json(&serde_json::json!({ "isRead": true }))
            .send()
            .await
            .map_err(|e| BackendError::transient(&self.account, format!("mark read: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            // Message moved out from under us; the flag no longer matters.
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(&self.account, status, &body, "mark read"));
        }
        Ok(())
    }
}

/// OData filter for the candidate window.
fn list_filter(since: DateTime<Utc>, unread_only: bool) -> String {
    let ts = since.format("%Y-%m-%dT%H:%M:%SZ");
    if unread_only {
        format!("receivedDateTime ge {ts} and isRead eq false")
    } else {
        format!("receivedDateTime ge {ts}")
    }
}

/// Map an HTTP failure status to the backend error taxonomy.
fn status_error(account: &str, status: StatusCode, body: &str, context: &str) -> BackendError {
    let reason = format!("{context}: status {status}: {}", body.trim());
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        BackendError::permanent(account, format!("{context}: auth rejected ({status})"))
    } else if status == StatusCode::NOT_FOUND {
        BackendError::permanent(account, reason)
    } else if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        BackendError::transient(account, reason)
    } else {
        BackendError::permanent(account, reason)
    }
}
