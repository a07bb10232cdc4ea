//! Configuration types — loaded once at startup, immutable for the process
//! lifetime.
//!
//! The config file is JSON. Secrets are never stored in the file: credential
//! fields name the environment variable that holds the actual value
//! (`password_env`, `token_env`), and the variable is read exactly once at
//! startup into a [`secrecy::SecretString`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ConfigError;

/// Which mail backend protocol an account speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    Imap,
    Rest,
}

/// Connection parameters for an IMAP account.
#[derive(Debug, Clone, Deserialize)]
pub struct ImapParams {
    pub server: String,
    #[serde(default = "default_imap_port")]
    pub port: u16,
    pub username: String,
    /// Name of the environment variable holding the account password.
    pub password_env: String,
}

/// Connection parameters for a REST mailbox account.
#[derive(Debug, Clone, Deserialize)]
pub struct RestParams {
    /// API base for the mailbox, e.g. `https://graph.example.com/v1.0/me`.
    pub endpoint: String,
    /// Name of the environment variable holding the API token.
    pub token_env: String,
}

/// Per-account polling behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct PollingSettings {
    #[serde(default = "default_true")]
    pub process_only_unread: bool,
    #[serde(default = "default_lookback_hours")]
    pub max_lookback_hours: u32,
    #[serde(default = "default_folders")]
    pub watched_folders: Vec<String>,
    #[serde(default = "default_junk_folder")]
    pub junk_folder: String,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            process_only_unread: true,
            max_lookback_hours: default_lookback_hours(),
            watched_folders: default_folders(),
            junk_folder: default_junk_folder(),
        }
    }
}

/// One monitored mailbox.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub connector: ConnectorKind,
    #[serde(default)]
    pub imap: Option<ImapParams>,
    #[serde(default)]
    pub rest: Option<RestParams>,
    #[serde(default)]
    pub settings: PollingSettings,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl AccountConfig {
    /// Check that the parameters required by the selected connector kind are
    /// present.
    pub fn validate(&self, name: &str) -> Result<(), ConfigError> {
        match self.connector {
            ConnectorKind::Imap if self.imap.is_none() => Err(ConfigError::MissingRequired {
                key: format!("accounts.{name}.imap"),
                hint: "IMAP accounts need server, username and password_env".into(),
            }),
            ConnectorKind::Rest if self.rest.is_none() => Err(ConfigError::MissingRequired {
                key: format!("accounts.{name}.rest"),
                hint: "REST accounts need endpoint and token_env".into(),
            }),
            _ if self.settings.watched_folders.is_empty() => Err(ConfigError::InvalidValue {
                key: format!("accounts.{name}.settings.watched_folders"),
                message: "at least one folder must be watched".into(),
            }),
            _ if self.settings.junk_folder.trim().is_empty() => Err(ConfigError::InvalidValue {
                key: format!("accounts.{name}.settings.junk_folder"),
                message: "junk folder name must not be empty".into(),
            }),
            _ => Ok(()),
        }
    }
}

/// Supported classification oracle backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

/// Classification oracle settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    #[serde(default = "default_backend")]
    pub backend: LlmBackend,
    #[serde(default = "default_model")]
    pub model: String,
    /// Free-form natural-language classification criteria, authored by the
    /// operator and passed verbatim to the oracle.
    pub rule_text: String,
    /// Within-poll retry bound for oracle failures.
    #[serde(default = "default_classify_retries")]
    pub retries: u32,
    /// Per-call oracle timeout.
    #[serde(default = "default_classify_timeout")]
    pub timeout_secs: u64,
}

/// Which notification transport to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    Push,
    Sms,
}

/// Notification transport settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NotifierConfig {
    pub kind: NotifierKind,
    /// Destination identifier — chat id for push, E.164 number for SMS.
    pub destination: String,
    /// Push: environment variable holding the bot token.
    #[serde(default)]
    pub token_env: Option<String>,
    /// SMS: messaging account SID.
    #[serde(default)]
    pub account_sid: Option<String>,
    /// SMS: environment variable holding the auth token.
    #[serde(default)]
    pub auth_token_env: Option<String>,
    /// SMS: sender phone number.
    #[serde(default)]
    pub from_number: Option<String>,
}

/// Failure-handling knobs. Conservative fixed defaults, overridable per
/// deployment rather than hidden in code.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    /// First backoff delay after an account poll fails.
    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
    /// Backoff ceiling.
    #[serde(default = "default_backoff_cap")]
    pub backoff_cap_secs: u64,
    /// Messages classified/dispatched concurrently within one poll.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Consecutive poll failures before the operator is alerted.
    #[serde(default = "default_alert_after")]
    pub alert_after_failures: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            backoff_base_secs: default_backoff_base(),
            backoff_cap_secs: default_backoff_cap(),
            max_in_flight: default_max_in_flight(),
            alert_after_failures: default_alert_after(),
        }
    }
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    pub accounts: BTreeMap<String, AccountConfig>,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    pub classifier: ClassifierConfig,
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub retry: RetrySettings,
}

impl MonitorConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.accounts.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "accounts".into(),
                hint: "configure at least one mailbox account".into(),
            });
        }
        for (name, account) in &self.accounts {
            account.validate(name)?;
        }
        if self.classifier.rule_text.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "classifier.rule_text".into(),
                hint: "describe what counts as important, normal and junk".into(),
            });
        }
        Ok(())
    }

    /// Accounts the scheduler should poll.
    pub fn enabled_accounts(&self) -> impl Iterator<Item = (&String, &AccountConfig)> {
        self.accounts.iter().filter(|(_, a)| a.enabled)
    }
}

/// Read a secret from the environment variable named by `var`.
pub fn secret_from_env(var: &str) -> Result<SecretString, ConfigError> {
    std::env::var(var)
        .map(SecretString::from)
        .map_err(|_| ConfigError::MissingEnvVar(var.to_string()))
}

fn default_true() -> bool {
    true
}

fn default_imap_port() -> u16 {
    993
}

fn default_lookback_hours() -> u32 {
    24
}

fn default_folders() -> Vec<String> {
    vec!["INBOX".to_string()]
}

fn default_junk_folder() -> String {
    "Junk".to_string()
}

fn default_backend() -> LlmBackend {
    LlmBackend::Anthropic
}

fn default_model() -> String {
    "claude-sonnet-4-20250514".to_string()
}

fn default_classify_retries() -> u32 {
    3
}

fn default_classify_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    60
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/sentinel.db")
}

fn default_backoff_base() -> u64 {
    30
}

fn default_backoff_cap() -> u64 {
    1800
}

fn default_max_in_flight() -> usize {
    4
}

fn default_alert_after() -> u32 {
    5
}
