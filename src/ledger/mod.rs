//! Idempotency ledger — durable record of per-message processing outcomes.
//!
//! One entry per (account, message) key. An entry exists iff a dispatch
//! attempt has completed; `Succeeded` is terminal forever, `Failed` leaves
//! the message eligible for retry on a later poll. The ledger is the only
//! state shared between account workers.

pub mod libsql_backend;
pub mod migrations;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use libsql_backend::LibSqlLedger;

use crate::classify::Priority;
use crate::error::LedgerError;

/// Whether the dispatch attempt for a message completed successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    Succeeded,
    Failed,
}

impl DispatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// A recorded processing outcome for one (account, message) pair.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub account: String,
    pub message_id: String,
    pub outcome: Priority,
    pub status: DispatchStatus,
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Look up the entry for a key.
    async fn get(
        &self,
        account: &str,
        message_id: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError>;

    /// True when a prior dispatch for this key completed successfully.
    async fn has_succeeded(&self, account: &str, message_id: &str) -> Result<bool, LedgerError>;

    /// Record the outcome of a dispatch attempt. Upserts; last write wins.
    /// Once this returns Ok the entry survives process restart.
    async fn record_outcome(
        &self,
        account: &str,
        message_id: &str,
        outcome: Priority,
        status: DispatchStatus,
    ) -> Result<(), LedgerError>;

    /// Timestamp of the account's last fully-successful poll, if any.
    async fn last_poll_success(
        &self,
        account: &str,
    ) -> Result<Option<DateTime<Utc>>, LedgerError>;

    /// Record that a poll for `account` completed successfully at `at`.
    async fn record_poll_success(
        &self,
        account: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Total number of recorded outcomes, across all accounts.
    async fn processed_count(&self) -> Result<u64, LedgerError>;
}
