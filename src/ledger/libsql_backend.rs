//! libSQL ledger backend.
//!
//! Supports local file and in-memory databases. `libsql::Connection` is
//! `Send + Sync` and safe for concurrent async use, which is all the
//! cross-worker safety the ledger needs — workers write disjoint account
//! keyspaces.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;

use crate::classify::Priority;
use crate::error::LedgerError;
use crate::ledger::{DispatchStatus, Ledger, LedgerEntry, migrations};

/// libSQL ledger.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LedgerError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| LedgerError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run(&conn).await?;
        info!(path = %path.display(), "Ledger opened");
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    /// Create an in-memory ledger (for tests).
    pub async fn new_memory() -> Result<Self, LedgerError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| LedgerError::Connection(format!("Failed to create database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| LedgerError::Connection(format!("Failed to create connection: {e}")))?;

        migrations::run(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Row mapping helpers ─────────────────────────────────────────────

/// Parse an RFC 3339 datetime string from the database.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn outcome_to_str(outcome: Priority) -> &'static str {
    outcome.as_str()
}

fn str_to_outcome(s: &str) -> Priority {
    match s {
        "important" => Priority::Important,
        "junk" => Priority::Junk,
        _ => Priority::Normal,
    }
}

fn str_to_status(s: &str) -> DispatchStatus {
    match s {
        "succeeded" => DispatchStatus::Succeeded,
        _ => DispatchStatus::Failed,
    }
}

fn row_to_entry(row: &libsql::Row) -> Result<LedgerEntry, libsql::Error> {
    let outcome_str: String = row.get(2)?;
    let status_str: String = row.get(3)?;
    let processed_str: String = row.get(4)?;

    Ok(LedgerEntry {
        account: row.get(0)?,
        message_id: row.get(1)?,
        outcome: str_to_outcome(&outcome_str),
        status: str_to_status(&status_str),
        processed_at: parse_datetime(&processed_str),
    })
}

const LEDGER_COLUMNS: &str = "account, message_id, outcome, status, processed_at";

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Ledger for LibSqlLedger {
    async fn get(
        &self,
        account: &str,
        message_id: &str,
    ) -> Result<Option<LedgerEntry>, LedgerError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {LEDGER_COLUMNS} FROM ledger WHERE account = ?1 AND message_id = ?2"
                ),
                params![account, message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("get: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let entry = row_to_entry(&row)
                    .map_err(|e| LedgerError::Query(format!("get row parse: {e}")))?;
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LedgerError::Query(format!("get: {e}"))),
        }
    }

    async fn has_succeeded(&self, account: &str, message_id: &str) -> Result<bool, LedgerError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM ledger
                 WHERE account = ?1 AND message_id = ?2 AND status = 'succeeded'",
                params![account, message_id],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("has_succeeded: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) > 0),
            _ => Ok(false),
        }
    }

    async fn record_outcome(
        &self,
        account: &str,
        message_id: &str,
        outcome: Priority,
        status: DispatchStatus,
    ) -> Result<(), LedgerError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO ledger (account, message_id, outcome, status, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (account, message_id) DO UPDATE SET
                 outcome = excluded.outcome,
                 status = excluded.status,
                 processed_at = excluded.processed_at",
            params![
                account,
                message_id,
                outcome_to_str(outcome),
                status.as_str(),
                now,
            ],
        )
        .await
        .map_err(|e| LedgerError::Query(format!("record_outcome: {e}")))?;

        tracing::debug!(
            account,
            message_id,
            outcome = outcome.as_str(),
            status = status.as_str(),
            "Ledger outcome recorded"
        );
        Ok(())
    }

    async fn last_poll_success(
        &self,
        account: &str,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT last_success FROM poll_state WHERE account = ?1",
                params![account],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("last_poll_success: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let s: String = row
                    .get(0)
                    .map_err(|e| LedgerError::Query(format!("last_poll_success: {e}")))?;
                Ok(Some(parse_datetime(&s)))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LedgerError::Query(format!("last_poll_success: {e}"))),
        }
    }

    async fn record_poll_success(
        &self,
        account: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let conn = self.conn();
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO poll_state (account, last_success, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (account) DO UPDATE SET
                 last_success = excluded.last_success,
                 updated_at = excluded.updated_at",
            params![account, at.to_rfc3339(), now],
        )
        .await
        .map_err(|e| LedgerError::Query(format!("record_poll_success: {e}")))?;
        Ok(())
    }

    async fn processed_count(&self) -> Result<u64, LedgerError> {
        let conn = self.conn();
        let mut rows = conn
            .query("SELECT COUNT(*) FROM ledger", ())
            .await
            .map_err(|e| LedgerError::Query(format!("processed_count: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0) as u64),
            _ => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[tokio::test]
    async fn record_and_get_roundtrip() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        ledger
            .record_outcome("personal", "msg-1", Priority::Junk, DispatchStatus::Succeeded)
            .await
            .unwrap();

        let entry = ledger.get("personal", "msg-1").await.unwrap().unwrap();
        assert_eq!(entry.account, "personal");
        assert_eq!(entry.message_id, "msg-1");
        assert_eq!(entry.outcome, Priority::Junk);
        assert_eq!(entry.status, DispatchStatus::Succeeded);
        assert!(entry.processed_at > DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn get_absent_key_is_none() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        assert!(ledger.get("personal", "nope").await.unwrap().is_none());
        assert!(!ledger.has_succeeded("personal", "nope").await.unwrap());
    }

    #[tokio::test]
    async fn record_outcome_is_last_write_wins() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        ledger
            .record_outcome("a", "m", Priority::Important, DispatchStatus::Failed)
            .await
            .unwrap();
        ledger
            .record_outcome("a", "m", Priority::Important, DispatchStatus::Succeeded)
            .await
            .unwrap();

        let entry = ledger.get("a", "m").await.unwrap().unwrap();
        assert_eq!(entry.status, DispatchStatus::Succeeded);
        assert_eq!(ledger.processed_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_entry_is_not_succeeded() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        ledger
            .record_outcome("a", "m", Priority::Important, DispatchStatus::Failed)
            .await
            .unwrap();
        assert!(!ledger.has_succeeded("a", "m").await.unwrap());
        assert!(ledger.get("a", "m").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn same_message_id_in_different_accounts_is_distinct() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        ledger
            .record_outcome("a", "m", Priority::Junk, DispatchStatus::Succeeded)
            .await
            .unwrap();
        assert!(ledger.has_succeeded("a", "m").await.unwrap());
        assert!(!ledger.has_succeeded("b", "m").await.unwrap());
    }

    #[tokio::test]
    async fn poll_state_roundtrip() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        assert!(ledger.last_poll_success("personal").await.unwrap().is_none());

        let first = Utc.with_ymd_and_hms(2026, 8, 7, 10, 0, 0).unwrap();
        ledger.record_poll_success("personal", first).await.unwrap();
        assert_eq!(
            ledger.last_poll_success("personal").await.unwrap(),
            Some(first)
        );

        let second = Utc.with_ymd_and_hms(2026, 8, 7, 10, 5, 0).unwrap();
        ledger.record_poll_success("personal", second).await.unwrap();
        assert_eq!(
            ledger.last_poll_success("personal").await.unwrap(),
            Some(second)
        );
    }

    #[tokio::test]
    async fn concurrent_writers_from_different_accounts() {
        let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());

        let mut handles = Vec::new();
        for account in ["a", "b", "c", "d"] {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                for i in 0..20 {
                    ledger
                        .record_outcome(
                            account,
                            &format!("msg-{i}"),
                            Priority::Normal,
                            DispatchStatus::Succeeded,
                        )
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(ledger.processed_count().await.unwrap(), 80);
        assert!(ledger.has_succeeded("c", "msg-19").await.unwrap());
    }
}
