//! Version-tracked schema migrations for the libSQL ledger.
//!
//! Each migration has a version number and SQL. `run()` checks the current
//! version and applies only the new ones sequentially.

use libsql::{Connection, params};
use tracing::info;

use crate::error::LedgerError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    name: "initial_schema",
    sql: r#"
        CREATE TABLE IF NOT EXISTS ledger (
            account TEXT NOT NULL,
            message_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            status TEXT NOT NULL,
            processed_at TEXT NOT NULL,
            PRIMARY KEY (account, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_account ON ledger(account);
        CREATE INDEX IF NOT EXISTS idx_ledger_status ON ledger(status);

        CREATE TABLE IF NOT EXISTS poll_state (
            account TEXT PRIMARY KEY,
            last_success TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
    "#,
}];

/// Apply any migrations newer than the schema's current version.
pub async fn run(conn: &Connection) -> Result<(), LedgerError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| LedgerError::Migration(format!("create _migrations: {e}")))?;

    let current = current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql)
            .await
            .map_err(|e| {
                LedgerError::Migration(format!("v{} ({}): {e}", migration.version, migration.name))
            })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            params![migration.version, migration.name],
        )
        .await
        .map_err(|e| LedgerError::Migration(format!("record v{}: {e}", migration.version)))?;
        info!(
            version = migration.version,
            name = migration.name,
            "Applied ledger migration"
        );
    }

    Ok(())
}

async fn current_version(conn: &Connection) -> Result<i64, LedgerError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| LedgerError::Migration(format!("read version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        Ok(None) => Ok(0),
        Err(e) => Err(LedgerError::Migration(format!("read version: {e}"))),
    }
}
