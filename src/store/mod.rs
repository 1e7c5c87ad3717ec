//! Durable session, traffic, and rollup storage over SQLite.
//!
//! One pool per process. All reconcile-cycle writes compose inside a single
//! transaction held by the collector; the query layer reads through the
//! pool directly.

pub mod identity;
pub mod migrate;
pub mod session;
pub mod traffic;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};

use self::migrate::{Migrator, SqliteMigrator};

/// Parses a timestamp stored by this module (RFC 3339 text).
pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("malformed stored timestamp: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

/// Rows removed by one retention sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneOutcome {
    pub sessions_removed: u64,
    pub samples_removed: u64,
}

/// Handle to the backing database.
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if missing) the database and applies pending
    /// migrations.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database at {}", path.display()))?;

        SqliteMigrator::new(pool.clone())
            .up()
            .await
            .context("applying schema migrations")?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begins a write transaction for one reconcile cycle.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool.begin().await.context("opening transaction")
    }

    /// Removes expired rows.
    ///
    /// Closed sessions go once their disconnect time falls behind the
    /// session horizon. Traffic samples go behind the traffic horizon,
    /// except each still-active session's newest raw sample, which the next
    /// delta computation needs as its baseline.
    pub async fn prune_expired(
        &self,
        now: DateTime<Utc>,
        sessions_horizon: Duration,
        traffic_horizon: Duration,
    ) -> Result<PruneOutcome> {
        let sessions_cutoff = now
            - chrono::Duration::from_std(sessions_horizon).context("session horizon overflow")?;
        let traffic_cutoff =
            now - chrono::Duration::from_std(traffic_horizon).context("traffic horizon overflow")?;

        let mut tx = self.begin().await?;

        let sessions = sqlx::query(
            "DELETE FROM sessions
              WHERE disconnected_at IS NOT NULL AND disconnected_at < ?",
        )
        .bind(sessions_cutoff.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("pruning sessions")?;

        let samples = sqlx::query(
            "DELETE FROM traffic_samples
              WHERE captured_at < ?
                AND id NOT IN (
                    SELECT MAX(t.id)
                      FROM traffic_samples t
                      JOIN sessions s
                        ON s.disconnected_at IS NULL
                       AND s.server = t.server
                       AND s.identity = t.identity
                       AND s.origin_addr = t.origin_addr
                       AND s.origin_port = t.origin_port
                     WHERE t.identity IS NOT NULL
                     GROUP BY t.server, t.identity, t.origin_addr, t.origin_port
                )",
        )
        .bind(traffic_cutoff.to_rfc3339())
        .execute(&mut *tx)
        .await
        .context("pruning traffic samples")?;

        tx.commit().await.context("committing retention sweep")?;

        Ok(PruneOutcome {
            sessions_removed: sessions.rows_affected(),
            samples_removed: samples.rows_affected(),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
