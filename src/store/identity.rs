//! Per-identity usage rollups.
//!
//! Derived entirely from session records; `recompute` replaces the stored
//! row from scratch, so the table can never drift from the sessions it
//! summarizes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;

use crate::status::Counters;

use super::parse_ts;

/// Whether an identity holds at least one active session on a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Online => "online",
            ConnectionStatus::Offline => "offline",
        }
    }

    fn from_db(raw: &str) -> Self {
        if raw == "online" {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        }
    }
}

/// Aggregated usage for one identity on one server.
#[derive(Debug, Clone)]
pub struct IdentityStats {
    pub identity: String,
    pub server: String,
    pub total_sessions: u64,
    pub total_connected_secs: u64,
    pub total_bytes_received: u64,
    pub total_bytes_sent: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub current_status: ConnectionStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, sqlx::FromRow)]
struct IdentityRow {
    identity: String,
    server: String,
    total_sessions: i64,
    total_connected_secs: i64,
    total_bytes_received: i64,
    total_bytes_sent: i64,
    last_seen: Option<String>,
    current_status: String,
    updated_at: String,
}

impl IdentityRow {
    fn into_stats(self) -> Result<IdentityStats> {
        Ok(IdentityStats {
            identity: self.identity,
            server: self.server,
            total_sessions: self.total_sessions.max(0) as u64,
            total_connected_secs: self.total_connected_secs.max(0) as u64,
            total_bytes_received: self.total_bytes_received.max(0) as u64,
            total_bytes_sent: self.total_bytes_sent.max(0) as u64,
            last_seen: match self.last_seen {
                Some(raw) => Some(parse_ts(&raw)?),
                None => None,
            },
            current_status: ConnectionStatus::from_db(&self.current_status),
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

const COLUMNS: &str = "identity, server, total_sessions, total_connected_secs, \
                       total_bytes_received, total_bytes_sent, last_seen, \
                       current_status, updated_at";

fn collect(rows: Vec<IdentityRow>) -> Result<Vec<IdentityStats>> {
    rows.into_iter().map(IdentityRow::into_stats).collect()
}

/// Rebuilds one identity's rollup from its session records.
///
/// Closed stints contribute their stored duration; active stints contribute
/// elapsed time up to `now`. last_seen is the newest disconnect time, or the
/// connect time for stints still open.
pub async fn recompute(
    conn: &mut SqliteConnection,
    identity: &str,
    server: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    let (total_sessions, closed_secs, bytes_received, bytes_sent, last_seen, active_count): (
        i64,
        i64,
        i64,
        i64,
        Option<String>,
        i64,
    ) = sqlx::query_as(
        "SELECT COUNT(*),
                COALESCE(SUM(COALESCE(duration_secs, 0)), 0),
                COALESCE(SUM(bytes_received), 0),
                COALESCE(SUM(bytes_sent), 0),
                MAX(COALESCE(disconnected_at, connected_at)),
                COALESCE(SUM(CASE WHEN disconnected_at IS NULL THEN 1 ELSE 0 END), 0)
           FROM sessions
          WHERE identity = ? AND server = ?",
    )
    .bind(identity)
    .bind(server)
    .fetch_one(&mut *conn)
    .await
    .context("aggregating identity sessions")?;

    let active_connected: Vec<String> = sqlx::query_scalar(
        "SELECT connected_at FROM sessions
          WHERE identity = ? AND server = ? AND disconnected_at IS NULL",
    )
    .bind(identity)
    .bind(server)
    .fetch_all(&mut *conn)
    .await
    .context("loading active stint start times")?;

    let mut total_connected_secs = closed_secs.max(0);
    for raw in &active_connected {
        let connected_at = parse_ts(raw)?;
        total_connected_secs += (now - connected_at).num_seconds().max(0);
    }

    let status = if active_count > 0 {
        ConnectionStatus::Online
    } else {
        ConnectionStatus::Offline
    };

    sqlx::query(
        "INSERT INTO identity_stats
            (identity, server, total_sessions, total_connected_secs,
             total_bytes_received, total_bytes_sent, last_seen,
             current_status, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(identity, server) DO UPDATE SET
             total_sessions = excluded.total_sessions,
             total_connected_secs = excluded.total_connected_secs,
             total_bytes_received = excluded.total_bytes_received,
             total_bytes_sent = excluded.total_bytes_sent,
             last_seen = excluded.last_seen,
             current_status = excluded.current_status,
             updated_at = excluded.updated_at",
    )
    .bind(identity)
    .bind(server)
    .bind(total_sessions.max(0))
    .bind(total_connected_secs)
    .bind(bytes_received.max(0))
    .bind(bytes_sent.max(0))
    .bind(&last_seen)
    .bind(status.as_str())
    .bind(now.to_rfc3339())
    .execute(&mut *conn)
    .await
    .context("upserting identity stats")?;

    Ok(())
}

/// All rollups, optionally narrowed to one server.
pub async fn list(pool: &SqlitePool, server: Option<&str>) -> Result<Vec<IdentityStats>> {
    let rows: Vec<IdentityRow> = match server {
        Some(server) => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM identity_stats
                  WHERE server = ?
                  ORDER BY identity, server"
            ))
            .bind(server)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM identity_stats ORDER BY identity, server"
            ))
            .fetch_all(pool)
            .await
        }
    }
    .context("listing identity stats")?;

    collect(rows)
}

/// One identity's rollups across servers.
pub async fn list_for_identity(pool: &SqlitePool, identity: &str) -> Result<Vec<IdentityStats>> {
    let rows: Vec<IdentityRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM identity_stats
          WHERE identity = ?
          ORDER BY server"
    ))
    .bind(identity)
    .fetch_all(pool)
    .await
    .context("loading identity stats")?;

    collect(rows)
}

/// One identity page row with recent-activity counts.
#[derive(Debug, Clone)]
pub struct IdentityOverview {
    pub stats: IdentityStats,
    pub sessions_today: u64,
    pub sessions_this_week: u64,
}

#[derive(Debug, sqlx::FromRow)]
struct OverviewRow {
    identity: String,
    server: String,
    total_sessions: i64,
    total_connected_secs: i64,
    total_bytes_received: i64,
    total_bytes_sent: i64,
    last_seen: Option<String>,
    current_status: String,
    updated_at: String,
    sessions_today: i64,
    sessions_this_week: i64,
}

impl OverviewRow {
    fn into_overview(self) -> Result<IdentityOverview> {
        let stats = IdentityRow {
            identity: self.identity,
            server: self.server,
            total_sessions: self.total_sessions,
            total_connected_secs: self.total_connected_secs,
            total_bytes_received: self.total_bytes_received,
            total_bytes_sent: self.total_bytes_sent,
            last_seen: self.last_seen,
            current_status: self.current_status,
            updated_at: self.updated_at,
        }
        .into_stats()?;

        Ok(IdentityOverview {
            stats,
            sessions_today: self.sessions_today.max(0) as u64,
            sessions_this_week: self.sessions_this_week.max(0) as u64,
        })
    }
}

/// One page of rollups with per-row recent-activity counts.
///
/// Online identities sort first, then most recently seen. `search` narrows
/// by identity substring. Callers supply the day and week cutoffs so every
/// row in one page agrees on what "today" means.
pub async fn overview_page(
    pool: &SqlitePool,
    server: Option<&str>,
    search: Option<&str>,
    limit: u32,
    offset: u32,
    today_start: DateTime<Utc>,
    week_start: DateTime<Utc>,
) -> Result<Vec<IdentityOverview>> {
    let rows: Vec<OverviewRow> = sqlx::query_as(
        "SELECT i.identity, i.server, i.total_sessions, i.total_connected_secs,
                i.total_bytes_received, i.total_bytes_sent, i.last_seen,
                i.current_status, i.updated_at,
                (SELECT COUNT(*) FROM sessions s
                  WHERE s.identity = i.identity AND s.server = i.server
                    AND s.connected_at >= ?) AS sessions_today,
                (SELECT COUNT(*) FROM sessions s
                  WHERE s.identity = i.identity AND s.server = i.server
                    AND s.connected_at >= ?) AS sessions_this_week
           FROM identity_stats i
          WHERE (? IS NULL OR i.server = ?)
            AND (? IS NULL OR i.identity LIKE '%' || ? || '%')
          ORDER BY CASE WHEN i.current_status = 'online' THEN 0 ELSE 1 END,
                   COALESCE(i.last_seen, '') DESC,
                   i.identity
          LIMIT ? OFFSET ?",
    )
    .bind(today_start.to_rfc3339())
    .bind(week_start.to_rfc3339())
    .bind(server)
    .bind(server)
    .bind(search)
    .bind(search)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await
    .context("listing identity overview")?;

    rows.into_iter().map(OverviewRow::into_overview).collect()
}

/// Distinct identities ever recorded.
pub async fn count_known(pool: &SqlitePool, server: Option<&str>) -> Result<u64> {
    let count: i64 = match server {
        Some(server) => {
            sqlx::query_scalar(
                "SELECT COUNT(DISTINCT identity) FROM identity_stats WHERE server = ?",
            )
            .bind(server)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(DISTINCT identity) FROM identity_stats")
                .fetch_one(pool)
                .await
        }
    }
    .context("counting known identities")?;

    Ok(count.max(0) as u64)
}

/// Lifetime byte totals summed across rollups.
///
/// Rollups outlive the traffic ledger's retention horizon, so deployment
/// totals come from here rather than from aggregate samples.
pub async fn totals(pool: &SqlitePool, server: Option<&str>) -> Result<Counters> {
    let (received, sent): (i64, i64) = match server {
        Some(server) => {
            sqlx::query_as(
                "SELECT COALESCE(SUM(total_bytes_received), 0),
                        COALESCE(SUM(total_bytes_sent), 0)
                   FROM identity_stats
                  WHERE server = ?",
            )
            .bind(server)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_as(
                "SELECT COALESCE(SUM(total_bytes_received), 0),
                        COALESCE(SUM(total_bytes_sent), 0)
                   FROM identity_stats",
            )
            .fetch_one(pool)
            .await
        }
    }
    .context("summing identity totals")?;

    Ok(Counters {
        bytes_in: received.max(0) as u64,
        bytes_out: sent.max(0) as u64,
    })
}
