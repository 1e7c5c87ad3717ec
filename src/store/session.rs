//! Session lifecycle records.
//!
//! One row per session stint. At most one row per key is active (no
//! disconnect timestamp), enforced by a partial unique index; a reconnect
//! after a close opens a fresh row under the same key.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;

use crate::status::{Counters, SessionKey, SessionObservation};

use super::parse_ts;

/// A persisted session stint.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: i64,
    pub identity: String,
    pub server: String,
    pub origin_addr: String,
    pub origin_port: String,
    pub virtual_addr: Option<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub connected_at: DateTime<Utc>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn key(&self) -> SessionKey {
        SessionKey {
            identity: self.identity.clone(),
            server: self.server.clone(),
            origin_addr: self.origin_addr.clone(),
            origin_port: self.origin_port.clone(),
        }
    }

    /// Last-known cumulative counters, in ledger orientation.
    pub fn counters(&self) -> Counters {
        Counters {
            bytes_in: self.bytes_received,
            bytes_out: self.bytes_sent,
        }
    }

    pub fn is_active(&self) -> bool {
        self.disconnected_at.is_none()
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SessionRow {
    id: i64,
    identity: String,
    server: String,
    origin_addr: String,
    origin_port: String,
    virtual_addr: Option<String>,
    bytes_received: i64,
    bytes_sent: i64,
    connected_at: String,
    disconnected_at: Option<String>,
    duration_secs: Option<i64>,
    created_at: String,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        Ok(SessionRecord {
            id: self.id,
            identity: self.identity,
            server: self.server,
            origin_addr: self.origin_addr,
            origin_port: self.origin_port,
            virtual_addr: self.virtual_addr,
            bytes_received: self.bytes_received.max(0) as u64,
            bytes_sent: self.bytes_sent.max(0) as u64,
            connected_at: parse_ts(&self.connected_at)?,
            disconnected_at: match self.disconnected_at {
                Some(raw) => Some(parse_ts(&raw)?),
                None => None,
            },
            duration_secs: self.duration_secs,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

const COLUMNS: &str = "id, identity, server, origin_addr, origin_port, virtual_addr, \
                       bytes_received, bytes_sent, connected_at, disconnected_at, \
                       duration_secs, created_at";

fn collect(rows: Vec<SessionRow>) -> Result<Vec<SessionRecord>> {
    rows.into_iter().map(SessionRow::into_record).collect()
}

/// All active sessions on one server, for the reconcile diff.
pub async fn active_for_server(
    conn: &mut SqliteConnection,
    server: &str,
) -> Result<Vec<SessionRecord>> {
    let rows: Vec<SessionRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM sessions
          WHERE server = ? AND disconnected_at IS NULL
          ORDER BY id"
    ))
    .bind(server)
    .fetch_all(&mut *conn)
    .await
    .context("loading active sessions")?;

    collect(rows)
}

/// Applies one observation to the active set.
///
/// Updates the active row for the observation's key in place, or inserts a
/// fresh row when none is active. Returns true when a row was inserted. The
/// connect timestamp is never rewritten on update; a quick reconnect under
/// the same key shows up as a counter reset, not as a new record.
pub async fn upsert_active(
    conn: &mut SqliteConnection,
    obs: &SessionObservation,
    now: DateTime<Utc>,
) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE sessions
            SET bytes_received = ?, bytes_sent = ?,
                virtual_addr = COALESCE(?, virtual_addr)
          WHERE identity = ? AND server = ? AND origin_addr = ? AND origin_port = ?
            AND disconnected_at IS NULL",
    )
    .bind(obs.bytes_received as i64)
    .bind(obs.bytes_sent as i64)
    .bind(&obs.virtual_addr)
    .bind(&obs.identity)
    .bind(&obs.server)
    .bind(&obs.origin_addr)
    .bind(&obs.origin_port)
    .execute(&mut *conn)
    .await
    .context("updating active session")?;

    if updated.rows_affected() > 0 {
        return Ok(false);
    }

    sqlx::query(
        "INSERT INTO sessions
            (identity, server, origin_addr, origin_port, virtual_addr,
             bytes_received, bytes_sent, connected_at, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&obs.identity)
    .bind(&obs.server)
    .bind(&obs.origin_addr)
    .bind(&obs.origin_port)
    .bind(&obs.virtual_addr)
    .bind(obs.bytes_received as i64)
    .bind(obs.bytes_sent as i64)
    .bind(obs.connected_at.to_rfc3339())
    .bind(now.to_rfc3339())
    .execute(&mut *conn)
    .await
    .context("inserting session")?;

    Ok(true)
}

/// Closes one active session, stamping disconnect time and duration.
pub async fn close(
    conn: &mut SqliteConnection,
    record: &SessionRecord,
    now: DateTime<Utc>,
) -> Result<()> {
    let duration_secs = (now - record.connected_at).num_seconds().max(0);

    sqlx::query(
        "UPDATE sessions SET disconnected_at = ?, duration_secs = ?
          WHERE id = ? AND disconnected_at IS NULL",
    )
    .bind(now.to_rfc3339())
    .bind(duration_secs)
    .bind(record.id)
    .execute(&mut *conn)
    .await
    .context("closing session")?;

    Ok(())
}

/// Currently active sessions, optionally narrowed to one server.
pub async fn active_sessions(
    pool: &SqlitePool,
    server: Option<&str>,
) -> Result<Vec<SessionRecord>> {
    let rows: Vec<SessionRow> = match server {
        Some(server) => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM sessions
                  WHERE disconnected_at IS NULL AND server = ?
                  ORDER BY server, identity, id"
            ))
            .bind(server)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM sessions
                  WHERE disconnected_at IS NULL
                  ORDER BY server, identity, id"
            ))
            .fetch_all(pool)
            .await
        }
    }
    .context("listing active sessions")?;

    collect(rows)
}

/// Session history page, newest connection first.
pub async fn recent_sessions(
    pool: &SqlitePool,
    limit: u32,
    offset: u32,
) -> Result<Vec<SessionRecord>> {
    let rows: Vec<SessionRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM sessions
          ORDER BY connected_at DESC, id DESC
          LIMIT ? OFFSET ?"
    ))
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await
    .context("listing recent sessions")?;

    collect(rows)
}

/// Session history page for one identity, newest connection first.
pub async fn sessions_for_identity(
    pool: &SqlitePool,
    identity: &str,
    limit: u32,
    offset: u32,
) -> Result<Vec<SessionRecord>> {
    let rows: Vec<SessionRow> = sqlx::query_as(&format!(
        "SELECT {COLUMNS} FROM sessions
          WHERE identity = ?
          ORDER BY connected_at DESC, id DESC
          LIMIT ? OFFSET ?"
    ))
    .bind(identity)
    .bind(limit as i64)
    .bind(offset as i64)
    .fetch_all(pool)
    .await
    .context("listing identity sessions")?;

    collect(rows)
}

pub async fn count_sessions(pool: &SqlitePool) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
        .fetch_one(pool)
        .await
        .context("counting sessions")?;

    Ok(count.max(0) as u64)
}

pub async fn count_sessions_for_identity(pool: &SqlitePool, identity: &str) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE identity = ?")
        .bind(identity)
        .fetch_one(pool)
        .await
        .context("counting identity sessions")?;

    Ok(count.max(0) as u64)
}

/// Sessions whose stint began at or after the given instant.
pub async fn count_connected_since(
    pool: &SqlitePool,
    server: Option<&str>,
    since: DateTime<Utc>,
) -> Result<u64> {
    let count: i64 = match server {
        Some(server) => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM sessions WHERE server = ? AND connected_at >= ?",
            )
            .bind(server)
            .bind(since.to_rfc3339())
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE connected_at >= ?")
                .bind(since.to_rfc3339())
                .fetch_one(pool)
                .await
        }
    }
    .context("counting sessions in window")?;

    Ok(count.max(0) as u64)
}

/// Number of currently active sessions.
pub async fn count_active(pool: &SqlitePool, server: Option<&str>) -> Result<u64> {
    let count: i64 = match server {
        Some(server) => {
            sqlx::query_scalar(
                "SELECT COUNT(*) FROM sessions WHERE server = ? AND disconnected_at IS NULL",
            )
            .bind(server)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_scalar("SELECT COUNT(*) FROM sessions WHERE disconnected_at IS NULL")
                .fetch_one(pool)
                .await
        }
    }
    .context("counting active sessions")?;

    Ok(count.max(0) as u64)
}

/// Distinct identities holding at least one active session.
pub async fn count_online_identities(pool: &SqlitePool, server: Option<&str>) -> Result<u64> {
    let count: i64 = match server {
        Some(server) => {
            sqlx::query_scalar(
                "SELECT COUNT(DISTINCT identity) FROM sessions
                  WHERE server = ? AND disconnected_at IS NULL",
            )
            .bind(server)
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_scalar(
                "SELECT COUNT(DISTINCT identity) FROM sessions WHERE disconnected_at IS NULL",
            )
            .fetch_one(pool)
            .await
        }
    }
    .context("counting online identities")?;

    Ok(count.max(0) as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use chrono::{Duration, TimeZone};

    use crate::store::Store;

    use super::*;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("sessions.db")).await.unwrap();
        (dir, store)
    }

    fn obs(identity: &str, port: &str, bytes_received: u64, bytes_sent: u64) -> SessionObservation {
        SessionObservation {
            identity: identity.to_string(),
            server: "vpn-eu-1".to_string(),
            origin_addr: "10.0.0.5".to_string(),
            origin_port: port.to_string(),
            virtual_addr: Some("192.168.255.6".to_string()),
            bytes_received,
            bytes_sent,
            connected_at: Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
        }
    }

    fn cycle_time(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_upsert_inserts_then_updates_in_place() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        let inserted = upsert_active(&mut tx, &obs("alice", "4444", 100, 50), cycle_time(0))
            .await
            .unwrap();
        assert!(inserted);

        let inserted = upsert_active(&mut tx, &obs("alice", "4444", 300, 150), cycle_time(1))
            .await
            .unwrap();
        assert!(!inserted);

        let active = active_for_server(&mut tx, "vpn-eu-1").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(active.len(), 1);
        assert_eq!(active[0].bytes_received, 300);
        assert_eq!(active[0].bytes_sent, 150);
        // Connect timestamp survives the update.
        assert_eq!(
            active[0].connected_at,
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap(),
        );
    }

    #[tokio::test]
    async fn test_update_keeps_virtual_addr_when_report_drops_it() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        upsert_active(&mut tx, &obs("alice", "4444", 100, 50), cycle_time(0))
            .await
            .unwrap();

        let mut without_vaddr = obs("alice", "4444", 200, 90);
        without_vaddr.virtual_addr = None;
        upsert_active(&mut tx, &without_vaddr, cycle_time(1))
            .await
            .unwrap();

        let active = active_for_server(&mut tx, "vpn-eu-1").await.unwrap();
        assert_eq!(active[0].virtual_addr.as_deref(), Some("192.168.255.6"));
    }

    #[tokio::test]
    async fn test_close_stamps_disconnect_and_duration() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        upsert_active(&mut tx, &obs("alice", "4444", 100, 50), cycle_time(0))
            .await
            .unwrap();

        let active = active_for_server(&mut tx, "vpn-eu-1").await.unwrap();
        let now = active[0].connected_at + Duration::seconds(90);
        close(&mut tx, &active[0], now).await.unwrap();

        assert!(active_for_server(&mut tx, "vpn-eu-1").await.unwrap().is_empty());
        tx.commit().await.unwrap();

        let all = recent_sessions(store.pool(), 10, 0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].disconnected_at, Some(now));
        assert_eq!(all[0].duration_secs, Some(90));
    }

    #[tokio::test]
    async fn test_reconnect_after_close_opens_new_record() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        upsert_active(&mut tx, &obs("alice", "4444", 100, 50), cycle_time(0))
            .await
            .unwrap();
        let active = active_for_server(&mut tx, "vpn-eu-1").await.unwrap();
        close(&mut tx, &active[0], cycle_time(1)).await.unwrap();

        let inserted = upsert_active(&mut tx, &obs("alice", "4444", 10, 5), cycle_time(2))
            .await
            .unwrap();
        assert!(inserted);
        tx.commit().await.unwrap();

        assert_eq!(count_sessions(store.pool()).await.unwrap(), 2);
        let active = active_sessions(store.pool(), None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].bytes_received, 10);
    }

    #[tokio::test]
    async fn test_same_identity_distinct_ports_are_distinct_sessions() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        upsert_active(&mut tx, &obs("alice", "4444", 100, 50), cycle_time(0))
            .await
            .unwrap();
        upsert_active(&mut tx, &obs("alice", "4445", 5, 2), cycle_time(0))
            .await
            .unwrap();

        let active = active_for_server(&mut tx, "vpn-eu-1").await.unwrap();
        assert_eq!(active.len(), 2);
    }

    #[tokio::test]
    async fn test_recent_sessions_pagination() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        for (i, name) in ["alice", "bob", "carol"].iter().enumerate() {
            let mut o = obs(name, "4444", 1, 1);
            o.connected_at = cycle_time(i as u32);
            upsert_active(&mut tx, &o, cycle_time(5)).await.unwrap();
        }
        tx.commit().await.unwrap();

        let page = recent_sessions(store.pool(), 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].identity, "carol");
        assert_eq!(page[1].identity, "bob");

        let page = recent_sessions(store.pool(), 2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].identity, "alice");
    }

    #[tokio::test]
    async fn test_count_connected_since() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        let mut old = obs("alice", "4444", 1, 1);
        old.connected_at = cycle_time(0) - Duration::days(2);
        upsert_active(&mut tx, &old, cycle_time(0)).await.unwrap();
        upsert_active(&mut tx, &obs("bob", "5555", 1, 1), cycle_time(0))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let since = cycle_time(0) - Duration::hours(12);
        assert_eq!(
            count_connected_since(store.pool(), None, since)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            count_connected_since(store.pool(), Some("vpn-eu-1"), since)
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            count_connected_since(store.pool(), Some("vpn-us-1"), since)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_active_and_online_counts() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        // alice holds two concurrent sessions, bob one; bob disconnects.
        upsert_active(&mut tx, &obs("alice", "4444", 1, 1), cycle_time(0))
            .await
            .unwrap();
        upsert_active(&mut tx, &obs("alice", "5555", 1, 1), cycle_time(0))
            .await
            .unwrap();
        upsert_active(&mut tx, &obs("bob", "6666", 1, 1), cycle_time(0))
            .await
            .unwrap();
        let active = active_for_server(&mut tx, "vpn-eu-1").await.unwrap();
        let bob = active.iter().find(|r| r.identity == "bob").unwrap();
        close(&mut tx, bob, cycle_time(1)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(count_active(store.pool(), None).await.unwrap(), 2);
        assert_eq!(
            count_active(store.pool(), Some("vpn-eu-1")).await.unwrap(),
            2
        );
        assert_eq!(
            count_online_identities(store.pool(), None).await.unwrap(),
            1
        );
    }
}
