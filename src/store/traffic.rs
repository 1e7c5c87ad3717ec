//! Traffic ledger samples.
//!
//! Two kinds of row share one table. Raw samples carry a session key and the
//! session's cumulative counters at capture time; they are the baseline for
//! the next cycle's delta. Aggregate samples carry a null identity and hold
//! the per-server delta for one cycle plus the concurrent-identity count;
//! they are what the chart queries fold.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::SqliteConnection;

use crate::status::{Counters, SessionKey};

use super::parse_ts;

/// One ledger row.
#[derive(Debug, Clone)]
pub struct TrafficSample {
    pub id: i64,
    pub server: String,
    pub identity: Option<String>,
    pub origin_addr: Option<String>,
    pub origin_port: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_identities: u32,
    pub captured_at: DateTime<Utc>,
}

impl TrafficSample {
    pub fn counters(&self) -> Counters {
        Counters {
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
        }
    }

    /// Session key for raw samples, none for aggregate rows.
    pub fn key(&self) -> Option<SessionKey> {
        match (&self.identity, &self.origin_addr, &self.origin_port) {
            (Some(identity), Some(origin_addr), Some(origin_port)) => Some(SessionKey {
                identity: identity.clone(),
                server: self.server.clone(),
                origin_addr: origin_addr.clone(),
                origin_port: origin_port.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TrafficRow {
    id: i64,
    server: String,
    identity: Option<String>,
    origin_addr: Option<String>,
    origin_port: Option<String>,
    bytes_in: i64,
    bytes_out: i64,
    active_identities: i64,
    captured_at: String,
}

impl TrafficRow {
    fn into_sample(self) -> Result<TrafficSample> {
        Ok(TrafficSample {
            id: self.id,
            server: self.server,
            identity: self.identity,
            origin_addr: self.origin_addr,
            origin_port: self.origin_port,
            bytes_in: self.bytes_in.max(0) as u64,
            bytes_out: self.bytes_out.max(0) as u64,
            active_identities: self.active_identities.max(0) as u32,
            captured_at: parse_ts(&self.captured_at)?,
        })
    }
}

const COLUMNS: &str = "id, server, identity, origin_addr, origin_port, \
                       bytes_in, bytes_out, active_identities, captured_at";

fn collect(rows: Vec<TrafficRow>) -> Result<Vec<TrafficSample>> {
    rows.into_iter().map(TrafficRow::into_sample).collect()
}

/// Records a session's cumulative counters for one cycle.
///
/// A unique index rejects a second raw sample for the same key at the same
/// capture time, which keeps "the prior sample" well defined.
pub async fn record_raw(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    counters: Counters,
    captured_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO traffic_samples
            (server, identity, origin_addr, origin_port,
             bytes_in, bytes_out, active_identities, captured_at)
         VALUES (?, ?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(&key.server)
    .bind(&key.identity)
    .bind(&key.origin_addr)
    .bind(&key.origin_port)
    .bind(counters.bytes_in as i64)
    .bind(counters.bytes_out as i64)
    .bind(captured_at.to_rfc3339())
    .execute(&mut *conn)
    .await
    .context("recording raw traffic sample")?;

    Ok(())
}

/// Records one server's aggregated delta for one cycle.
pub async fn record_aggregate(
    conn: &mut SqliteConnection,
    server: &str,
    delta: Counters,
    active_identities: u32,
    captured_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO traffic_samples
            (server, identity, origin_addr, origin_port,
             bytes_in, bytes_out, active_identities, captured_at)
         VALUES (?, NULL, NULL, NULL, ?, ?, ?, ?)",
    )
    .bind(server)
    .bind(delta.bytes_in as i64)
    .bind(delta.bytes_out as i64)
    .bind(active_identities as i64)
    .bind(captured_at.to_rfc3339())
    .execute(&mut *conn)
    .await
    .context("recording aggregate traffic sample")?;

    Ok(())
}

/// Counters from the most recent raw sample for one session key.
pub async fn latest_raw_counters(
    conn: &mut SqliteConnection,
    key: &SessionKey,
) -> Result<Option<Counters>> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        "SELECT bytes_in, bytes_out FROM traffic_samples
          WHERE server = ? AND identity = ? AND origin_addr = ? AND origin_port = ?
          ORDER BY id DESC LIMIT 1",
    )
    .bind(&key.server)
    .bind(&key.identity)
    .bind(&key.origin_addr)
    .bind(&key.origin_port)
    .fetch_optional(&mut *conn)
    .await
    .context("loading prior raw sample")?;

    Ok(row.map(|(bytes_in, bytes_out)| Counters {
        bytes_in: bytes_in.max(0) as u64,
        bytes_out: bytes_out.max(0) as u64,
    }))
}

/// Aggregate samples inside a window, oldest first.
pub async fn aggregates_in_window(
    pool: &SqlitePool,
    server: Option<&str>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<TrafficSample>> {
    let rows: Vec<TrafficRow> = match server {
        Some(server) => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM traffic_samples
                  WHERE identity IS NULL AND server = ?
                    AND captured_at >= ? AND captured_at <= ?
                  ORDER BY captured_at, id"
            ))
            .bind(server)
            .bind(since.to_rfc3339())
            .bind(until.to_rfc3339())
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM traffic_samples
                  WHERE identity IS NULL
                    AND captured_at >= ? AND captured_at <= ?
                  ORDER BY captured_at, id"
            ))
            .bind(since.to_rfc3339())
            .bind(until.to_rfc3339())
            .fetch_all(pool)
            .await
        }
    }
    .context("loading aggregate samples")?;

    collect(rows)
}

/// Raw samples inside a window, oldest first.
pub async fn raw_in_window(
    pool: &SqlitePool,
    server: Option<&str>,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
) -> Result<Vec<TrafficSample>> {
    let rows: Vec<TrafficRow> = match server {
        Some(server) => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM traffic_samples
                  WHERE identity IS NOT NULL AND server = ?
                    AND captured_at >= ? AND captured_at <= ?
                  ORDER BY captured_at, id"
            ))
            .bind(server)
            .bind(since.to_rfc3339())
            .bind(until.to_rfc3339())
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM traffic_samples
                  WHERE identity IS NOT NULL
                    AND captured_at >= ? AND captured_at <= ?
                  ORDER BY captured_at, id"
            ))
            .bind(since.to_rfc3339())
            .bind(until.to_rfc3339())
            .fetch_all(pool)
            .await
        }
    }
    .context("loading raw samples")?;

    collect(rows)
}

/// Latest raw sample per session key from before a cutoff.
///
/// Seeds delta baselines for windowed queries so a session that was already
/// connected before the window does not re-count its full cumulative
/// counters inside it.
pub async fn raw_seed_before(
    pool: &SqlitePool,
    server: Option<&str>,
    before: DateTime<Utc>,
) -> Result<Vec<TrafficSample>> {
    let rows: Vec<TrafficRow> = match server {
        Some(server) => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM traffic_samples
                  WHERE id IN (
                        SELECT MAX(id) FROM traffic_samples
                         WHERE identity IS NOT NULL AND server = ? AND captured_at < ?
                         GROUP BY server, identity, origin_addr, origin_port
                  )
                  ORDER BY id"
            ))
            .bind(server)
            .bind(before.to_rfc3339())
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {COLUMNS} FROM traffic_samples
                  WHERE id IN (
                        SELECT MAX(id) FROM traffic_samples
                         WHERE identity IS NOT NULL AND captured_at < ?
                         GROUP BY server, identity, origin_addr, origin_port
                  )
                  ORDER BY id"
            ))
            .bind(before.to_rfc3339())
            .fetch_all(pool)
            .await
        }
    }
    .context("loading seed samples")?;

    collect(rows)
}

/// Summed aggregate deltas from a cutoff to now.
pub async fn totals_since(
    pool: &SqlitePool,
    server: Option<&str>,
    since: DateTime<Utc>,
) -> Result<Counters> {
    let (bytes_in, bytes_out): (i64, i64) = match server {
        Some(server) => {
            sqlx::query_as(
                "SELECT COALESCE(SUM(bytes_in), 0), COALESCE(SUM(bytes_out), 0)
                   FROM traffic_samples
                  WHERE identity IS NULL AND server = ? AND captured_at >= ?",
            )
            .bind(server)
            .bind(since.to_rfc3339())
            .fetch_one(pool)
            .await
        }
        None => {
            sqlx::query_as(
                "SELECT COALESCE(SUM(bytes_in), 0), COALESCE(SUM(bytes_out), 0)
                   FROM traffic_samples
                  WHERE identity IS NULL AND captured_at >= ?",
            )
            .bind(since.to_rfc3339())
            .fetch_one(pool)
            .await
        }
    }
    .context("summing window totals")?;

    Ok(Counters {
        bytes_in: bytes_in.max(0) as u64,
        bytes_out: bytes_out.max(0) as u64,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use chrono::{Duration, TimeZone};

    use crate::store::Store;

    use super::*;

    async fn open_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("traffic.db")).await.unwrap();
        (dir, store)
    }

    fn key(identity: &str, server: &str) -> SessionKey {
        SessionKey {
            identity: identity.to_string(),
            server: server.to_string(),
            origin_addr: "10.0.0.5".to_string(),
            origin_port: "4444".to_string(),
        }
    }

    fn counters(bytes_in: u64, bytes_out: u64) -> Counters {
        Counters { bytes_in, bytes_out }
    }

    fn cycle_time(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn test_latest_raw_counters_follows_insert_order() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();
        let k = key("alice", "vpn-eu-1");

        assert!(latest_raw_counters(&mut tx, &k).await.unwrap().is_none());

        record_raw(&mut tx, &k, counters(100, 50), cycle_time(0))
            .await
            .unwrap();
        record_raw(&mut tx, &k, counters(300, 150), cycle_time(1))
            .await
            .unwrap();

        let prior = latest_raw_counters(&mut tx, &k).await.unwrap().unwrap();
        assert_eq!(prior, counters(300, 150));
    }

    #[tokio::test]
    async fn test_raw_samples_are_per_key() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        record_raw(&mut tx, &key("alice", "vpn-eu-1"), counters(100, 50), cycle_time(0))
            .await
            .unwrap();

        assert!(latest_raw_counters(&mut tx, &key("bob", "vpn-eu-1"))
            .await
            .unwrap()
            .is_none());
        assert!(latest_raw_counters(&mut tx, &key("alice", "vpn-us-1"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_raw_sample_for_cycle_is_rejected() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();
        let k = key("alice", "vpn-eu-1");

        record_raw(&mut tx, &k, counters(100, 50), cycle_time(0))
            .await
            .unwrap();
        let dup = record_raw(&mut tx, &k, counters(200, 90), cycle_time(0)).await;
        assert!(dup.is_err());
    }

    #[tokio::test]
    async fn test_window_queries_split_by_kind() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        record_raw(&mut tx, &key("alice", "vpn-eu-1"), counters(100, 50), cycle_time(0))
            .await
            .unwrap();
        record_aggregate(&mut tx, "vpn-eu-1", counters(100, 50), 1, cycle_time(0))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let since = cycle_time(0) - Duration::minutes(5);
        let until = cycle_time(5);

        let aggregates = aggregates_in_window(store.pool(), None, since, until)
            .await
            .unwrap();
        assert_eq!(aggregates.len(), 1);
        assert!(aggregates[0].identity.is_none());
        assert_eq!(aggregates[0].active_identities, 1);

        let raw = raw_in_window(store.pool(), None, since, until).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].key().unwrap(), key("alice", "vpn-eu-1"));
    }

    #[tokio::test]
    async fn test_window_filters_by_server_and_time() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        record_aggregate(&mut tx, "vpn-eu-1", counters(10, 5), 1, cycle_time(0))
            .await
            .unwrap();
        record_aggregate(&mut tx, "vpn-us-1", counters(20, 10), 2, cycle_time(0))
            .await
            .unwrap();
        record_aggregate(&mut tx, "vpn-eu-1", counters(30, 15), 1, cycle_time(30))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let samples =
            aggregates_in_window(store.pool(), Some("vpn-eu-1"), cycle_time(0), cycle_time(10))
                .await
                .unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].bytes_in, 10);
    }

    #[tokio::test]
    async fn test_seed_picks_latest_before_cutoff_per_key() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();
        let alice = key("alice", "vpn-eu-1");
        let bob = key("bob", "vpn-eu-1");

        record_raw(&mut tx, &alice, counters(100, 50), cycle_time(0))
            .await
            .unwrap();
        record_raw(&mut tx, &alice, counters(300, 150), cycle_time(1))
            .await
            .unwrap();
        record_raw(&mut tx, &bob, counters(7, 3), cycle_time(1))
            .await
            .unwrap();
        // Inside the window, must not appear in the seed.
        record_raw(&mut tx, &alice, counters(500, 200), cycle_time(10))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let seed = raw_seed_before(store.pool(), None, cycle_time(10)).await.unwrap();
        assert_eq!(seed.len(), 2);

        let alice_seed = seed.iter().find(|s| s.key().unwrap() == alice).unwrap();
        assert_eq!(alice_seed.counters(), counters(300, 150));
    }

    #[tokio::test]
    async fn test_totals_since_sums_aggregates_only() {
        let (_dir, store) = open_store().await;
        let mut tx = store.begin().await.unwrap();

        record_raw(&mut tx, &key("alice", "vpn-eu-1"), counters(999, 999), cycle_time(0))
            .await
            .unwrap();
        record_aggregate(&mut tx, "vpn-eu-1", counters(10, 5), 1, cycle_time(0))
            .await
            .unwrap();
        record_aggregate(&mut tx, "vpn-us-1", counters(20, 10), 1, cycle_time(1))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let totals = totals_since(store.pool(), None, cycle_time(0)).await.unwrap();
        assert_eq!(totals, counters(30, 15));

        let eu_only = totals_since(store.pool(), Some("vpn-eu-1"), cycle_time(0))
            .await
            .unwrap();
        assert_eq!(eu_only, counters(10, 5));
    }
}
