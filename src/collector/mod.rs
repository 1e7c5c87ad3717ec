//! Report reconciliation.
//!
//! Each cycle reads every configured server's status file, diffs the reported
//! client set against the stored active sessions, and commits the outcome in
//! one transaction per server. Servers are reconciled independently; a server
//! whose file is unreadable keeps its stored state untouched and never blocks
//! the others.

pub mod delta;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::export::HealthMetrics;
use crate::status::parse::parse_report;
use crate::status::{Counters, SessionKey, SessionObservation};
use crate::store::{identity, session, traffic, Store};

use delta::{active_delta, closing_delta};

/// Outcome counts from reconciling one server report.
#[derive(Debug, Default)]
struct CycleStats {
    opened: u64,
    updated: u64,
    closed: u64,
    active: u64,
    identities: u64,
    resets: u64,
    delta: Counters,
}

/// Reconciles concentrator status reports into the store.
pub struct Collector {
    store: Arc<Store>,
    servers: Vec<ServerConfig>,
    metrics: Arc<HealthMetrics>,
}

impl Collector {
    pub fn new(
        store: Arc<Store>,
        servers: Vec<ServerConfig>,
        metrics: Arc<HealthMetrics>,
    ) -> Self {
        Self {
            store,
            servers,
            metrics,
        }
    }

    /// Runs one reconciliation cycle over every configured server.
    ///
    /// `now` is the capture timestamp stamped on everything the cycle writes,
    /// one value per cycle so all rows from one pass agree.
    pub async fn run_cycle(&self, now: DateTime<Utc>) {
        for server in &self.servers {
            let started = Instant::now();
            let outcome = self.reconcile_server(server, now).await;
            self.metrics
                .cycle_duration
                .observe(started.elapsed().as_secs_f64());

            let name = server.name.as_str();
            match outcome {
                Ok(stats) => {
                    self.metrics.cycles.with_label_values(&[name]).inc();
                    self.metrics
                        .active_sessions
                        .with_label_values(&[name])
                        .set(stats.active as f64);
                    self.metrics
                        .online_identities
                        .with_label_values(&[name])
                        .set(stats.identities as f64);
                    self.metrics
                        .sessions_opened
                        .with_label_values(&[name])
                        .inc_by(stats.opened as f64);
                    self.metrics
                        .sessions_closed
                        .with_label_values(&[name])
                        .inc_by(stats.closed as f64);
                    self.metrics
                        .counter_resets
                        .with_label_values(&[name])
                        .inc_by(stats.resets as f64);
                    self.metrics
                        .delta_bytes
                        .with_label_values(&[name, "in"])
                        .inc_by(stats.delta.bytes_in as f64);
                    self.metrics
                        .delta_bytes
                        .with_label_values(&[name, "out"])
                        .inc_by(stats.delta.bytes_out as f64);

                    debug!(
                        server = name,
                        opened = stats.opened,
                        updated = stats.updated,
                        closed = stats.closed,
                        active = stats.active,
                        resets = stats.resets,
                        bytes_in = stats.delta.bytes_in,
                        bytes_out = stats.delta.bytes_out,
                        "Reconciled server report"
                    );
                }
                Err(e) => {
                    self.metrics.cycle_errors.with_label_values(&[name]).inc();
                    warn!(server = name, error = ?e, "Failed to reconcile server");
                }
            }
        }
    }

    /// Reads and applies one server's status report.
    async fn reconcile_server(
        &self,
        server: &ServerConfig,
        now: DateTime<Utc>,
    ) -> Result<CycleStats> {
        let text = tokio::fs::read_to_string(&server.status_file)
            .await
            .with_context(|| {
                format!("reading status file {}", server.status_file.display())
            })?;

        let report = parse_report(&server.name, &text, now);
        if report.skipped_lines > 0 {
            self.metrics
                .parse_skips
                .with_label_values(&[server.name.as_str()])
                .inc_by(report.skipped_lines as f64);
        }

        let applied = self.apply(server, report.observations, now).await;
        if applied.is_err() {
            self.metrics
                .store_tx_failures
                .with_label_values(&[server.name.as_str()])
                .inc();
        }
        applied
    }

    /// Applies one parsed report in a single transaction.
    ///
    /// A readable report naming nobody is a genuine "all clients gone"
    /// statement and closes every active session for the server.
    async fn apply(
        &self,
        server: &ServerConfig,
        observations: Vec<SessionObservation>,
        now: DateTime<Utc>,
    ) -> Result<CycleStats> {
        // Last entry wins when a report repeats a key.
        let mut current: HashMap<SessionKey, SessionObservation> = HashMap::new();
        for obs in observations {
            current.insert(obs.key(), obs);
        }

        let mut stats = CycleStats::default();
        let mut touched: BTreeSet<String> = BTreeSet::new();

        let mut tx = self.store.begin().await?;

        let open = session::active_for_server(&mut tx, &server.name).await?;

        // Absent keys have disconnected. The closing delta is whatever the
        // session row accumulated past the prior ledger sample; the terminal
        // raw sample makes a later reconnect under the same key read as a
        // counter reset instead of a continuation.
        for record in &open {
            let key = record.key();
            if current.contains_key(&key) {
                continue;
            }

            let prior = traffic::latest_raw_counters(&mut tx, &key).await?;
            let final_delta = closing_delta(prior, record.counters());

            session::close(&mut tx, record, now).await?;
            traffic::record_raw(&mut tx, &key, record.counters(), now).await?;

            stats.closed += 1;
            stats.delta.bytes_in += final_delta.bytes_in;
            stats.delta.bytes_out += final_delta.bytes_out;
            touched.insert(record.identity.clone());

            info!(server = %server.name, session = %key, "session disconnected");
        }

        // Present keys continue their active session or open a fresh one.
        for obs in current.values() {
            let key = obs.key();
            let prior = traffic::latest_raw_counters(&mut tx, &key).await?;
            let outcome = active_delta(prior, obs.counters());
            if outcome.any_reset() {
                stats.resets += 1;
                warn!(
                    server = %server.name,
                    session = %key,
                    "cumulative counters went backwards, treating as reset"
                );
            }

            if session::upsert_active(&mut tx, obs, now).await? {
                stats.opened += 1;
                info!(server = %server.name, session = %key, "session connected");
            } else {
                stats.updated += 1;
            }
            traffic::record_raw(&mut tx, &key, obs.counters(), now).await?;

            stats.delta.bytes_in += outcome.delta.bytes_in;
            stats.delta.bytes_out += outcome.delta.bytes_out;
            touched.insert(obs.identity.clone());
        }

        stats.active = current.len() as u64;
        stats.identities = current
            .values()
            .map(|obs| obs.identity.as_str())
            .collect::<BTreeSet<_>>()
            .len() as u64;

        traffic::record_aggregate(
            &mut tx,
            &server.name,
            stats.delta,
            stats.identities as u32,
            now,
        )
        .await?;

        // Rollups for every identity the cycle touched.
        for touched_identity in &touched {
            identity::recompute(&mut tx, touched_identity, &server.name, now).await?;
        }

        tx.commit().await.context("committing reconciliation")?;

        Ok(stats)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use chrono::TimeZone;
    use tempfile::TempDir;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap()
    }

    fn client_line(identity: &str, origin: &str, recv: u64, sent: u64) -> String {
        format!("CLIENT_LIST,{identity},{origin},10.8.0.2,,{recv},{sent},2024-05-01 09:55:00")
    }

    fn report(lines: &[String]) -> String {
        let mut text = String::from(
            "OpenVPN CLIENT LIST\n\
             Updated,2024-05-01 10:00:00\n\
             CLIENT_LIST,Common Name,Real Address,Virtual Address,Last Ref,Bytes Received,Bytes Sent,Connected Since\n",
        );
        for line in lines {
            text.push_str(line);
            text.push('\n');
        }
        text.push_str("END\n");
        text
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<Store>,
        metrics: Arc<HealthMetrics>,
        status_path: PathBuf,
        collector: Collector,
    }

    async fn harness(server: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let status_path = dir.path().join(format!("{server}.status"));
        let store = Arc::new(Store::open(&dir.path().join("test.db")).await.unwrap());
        let metrics = Arc::new(HealthMetrics::new(":0").unwrap());
        let collector = Collector::new(
            store.clone(),
            vec![ServerConfig {
                name: server.to_string(),
                status_file: status_path.clone(),
            }],
            metrics.clone(),
        );
        Harness {
            _dir: dir,
            store,
            metrics,
            status_path,
            collector,
        }
    }

    #[tokio::test]
    async fn test_cycle_opens_updates_and_closes_sessions() {
        let h = harness("vpn-eu-1").await;

        std::fs::write(
            &h.status_path,
            report(&[client_line("alice", "203.0.113.7:4444", 1000, 400)]),
        )
        .unwrap();
        h.collector.run_cycle(at(0)).await;

        let active = session::active_sessions(h.store.pool(), None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].identity, "alice");
        assert_eq!(active[0].bytes_received, 1000);
        let opened_at = active[0].connected_at;

        std::fs::write(
            &h.status_path,
            report(&[client_line("alice", "203.0.113.7:4444", 5000, 2000)]),
        )
        .unwrap();
        h.collector.run_cycle(at(1)).await;

        let active = session::active_sessions(h.store.pool(), None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].bytes_received, 5000);
        assert_eq!(active[0].bytes_sent, 2000);
        assert_eq!(active[0].connected_at, opened_at);

        std::fs::write(&h.status_path, report(&[])).unwrap();
        h.collector.run_cycle(at(2)).await;

        let active = session::active_sessions(h.store.pool(), None).await.unwrap();
        assert!(active.is_empty());

        let all = session::recent_sessions(h.store.pool(), 10, 0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].disconnected_at, Some(at(2)));
        // Connected since 09:55 per the report, closed at 10:02.
        assert_eq!(all[0].duration_secs, Some(420));

        let stats = identity::list(h.store.pool(), None).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].current_status, identity::ConnectionStatus::Offline);
        assert_eq!(stats[0].total_sessions, 1);

        assert_eq!(h.metrics.cycles.with_label_values(&["vpn-eu-1"]).get(), 3.0);
        assert_eq!(
            h.metrics
                .sessions_opened
                .with_label_values(&["vpn-eu-1"])
                .get(),
            1.0
        );
        assert_eq!(
            h.metrics
                .sessions_closed
                .with_label_values(&["vpn-eu-1"])
                .get(),
            1.0
        );
        assert_eq!(
            h.metrics
                .active_sessions
                .with_label_values(&["vpn-eu-1"])
                .get(),
            0.0
        );
    }

    #[tokio::test]
    async fn test_unreadable_report_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let flaky_path = dir.path().join("flaky.status");
        let steady_path = dir.path().join("steady.status");
        std::fs::write(
            &flaky_path,
            report(&[client_line("alice", "203.0.113.7:4444", 10, 20)]),
        )
        .unwrap();
        std::fs::write(
            &steady_path,
            report(&[client_line("bob", "198.51.100.3:5555", 30, 40)]),
        )
        .unwrap();

        let store = Arc::new(Store::open(&dir.path().join("test.db")).await.unwrap());
        let metrics = Arc::new(HealthMetrics::new(":0").unwrap());
        let collector = Collector::new(
            store.clone(),
            vec![
                ServerConfig {
                    name: "vpn-flaky".to_string(),
                    status_file: flaky_path.clone(),
                },
                ServerConfig {
                    name: "vpn-steady".to_string(),
                    status_file: steady_path.clone(),
                },
            ],
            metrics.clone(),
        );

        collector.run_cycle(at(0)).await;
        assert_eq!(
            session::active_sessions(store.pool(), None).await.unwrap().len(),
            2
        );

        // The flaky server's file disappears; the steady one empties out.
        std::fs::remove_file(&flaky_path).unwrap();
        std::fs::write(&steady_path, report(&[])).unwrap();
        collector.run_cycle(at(1)).await;

        let active = session::active_sessions(store.pool(), None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].server, "vpn-flaky");
        assert_eq!(active[0].identity, "alice");

        assert_eq!(
            metrics.cycle_errors.with_label_values(&["vpn-flaky"]).get(),
            1.0
        );
        assert_eq!(metrics.cycles.with_label_values(&["vpn-flaky"]).get(), 1.0);
        assert_eq!(metrics.cycles.with_label_values(&["vpn-steady"]).get(), 2.0);
    }

    #[tokio::test]
    async fn test_counter_reset_is_accounted_per_direction() {
        let h = harness("vpn-eu-1").await;

        std::fs::write(
            &h.status_path,
            report(&[client_line("alice", "203.0.113.7:4444", 1000, 500)]),
        )
        .unwrap();
        h.collector.run_cycle(at(0)).await;

        // Inbound went backwards (reset), outbound kept growing.
        std::fs::write(
            &h.status_path,
            report(&[client_line("alice", "203.0.113.7:4444", 200, 900)]),
        )
        .unwrap();
        h.collector.run_cycle(at(1)).await;

        let totals = traffic::totals_since(h.store.pool(), None, at(0)).await.unwrap();
        assert_eq!(totals.bytes_in, 1000 + 200);
        assert_eq!(totals.bytes_out, 500 + 400);

        assert_eq!(
            h.metrics
                .counter_resets
                .with_label_values(&["vpn-eu-1"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_zero_start_session_accumulates_full_growth() {
        let h = harness("vpn-eu-1").await;

        // First sighting right at connect, before any bytes moved.
        std::fs::write(
            &h.status_path,
            report(&[client_line("alice", "203.0.113.7:4444", 0, 0)]),
        )
        .unwrap();
        h.collector.run_cycle(at(0)).await;

        std::fs::write(
            &h.status_path,
            report(&[client_line("alice", "203.0.113.7:4444", 1_048_576, 524_288)]),
        )
        .unwrap();
        h.collector.run_cycle(at(1)).await;

        let totals = traffic::totals_since(h.store.pool(), None, at(0)).await.unwrap();
        assert_eq!(totals.bytes_in, 1_048_576);
        assert_eq!(totals.bytes_out, 524_288);

        let stats = identity::list(h.store.pool(), None).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].total_bytes_received, 1_048_576);
        assert_eq!(stats[0].total_bytes_sent, 524_288);
        assert_eq!(
            h.metrics
                .counter_resets
                .with_label_values(&["vpn-eu-1"])
                .get(),
            0.0
        );
    }

    #[tokio::test]
    async fn test_disconnect_accounts_final_traffic_exactly_once() {
        let h = harness("vpn-eu-1").await;

        std::fs::write(
            &h.status_path,
            report(&[client_line("bob", "198.51.100.3:5555", 100, 50)]),
        )
        .unwrap();
        h.collector.run_cycle(at(0)).await;

        std::fs::write(
            &h.status_path,
            report(&[client_line("bob", "198.51.100.3:5555", 300, 150)]),
        )
        .unwrap();
        h.collector.run_cycle(at(1)).await;

        std::fs::write(&h.status_path, report(&[])).unwrap();
        h.collector.run_cycle(at(2)).await;

        // Ledger total equals the session's final cumulative counters.
        let totals = traffic::totals_since(h.store.pool(), None, at(0)).await.unwrap();
        assert_eq!(totals.bytes_in, 300);
        assert_eq!(totals.bytes_out, 150);

        let all = session::recent_sessions(h.store.pool(), 10, 0).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].bytes_received, 300);
        assert_eq!(all[0].bytes_sent, 150);
        assert!(!all[0].is_active());
    }

    #[tokio::test]
    async fn test_reconnect_under_same_key_reads_as_reset() {
        let h = harness("vpn-eu-1").await;

        std::fs::write(
            &h.status_path,
            report(&[client_line("carol", "192.0.2.9:7777", 5000, 1000)]),
        )
        .unwrap();
        h.collector.run_cycle(at(0)).await;

        std::fs::write(&h.status_path, report(&[])).unwrap();
        h.collector.run_cycle(at(1)).await;

        std::fs::write(
            &h.status_path,
            report(&[client_line("carol", "192.0.2.9:7777", 300, 100)]),
        )
        .unwrap();
        h.collector.run_cycle(at(2)).await;

        // Fresh counters against the terminal sample count in full, not as
        // a negative continuation.
        let totals = traffic::totals_since(h.store.pool(), None, at(0)).await.unwrap();
        assert_eq!(totals.bytes_in, 5000 + 300);
        assert_eq!(totals.bytes_out, 1000 + 100);

        assert_eq!(session::count_sessions(h.store.pool()).await.unwrap(), 2);
        let active = session::active_sessions(h.store.pool(), None).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(
            h.metrics
                .counter_resets
                .with_label_values(&["vpn-eu-1"])
                .get(),
            1.0
        );
    }

    #[tokio::test]
    async fn test_aggregate_row_counts_distinct_identities() {
        let h = harness("vpn-eu-1").await;

        // Alice twice from different origins plus bob: three sessions,
        // two identities.
        std::fs::write(
            &h.status_path,
            report(&[
                client_line("alice", "203.0.113.7:4444", 10, 10),
                client_line("alice", "203.0.113.8:4444", 20, 20),
                client_line("bob", "198.51.100.3:5555", 30, 30),
            ]),
        )
        .unwrap();
        h.collector.run_cycle(at(0)).await;

        let rows = traffic::aggregates_in_window(h.store.pool(), Some("vpn-eu-1"), at(0), at(0))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].active_identities, 2);
        assert_eq!(rows[0].counters().bytes_in, 60);

        assert_eq!(
            session::active_sessions(h.store.pool(), None).await.unwrap().len(),
            3
        );
        assert_eq!(
            h.metrics
                .online_identities
                .with_label_values(&["vpn-eu-1"])
                .get(),
            2.0
        );
    }

    #[tokio::test]
    async fn test_malformed_lines_are_counted_but_cycle_succeeds() {
        let h = harness("vpn-eu-1").await;

        let mut text = report(&[client_line("alice", "203.0.113.7:4444", 10, 20)]);
        text.push_str("CLIENT_LIST,truncated\n");
        std::fs::write(&h.status_path, text).unwrap();
        h.collector.run_cycle(at(0)).await;

        assert_eq!(
            session::active_sessions(h.store.pool(), None).await.unwrap().len(),
            1
        );
        assert_eq!(h.metrics.cycles.with_label_values(&["vpn-eu-1"]).get(), 1.0);
        assert_eq!(
            h.metrics.parse_skips.with_label_values(&["vpn-eu-1"]).get(),
            1.0
        );
    }
}
