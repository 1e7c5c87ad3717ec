use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "tunnelmon" namespace. Organized by concern:
/// - Cycle: reconcile loop outcomes per server
/// - Session: lifecycle counters and occupancy gauges
/// - Ledger: accounted traffic and its anomalies
/// - Retention: sweep results
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Cycle ===
    /// Reconcile cycles completed per server.
    pub cycles: CounterVec,
    /// Reconcile cycles that failed per server.
    pub cycle_errors: CounterVec,
    /// Wall time of one server's reconcile cycle.
    pub cycle_duration: Histogram,
    /// Status report lines rejected as structurally invalid.
    pub parse_skips: CounterVec,

    // === Session ===
    /// Session records opened per server.
    pub sessions_opened: CounterVec,
    /// Session records closed per server.
    pub sessions_closed: CounterVec,
    /// Active sessions after the latest cycle per server.
    pub active_sessions: GaugeVec,
    /// Distinct online identities after the latest cycle per server.
    pub online_identities: GaugeVec,

    // === Ledger ===
    /// Delta bytes accounted per server and direction (in/out).
    pub delta_bytes: CounterVec,
    /// Counter-reset anomalies detected per server.
    pub counter_resets: CounterVec,
    /// Reconcile transactions that failed to apply per server.
    pub store_tx_failures: CounterVec,

    // === Retention ===
    /// Rows removed by retention sweeps, by kind (sessions/samples).
    pub retention_removed: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Cycle ===
        let cycles = CounterVec::new(
            Opts::new("cycles_total", "Total reconcile cycles completed per server.")
                .namespace("tunnelmon"),
            &["server"],
        )?;
        let cycle_errors = CounterVec::new(
            Opts::new("cycle_errors_total", "Total reconcile cycles that failed per server.")
                .namespace("tunnelmon"),
            &["server"],
        )?;
        let cycle_duration = Histogram::with_opts(
            HistogramOpts::new(
                "cycle_duration_seconds",
                "Wall time of one server's reconcile cycle.",
            )
            .namespace("tunnelmon")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        let parse_skips = CounterVec::new(
            Opts::new(
                "parse_skips_total",
                "Total status report lines rejected as structurally invalid.",
            )
            .namespace("tunnelmon"),
            &["server"],
        )?;

        // === Session ===
        let sessions_opened = CounterVec::new(
            Opts::new("sessions_opened_total", "Total session records opened per server.")
                .namespace("tunnelmon"),
            &["server"],
        )?;
        let sessions_closed = CounterVec::new(
            Opts::new("sessions_closed_total", "Total session records closed per server.")
                .namespace("tunnelmon"),
            &["server"],
        )?;
        let active_sessions = GaugeVec::new(
            Opts::new(
                "active_sessions",
                "Active sessions after the latest cycle per server.",
            )
            .namespace("tunnelmon"),
            &["server"],
        )?;
        let online_identities = GaugeVec::new(
            Opts::new(
                "online_identities",
                "Distinct online identities after the latest cycle per server.",
            )
            .namespace("tunnelmon"),
            &["server"],
        )?;

        // === Ledger ===
        let delta_bytes = CounterVec::new(
            Opts::new(
                "delta_bytes_total",
                "Total delta bytes accounted per server and direction.",
            )
            .namespace("tunnelmon"),
            &["server", "direction"],
        )?;
        let counter_resets = CounterVec::new(
            Opts::new(
                "counter_resets_total",
                "Total counter-reset anomalies detected per server.",
            )
            .namespace("tunnelmon"),
            &["server"],
        )?;
        let store_tx_failures = CounterVec::new(
            Opts::new(
                "store_tx_failures_total",
                "Total reconcile transactions that failed to apply per server.",
            )
            .namespace("tunnelmon"),
            &["server"],
        )?;

        // === Retention ===
        let retention_removed = CounterVec::new(
            Opts::new(
                "retention_removed_total",
                "Total rows removed by retention sweeps by kind.",
            )
            .namespace("tunnelmon"),
            &["kind"],
        )?;

        // Register all metrics with the custom registry.
        registry.register(Box::new(cycles.clone()))?;
        registry.register(Box::new(cycle_errors.clone()))?;
        registry.register(Box::new(cycle_duration.clone()))?;
        registry.register(Box::new(parse_skips.clone()))?;
        registry.register(Box::new(sessions_opened.clone()))?;
        registry.register(Box::new(sessions_closed.clone()))?;
        registry.register(Box::new(active_sessions.clone()))?;
        registry.register(Box::new(online_identities.clone()))?;
        registry.register(Box::new(delta_bytes.clone()))?;
        registry.register(Box::new(counter_resets.clone()))?;
        registry.register(Box::new(store_tx_failures.clone()))?;
        registry.register(Box::new(retention_removed.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            cycles,
            cycle_errors,
            cycle_duration,
            parse_skips,
            sessions_opened,
            sessions_closed,
            active_sessions,
            online_identities,
            delta_bytes,
            counter_resets,
            store_tx_failures,
            retention_removed,
        })
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
