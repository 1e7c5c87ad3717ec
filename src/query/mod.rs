//! Read-side query surface.
//!
//! Everything an API layer needs from the store, as pure reads over the
//! shared pool. Pagination is clamped here so callers cannot request
//! unbounded pages, and chart windows pick their own bucket width.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::config::QueryConfig;
use crate::status::Counters;
use crate::store::identity::{self, IdentityOverview, IdentityStats};
use crate::store::session::{self, SessionRecord};
use crate::store::traffic::{self, TrafficSample};
use crate::store::Store;

pub mod chart;

use chart::{BucketWidth, ChartPoint, IdentitySeries};

/// One page of session history plus the unpaged total.
#[derive(Debug, Clone)]
pub struct SessionPage {
    pub sessions: Vec<SessionRecord>,
    pub total: u64,
}

/// Deployment-wide rollup for the landing view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub active_sessions: u64,
    pub online_identities: u64,
    pub known_identities: u64,
    pub sessions_today: u64,
    pub sessions_this_week: u64,
    /// Aggregate deltas captured since UTC midnight.
    pub bytes_today: Counters,
    /// Lifetime transfer rollup; survives ledger retention.
    pub bytes_total: Counters,
}

/// Read accessors over a reconciled store.
pub struct Queries {
    pool: SqlitePool,
    cfg: QueryConfig,
}

impl Queries {
    pub fn new(store: &Store, cfg: QueryConfig) -> Self {
        Self {
            pool: store.pool().clone(),
            cfg,
        }
    }

    fn page_limit(&self, limit: Option<u32>) -> u32 {
        limit
            .unwrap_or(self.cfg.default_limit)
            .clamp(1, self.cfg.max_limit)
    }

    /// Currently active sessions, optionally narrowed to one server.
    pub async fn active_sessions(&self, server: Option<&str>) -> Result<Vec<SessionRecord>> {
        session::active_sessions(&self.pool, server).await
    }

    /// Session history across all identities, newest first.
    pub async fn recent_sessions(&self, limit: Option<u32>, offset: u32) -> Result<SessionPage> {
        let limit = self.page_limit(limit);
        let sessions = session::recent_sessions(&self.pool, limit, offset).await?;
        let total = session::count_sessions(&self.pool).await?;
        Ok(SessionPage { sessions, total })
    }

    /// Session history for one identity, newest first.
    pub async fn identity_sessions(
        &self,
        identity: &str,
        limit: Option<u32>,
        offset: u32,
    ) -> Result<SessionPage> {
        let limit = self.page_limit(limit);
        let sessions = session::sessions_for_identity(&self.pool, identity, limit, offset).await?;
        let total = session::count_sessions_for_identity(&self.pool, identity).await?;
        Ok(SessionPage { sessions, total })
    }

    /// Identity roster page: online identities first, then by recency.
    ///
    /// `search` narrows by identity substring. Each row carries counts of
    /// sessions opened since UTC midnight and over the trailing seven days.
    pub async fn identity_overview(
        &self,
        server: Option<&str>,
        search: Option<&str>,
        limit: Option<u32>,
        offset: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<IdentityOverview>> {
        let limit = self.page_limit(limit);
        let today_start = BucketWidth::Day.truncate(now);
        let week_start = now - chrono::Duration::days(7);
        identity::overview_page(
            &self.pool,
            server,
            search,
            limit,
            offset,
            today_start,
            week_start,
        )
        .await
    }

    /// Per-server stat rows for one identity.
    pub async fn identity_detail(&self, identity: &str) -> Result<Vec<IdentityStats>> {
        identity::list_for_identity(&self.pool, identity).await
    }

    /// Transfer chart over a trailing window, optionally for one server.
    pub async fn traffic_chart(
        &self,
        server: Option<&str>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<ChartPoint>> {
        let width = BucketWidth::for_window(window);
        let since = window_start(now, window)?;
        let samples = traffic::aggregates_in_window(&self.pool, server, since, now).await?;
        Ok(chart::bucket_aggregates(&samples, width))
    }

    /// Per-identity transfer series over a trailing window.
    ///
    /// Series come back in the order identities were requested, with an
    /// empty series for any identity the window has no samples for. `origin`
    /// narrows to the single session key whose origin renders as
    /// `addr:port`.
    pub async fn identity_comparison(
        &self,
        identities: &[String],
        server: Option<&str>,
        origin: Option<&str>,
        window: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<IdentitySeries>> {
        let width = BucketWidth::for_window(window);
        let since = window_start(now, window)?;

        let wanted: HashSet<&str> = identities.iter().map(String::as_str).collect();
        let keep = |sample: &TrafficSample| -> bool {
            let Some(identity) = sample.identity.as_deref() else {
                return false;
            };
            if !wanted.contains(identity) {
                return false;
            }
            origin.map_or(true, |origin| origin_matches(sample, origin))
        };

        let mut seeds = traffic::raw_seed_before(&self.pool, server, since).await?;
        seeds.retain(|s| keep(s));
        let mut samples = traffic::raw_in_window(&self.pool, server, since, now).await?;
        samples.retain(|s| keep(s));

        let mut by_identity: HashMap<String, IdentitySeries> =
            chart::bucket_identity_deltas(&seeds, &samples, width)
                .into_iter()
                .map(|series| (series.identity.clone(), series))
                .collect();

        Ok(identities
            .iter()
            .map(|identity| {
                by_identity.remove(identity).unwrap_or_else(|| IdentitySeries {
                    identity: identity.clone(),
                    points: Vec::new(),
                })
            })
            .collect())
    }

    /// Deployment summary, optionally for one server.
    pub async fn summary(&self, server: Option<&str>, now: DateTime<Utc>) -> Result<Summary> {
        let today_start = BucketWidth::Day.truncate(now);
        let week_start = now - chrono::Duration::days(7);

        let active_sessions = session::count_active(&self.pool, server).await?;
        let online_identities = session::count_online_identities(&self.pool, server).await?;
        let known_identities = identity::count_known(&self.pool, server).await?;
        let sessions_today =
            session::count_connected_since(&self.pool, server, today_start).await?;
        let sessions_this_week =
            session::count_connected_since(&self.pool, server, week_start).await?;
        let bytes_today = traffic::totals_since(&self.pool, server, today_start).await?;
        let bytes_total = identity::totals(&self.pool, server).await?;

        Ok(Summary {
            active_sessions,
            online_identities,
            known_identities,
            sessions_today,
            sessions_this_week,
            bytes_today,
            bytes_total,
        })
    }
}

fn window_start(now: DateTime<Utc>, window: Duration) -> Result<DateTime<Utc>> {
    let span = chrono::Duration::from_std(window).context("chart window out of range")?;
    Ok(now - span)
}

fn origin_matches(sample: &TrafficSample, origin: &str) -> bool {
    match (sample.origin_addr.as_deref(), sample.origin_port.as_deref()) {
        (Some(addr), Some(port)) => format!("{addr}:{port}") == origin,
        _ => false,
    }
}
