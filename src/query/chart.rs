//! Time-bucketed chart series.
//!
//! Pure folding of ledger samples into chart points; all SQL stays in the
//! store layer. Bucket width follows the window size and is not negotiable,
//! so two clients asking for the same window always get the same series.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::collector::delta::active_delta;
use crate::status::{Counters, SessionKey};
use crate::store::traffic::TrafficSample;

/// Chart bucket granularity, derived from the window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketWidth {
    Minute,
    Hour,
    Day,
}

impl BucketWidth {
    /// Width for a chart window: minutes up to six hours, hours up to a
    /// day, days beyond that.
    pub fn for_window(window: Duration) -> Self {
        const HOUR: u64 = 60 * 60;
        let secs = window.as_secs();
        if secs <= 6 * HOUR {
            BucketWidth::Minute
        } else if secs <= 24 * HOUR {
            BucketWidth::Hour
        } else {
            BucketWidth::Day
        }
    }

    fn secs(self) -> i64 {
        match self {
            BucketWidth::Minute => 60,
            BucketWidth::Hour => 60 * 60,
            BucketWidth::Day => 24 * 60 * 60,
        }
    }

    /// Start of the bucket containing `ts`.
    ///
    /// UTC buckets align with the epoch, so plain timestamp arithmetic
    /// floors correctly for all three widths.
    pub fn truncate(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp();
        let floored = secs - secs.rem_euclid(self.secs());
        DateTime::<Utc>::from_timestamp(floored, 0).unwrap_or(ts)
    }

    /// Display label for one bucket start.
    pub fn label(self, bucket: DateTime<Utc>) -> String {
        match self {
            BucketWidth::Minute => bucket.format("%Y-%m-%d %H:%M").to_string(),
            BucketWidth::Hour => bucket.format("%Y-%m-%d %H:00").to_string(),
            BucketWidth::Day => bucket.format("%Y-%m-%d").to_string(),
        }
    }
}

/// One server-view chart bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChartPoint {
    pub bucket: DateTime<Utc>,
    pub label: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub active_identities: u64,
}

#[derive(Debug, Default)]
struct BucketGroup {
    bytes_in: u64,
    bytes_out: u64,
    identity_sum: u64,
    cycles: u64,
}

/// Folds per-server aggregate samples into ascending chart points.
///
/// Within one (bucket, server) group the byte deltas sum and the concurrent
/// identity count is the integer mean over that server's cycles; across
/// servers sharing a bucket the means add up. Buckets nothing fell into are
/// omitted.
pub fn bucket_aggregates(samples: &[TrafficSample], width: BucketWidth) -> Vec<ChartPoint> {
    let mut groups: BTreeMap<(DateTime<Utc>, &str), BucketGroup> = BTreeMap::new();
    for sample in samples {
        let bucket = width.truncate(sample.captured_at);
        let group = groups.entry((bucket, sample.server.as_str())).or_default();
        group.bytes_in += sample.bytes_in;
        group.bytes_out += sample.bytes_out;
        group.identity_sum += u64::from(sample.active_identities);
        group.cycles += 1;
    }

    let mut merged: BTreeMap<DateTime<Utc>, (u64, u64, u64)> = BTreeMap::new();
    for ((bucket, _server), group) in groups {
        let entry = merged.entry(bucket).or_default();
        entry.0 += group.bytes_in;
        entry.1 += group.bytes_out;
        entry.2 += group.identity_sum / group.cycles;
    }

    merged
        .into_iter()
        .map(|(bucket, (bytes_in, bytes_out, identities))| ChartPoint {
            bucket,
            label: width.label(bucket),
            bytes_in,
            bytes_out,
            active_identities: identities,
        })
        .collect()
}

/// One per-identity chart bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesPoint {
    pub bucket: DateTime<Utc>,
    pub label: String,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// One identity's bucketed delta series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySeries {
    pub identity: String,
    pub points: Vec<SeriesPoint>,
}

/// Rebuilds per-identity delta series from raw cumulative samples.
///
/// `seeds` supply each session key's last sample from before the window so
/// traffic already counted outside the window is not re-counted inside it;
/// a key without a seed cold-starts exactly like a live cycle would.
/// `samples` must be ordered by capture time, which the store queries
/// guarantee. Series come back sorted by identity.
pub fn bucket_identity_deltas(
    seeds: &[TrafficSample],
    samples: &[TrafficSample],
    width: BucketWidth,
) -> Vec<IdentitySeries> {
    let mut prior: HashMap<SessionKey, Counters> = HashMap::new();
    for seed in seeds {
        if let Some(key) = seed.key() {
            prior.insert(key, seed.counters());
        }
    }

    let mut series: BTreeMap<String, BTreeMap<DateTime<Utc>, Counters>> = BTreeMap::new();
    for sample in samples {
        let Some(key) = sample.key() else { continue };
        let outcome = active_delta(prior.get(&key).copied(), sample.counters());
        let bucket = width.truncate(sample.captured_at);

        let buckets = series.entry(key.identity.clone()).or_default();
        let point = buckets.entry(bucket).or_default();
        point.bytes_in += outcome.delta.bytes_in;
        point.bytes_out += outcome.delta.bytes_out;

        prior.insert(key, sample.counters());
    }

    series
        .into_iter()
        .map(|(identity, buckets)| IdentitySeries {
            identity,
            points: buckets
                .into_iter()
                .map(|(bucket, delta)| SeriesPoint {
                    bucket,
                    label: width.label(bucket),
                    bytes_in: delta.bytes_in,
                    bytes_out: delta.bytes_out,
                })
                .collect(),
        })
        .collect()
}
