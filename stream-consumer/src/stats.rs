use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::metrics_consts::{RECORDS_DEDUPED, RECORDS_ERRORED, RECORDS_PROCESSED, RECORD_LATENCY};
use crate::normalize::NormalizedRecord;

/// Per-record latencies kept for the rolling average.
const LATENCY_WINDOW: usize = 1000;

/// Distinct record types tallied by name. Later types share `OTHER_TYPES`.
const MAX_TRACKED_TYPES: usize = 64;
const OTHER_TYPES: &str = "other";

#[derive(Default)]
struct Tallies {
    latencies: VecDeque<Duration>,
    by_type: BTreeMap<String, u64>,
    bots: u64,
    bytes_added: u64,
    bytes_removed: u64,
}

/// Counters of one consumer process, shared by the normalizer(s) and the reporter.
pub struct ConsumerStats {
    started: Instant,
    processed: AtomicU64,
    deduped: AtomicU64,
    errors: AtomicU64,
    tallies: Mutex<Tallies>,
}

/// One line of the metrics log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: String,
    pub processed: u64,
    pub deduped: u64,
    pub errors: u64,
    /// Records processed per second since start.
    pub rate: f64,
    pub dedup_rate: f64,
    pub error_rate: f64,
    pub avg_latency_ms: f64,
    pub membership_size: usize,
    pub by_type: BTreeMap<String, u64>,
    pub bots: u64,
    pub bytes_added: u64,
    pub bytes_removed: u64,
}

impl Default for ConsumerStats {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            processed: AtomicU64::new(0),
            deduped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            tallies: Mutex::new(Tallies::default()),
        }
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn deduped(&self) -> u64 {
        self.deduped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn record_processed(&self, record: &NormalizedRecord, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RECORDS_PROCESSED).increment(1);
        metrics::histogram!(RECORD_LATENCY).record(latency.as_secs_f64());

        let Ok(mut tallies) = self.tallies.lock() else {
            warn!("poisoned stats lock, dropping business counters");
            return;
        };

        if tallies.latencies.len() == LATENCY_WINDOW {
            tallies.latencies.pop_front();
        }
        tallies.latencies.push_back(latency);

        let kind = if tallies.by_type.contains_key(&record.kind)
            || tallies.by_type.len() < MAX_TRACKED_TYPES
        {
            record.kind.as_str()
        } else {
            OTHER_TYPES
        };
        *tallies.by_type.entry(kind.to_owned()).or_default() += 1;
        if record.bot == Some(true) {
            tallies.bots += 1;
        }
        match record.delta {
            Some(delta) if delta > 0 => tallies.bytes_added += delta.unsigned_abs(),
            Some(delta) if delta < 0 => tallies.bytes_removed += delta.unsigned_abs(),
            _ => {}
        }
    }

    pub fn record_deduped(&self) {
        self.deduped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RECORDS_DEDUPED).increment(1);
    }

    pub fn record_error(&self, reason: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(RECORDS_ERRORED, "reason" => reason).increment(1);
    }

    pub fn snapshot(&self, membership_size: usize) -> MetricsSnapshot {
        let processed = self.processed();
        let deduped = self.deduped();
        let errors = self.errors();
        let elapsed = self.started.elapsed().as_secs_f64();

        let mut snapshot = MetricsSnapshot {
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            processed,
            deduped,
            errors,
            rate: if elapsed > 0.0 {
                processed as f64 / elapsed
            } else {
                0.0
            },
            dedup_rate: deduped as f64 / processed.max(1) as f64,
            error_rate: errors as f64 / (processed + errors).max(1) as f64,
            avg_latency_ms: 0.0,
            membership_size,
            by_type: BTreeMap::new(),
            bots: 0,
            bytes_added: 0,
            bytes_removed: 0,
        };

        if let Ok(tallies) = self.tallies.lock() {
            if !tallies.latencies.is_empty() {
                let total: Duration = tallies.latencies.iter().sum();
                snapshot.avg_latency_ms =
                    total.as_secs_f64() * 1000.0 / tallies.latencies.len() as f64;
            }
            snapshot.by_type = tallies.by_type.clone();
            snapshot.bots = tallies.bots;
            snapshot.bytes_added = tallies.bytes_added;
            snapshot.bytes_removed = tallies.bytes_removed;
        }

        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(kind: &str, bot: bool, delta: Option<i64>) -> NormalizedRecord {
        NormalizedRecord {
            key: "k".to_owned(),
            kind: kind.to_owned(),
            timestamp: "2024-01-01T00:00:00Z".to_owned(),
            user: None,
            title: None,
            wiki: None,
            namespace: None,
            comment: None,
            page_key: None,
            bot: Some(bot),
            minor: None,
            len_old: None,
            len_new: None,
            delta,
            processed_at: "2024-01-01T00:00:00Z".to_owned(),
        }
    }

    #[test]
    fn test_empty_snapshot_has_no_division_by_zero() {
        let snapshot = ConsumerStats::new().snapshot(0);

        assert_eq!(snapshot.processed, 0);
        assert_eq!(snapshot.dedup_rate, 0.0);
        assert_eq!(snapshot.error_rate, 0.0);
        assert_eq!(snapshot.avg_latency_ms, 0.0);
    }

    #[test]
    fn test_snapshot_rates_and_business_counters() {
        let stats = ConsumerStats::new();
        stats.record_processed(&record("edit", true, Some(5)), Duration::from_millis(2));
        stats.record_processed(&record("edit", false, Some(-3)), Duration::from_millis(4));
        stats.record_processed(&record("new", false, None), Duration::from_millis(6));
        stats.record_deduped();
        stats.record_error("parse");

        let snapshot = stats.snapshot(3);

        assert_eq!(snapshot.processed, 3);
        assert_eq!(snapshot.deduped, 1);
        assert_eq!(snapshot.errors, 1);
        assert!((snapshot.dedup_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((snapshot.error_rate - 0.25).abs() < 1e-9);
        assert!((snapshot.avg_latency_ms - 4.0).abs() < 1e-6);
        assert_eq!(snapshot.membership_size, 3);
        assert_eq!(snapshot.by_type.get("edit"), Some(&2));
        assert_eq!(snapshot.by_type.get("new"), Some(&1));
        assert_eq!(snapshot.bots, 1);
        assert_eq!(snapshot.bytes_added, 5);
        assert_eq!(snapshot.bytes_removed, 3);
    }

    #[test]
    fn test_latency_average_only_covers_recent_records() {
        let stats = ConsumerStats::new();
        for _ in 0..LATENCY_WINDOW {
            stats.record_processed(&record("edit", false, None), Duration::from_millis(100));
        }
        for _ in 0..LATENCY_WINDOW {
            stats.record_processed(&record("edit", false, None), Duration::from_millis(1));
        }

        assert!((stats.snapshot(0).avg_latency_ms - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_distinct_types_are_capped() {
        let stats = ConsumerStats::new();
        for i in 0..MAX_TRACKED_TYPES + 10 {
            stats.record_processed(&record(&format!("t{i}"), false, None), Duration::ZERO);
        }
        stats.record_processed(&record("t0", false, None), Duration::ZERO);

        let by_type = stats.snapshot(0).by_type;
        assert!(by_type.len() <= MAX_TRACKED_TYPES + 1);
        assert_eq!(by_type.get("t0"), Some(&2));
        assert_eq!(by_type.get(OTHER_TYPES), Some(&10));
        assert_eq!(by_type.values().sum::<u64>(), MAX_TRACKED_TYPES as u64 + 11);
    }
}
