use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stream_common::health::HealthHandle;
use stream_common::logfile::append_line;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::membership::MembershipStore;
use crate::metrics_consts::{METRICS_LOG_FAILURES, MEMBERSHIP_SIZE};
use crate::stats::{ConsumerStats, MetricsSnapshot};

/// Appends a snapshot of the consumer counters to the metrics log on an interval.
///
/// Reporting never fails: a snapshot that cannot be written is logged and dropped.
pub struct MetricsReporter {
    stats: Arc<ConsumerStats>,
    store: Arc<dyn MembershipStore>,
    path: PathBuf,
    interval: Duration,
    error_rate_warn_threshold: f64,
    liveness: Option<HealthHandle>,
}

impl MetricsReporter {
    pub fn new(
        stats: Arc<ConsumerStats>,
        store: Arc<dyn MembershipStore>,
        path: impl Into<PathBuf>,
        interval: Duration,
        error_rate_warn_threshold: f64,
    ) -> Self {
        Self {
            stats,
            store,
            path: path.into(),
            interval,
            error_rate_warn_threshold,
            liveness: None,
        }
    }

    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub async fn report_once(&self) -> MetricsSnapshot {
        let snapshot = self.stats.snapshot(self.store.len().await);
        metrics::gauge!(MEMBERSHIP_SIZE).set(snapshot.membership_size as f64);

        info!(
            processed = snapshot.processed,
            deduped = snapshot.deduped,
            errors = snapshot.errors,
            rate = snapshot.rate,
            avg_latency_ms = snapshot.avg_latency_ms,
            membership_size = snapshot.membership_size,
            "consumer progress"
        );
        if snapshot.error_rate > self.error_rate_warn_threshold {
            warn!(
                error_rate = snapshot.error_rate,
                threshold = self.error_rate_warn_threshold,
                "error rate above threshold"
            );
        }

        match serde_json::to_string(&snapshot) {
            Ok(line) => {
                if let Err(e) = append_line(&self.path, &line).await {
                    metrics::counter!(METRICS_LOG_FAILURES).increment(1);
                    warn!(path = %self.path.display(), error = %e, "failed to write metrics snapshot");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize metrics snapshot"),
        }

        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
        snapshot
    }

    /// Report every interval until `cancel` fires, then write one final snapshot.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.report_once().await;
                }
            }
        }

        self.report_once().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::InMemoryMembership;

    #[tokio::test]
    async fn test_snapshots_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("consumer_metrics.jsonl");
        let stats = Arc::new(ConsumerStats::new());
        stats.record_deduped();
        stats.record_error("parse");

        let reporter = MetricsReporter::new(
            stats,
            Arc::new(InMemoryMembership::new(10, 0.2)),
            &path,
            Duration::from_millis(10),
            0.01,
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn(reporter.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let snapshots: Vec<MetricsSnapshot> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert!(snapshots.len() >= 2);
        let last = snapshots.last().unwrap();
        assert_eq!(last.deduped, 1);
        assert_eq!(last.errors, 1);
        assert_eq!(last.error_rate, 1.0);
    }

    #[tokio::test]
    async fn test_unwritable_metrics_log_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every append fail
        let path = dir.path().join("metrics.jsonl");
        tokio::fs::create_dir(&path).await.unwrap();

        let reporter = MetricsReporter::new(
            Arc::new(ConsumerStats::new()),
            Arc::new(InMemoryMembership::new(10, 0.2)),
            &path,
            Duration::from_secs(10),
            0.01,
        );

        let snapshot = reporter.report_once().await;
        assert_eq!(snapshot.processed, 0);
    }
}
