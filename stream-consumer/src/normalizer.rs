use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, error, warn};

use crate::error::{ConsumerError, RecordError};
use crate::key::{derive_key, DedupKey};
use crate::membership::MembershipStore;
use crate::metrics_consts::MEMBERSHIP_RETRIES;
use crate::normalize::{normalize, parse_line, NormalizedRecord};
use crate::sink::RecordSink;
use crate::stats::ConsumerStats;

/// A parsed line with its key, ready for the membership check.
#[derive(Debug)]
pub struct Prepared {
    pub key: DedupKey,
    pub fields: Map<String, Value>,
    /// When the line left the tailer, for latency.
    pub received: Instant,
}

pub fn prepare(line: &str) -> Result<Prepared, RecordError> {
    let received = Instant::now();
    let fields = parse_line(line)?;
    let key = derive_key(&fields)?;

    Ok(Prepared {
        key,
        fields,
        received,
    })
}

#[derive(Debug, PartialEq)]
pub enum Outcome {
    Written(NormalizedRecord),
    Duplicate,
    Rejected,
}

/// Filters duplicates and writes every first occurrence to the sink.
///
/// Clones share the store, the sink and the counters.
#[derive(Clone)]
pub struct Normalizer {
    store: Arc<dyn MembershipStore>,
    sink: Arc<dyn RecordSink>,
    stats: Arc<ConsumerStats>,
    store_retries: u32,
    store_retry_delay: Duration,
}

impl Normalizer {
    pub fn new(
        store: Arc<dyn MembershipStore>,
        sink: Arc<dyn RecordSink>,
        stats: Arc<ConsumerStats>,
    ) -> Self {
        Self {
            store,
            sink,
            stats,
            store_retries: 3,
            store_retry_delay: Duration::from_millis(100),
        }
    }

    /// How often, and how far apart, a failing membership check is retried before the
    /// store is declared unavailable.
    pub fn with_store_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.store_retries = retries;
        self.store_retry_delay = delay;
        self
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    pub fn store(&self) -> &Arc<dyn MembershipStore> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn RecordSink> {
        &self.sink
    }

    /// Parse and key a line. Bad lines are counted and yield `None`.
    pub fn prepare(&self, line: &str) -> Option<Prepared> {
        match prepare(line) {
            Ok(prepared) => Some(prepared),
            Err(e) => {
                self.reject(e);
                None
            }
        }
    }

    /// Count a line that never made it to a record.
    pub fn reject(&self, error: RecordError) {
        debug!(error = %error, "skipping line");
        self.stats.record_error(error.reason());
    }

    /// Run one line through the whole pipeline.
    ///
    /// Only an unavailable store or an output log that cannot be written to is an error.
    pub async fn process_line(&self, line: &str) -> Result<Outcome, ConsumerError> {
        match self.prepare(line) {
            Some(prepared) => self.admit(prepared).await,
            None => Ok(Outcome::Rejected),
        }
    }

    pub async fn admit(&self, prepared: Prepared) -> Result<Outcome, ConsumerError> {
        if !self.try_insert(&prepared.key).await? {
            self.stats.record_deduped();
            return Ok(Outcome::Duplicate);
        }

        let record = normalize(&prepared.key, &prepared.fields, Utc::now());
        if let Err(e) = self.sink.write(&record).await {
            error!(key = %prepared.key, error = %e, "failed to write record");
            self.release(&prepared.key).await;
            return Err(e);
        }

        self.stats
            .record_processed(&record, prepared.received.elapsed());
        Ok(Outcome::Written(record))
    }

    async fn try_insert(&self, key: &DedupKey) -> Result<bool, ConsumerError> {
        let mut attempt = 0;
        loop {
            match self.store.try_insert(key).await {
                Ok(inserted) => return Ok(inserted),
                Err(e) if attempt < self.store_retries => {
                    attempt += 1;
                    metrics::counter!(MEMBERSHIP_RETRIES).increment(1);
                    warn!(error = %e, attempt, "membership check failed, retrying");
                    tokio::time::sleep(self.store_retry_delay).await;
                }
                Err(source) => {
                    error!(error = %source, "membership store unavailable");
                    return Err(ConsumerError::MembershipStoreUnavailable {
                        retries: self.store_retries,
                        source,
                    });
                }
            }
        }
    }

    /// Give up the admission of a record that was never written, so it is not taken
    /// for a duplicate once the consumer restarts.
    async fn release(&self, key: &DedupKey) {
        if let Err(e) = self.store.remove(key).await {
            error!(%key, error = %e, "failed to release key of unwritten record");
        }
    }

    pub async fn flush(&self) -> Result<(), ConsumerError> {
        self.sink.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{InMemoryMembership, RedisMembership};
    use crate::redis::MockRedisClient;
    use crate::sink::MemorySink;

    fn normalizer() -> (Normalizer, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let normalizer = Normalizer::new(
            Arc::new(InMemoryMembership::new(1000, 0.2)),
            sink.clone(),
            Arc::new(ConsumerStats::new()),
        );
        (normalizer, sink)
    }

    #[tokio::test]
    async fn test_concrete_scenario() {
        let (normalizer, sink) = normalizer();

        let first = normalizer
            .process_line(r#"{"id": 42, "user": "a", "ts": 1000, "len_old": 10, "len_new": 15}"#)
            .await
            .unwrap();
        let Outcome::Written(record) = first else {
            panic!("expected a written record, got {:?}", first);
        };
        assert_eq!(record.key, "42");
        assert_eq!(record.delta, Some(5));

        let again = normalizer
            .process_line(r#"{"id": 42, "user": "a", "ts": 1000, "len_old": 10, "len_new": 15}"#)
            .await
            .unwrap();
        assert_eq!(again, Outcome::Duplicate);

        let other_payload = normalizer
            .process_line(r#"{"id": 42, "user": "b", "ts": 2000, "type": "log"}"#)
            .await
            .unwrap();
        assert_eq!(other_payload, Outcome::Duplicate);

        assert_eq!(sink.records().len(), 1);
        assert_eq!(normalizer.stats().processed(), 1);
        assert_eq!(normalizer.stats().deduped(), 2);
        assert_eq!(normalizer.stats().errors(), 0);
    }

    #[tokio::test]
    async fn test_bad_lines_are_counted_not_raised() {
        let (normalizer, sink) = normalizer();

        assert_eq!(normalizer.process_line("{oops").await.unwrap(), Outcome::Rejected);
        assert_eq!(normalizer.process_line("[1]").await.unwrap(), Outcome::Rejected);
        assert_eq!(
            normalizer.process_line(r#"{"comment": "no key"}"#).await.unwrap(),
            Outcome::Rejected
        );

        assert_eq!(normalizer.stats().errors(), 3);
        assert!(sink.records().is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_releases_key() {
        let client = MockRedisClient::new();
        let store = || {
            Arc::new(RedisMembership::new(
                client.clone(),
                "dedup:",
                Duration::from_secs(60),
            ))
        };
        let line = r#"{"id": 7, "type": "edit"}"#;

        let full = Normalizer::new(
            store(),
            Arc::new(MemorySink::full()),
            Arc::new(ConsumerStats::new()),
        );
        assert!(matches!(
            full.process_line(line).await,
            Err(ConsumerError::OutputWrite(_))
        ));
        assert_eq!(full.stats().processed(), 0);

        // A restarted consumer sharing the store still emits the record
        let sink = Arc::new(MemorySink::new());
        let restarted = Normalizer::new(store(), sink.clone(), Arc::new(ConsumerStats::new()));
        assert!(matches!(
            restarted.process_line(line).await.unwrap(),
            Outcome::Written(_)
        ));
        assert_eq!(sink.records().len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_store_is_fatal_after_retries() {
        let sink = Arc::new(MemorySink::new());
        let normalizer = Normalizer::new(
            Arc::new(RedisMembership::new(
                MockRedisClient::new().unavailable(),
                "dedup:",
                Duration::from_secs(60),
            )),
            sink.clone(),
            Arc::new(ConsumerStats::new()),
        )
        .with_store_retries(2, Duration::from_millis(1));

        let result = normalizer.process_line(r#"{"id": 1}"#).await;

        assert!(matches!(
            result,
            Err(ConsumerError::MembershipStoreUnavailable { retries: 2, .. })
        ));
        assert!(sink.records().is_empty());
    }
}
