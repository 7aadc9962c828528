use std::hash::Hasher;

use siphasher::sip::SipHasher13;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::error::ConsumerError;
use crate::normalizer::{Normalizer, Prepared};

/// Normalization spread over several tasks.
///
/// Records are routed by key hash, so every record with a given key goes through the
/// same worker and keeps its arrival order. Each worker has a bounded queue; routing
/// waits while the target queue is full.
pub struct WorkerPool {
    senders: Vec<mpsc::Sender<Prepared>>,
    workers: JoinSet<Result<(), ConsumerError>>,
}

impl WorkerPool {
    pub fn start(normalizer: Normalizer, workers: usize, queue_capacity: usize) -> Self {
        let workers_count = workers.max(1);
        let capacity = (queue_capacity / workers_count).max(1);

        let mut senders = Vec::with_capacity(workers_count);
        let mut workers = JoinSet::new();

        for id in 0..workers_count {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            workers.spawn(work(id, normalizer.clone(), rx));
        }

        info!(workers = workers_count, capacity, "started normalization workers");
        Self { senders, workers }
    }

    fn route(&self, prepared: &Prepared) -> usize {
        let mut hasher = SipHasher13::new_with_keys(0, 0);
        hasher.write(prepared.key.as_str().as_bytes());
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue a record for its worker, waiting for room.
    pub async fn dispatch(&mut self, prepared: Prepared) -> Result<(), ConsumerError> {
        let worker = self.route(&prepared);
        if self.senders[worker].send(prepared).await.is_err() {
            // The worker exited, which only happens on a fatal error
            return Err(self.collect_failure().await);
        }
        Ok(())
    }

    /// Resolves when a worker stops while the queues are still open, which only a fatal
    /// error or a panic causes. The remaining workers are drained first.
    pub async fn stopped(&mut self) -> ConsumerError {
        let error = match self.workers.join_next().await {
            Some(Ok(Err(e))) => e,
            Some(Err(e)) => {
                error!(error = %e, "normalization worker panicked");
                ConsumerError::WorkerLost
            }
            Some(Ok(Ok(()))) | None => ConsumerError::WorkerLost,
        };
        self.senders.clear();
        while self.workers.join_next().await.is_some() {}

        error
    }

    /// Close the queues and wait for the workers to drain them.
    pub async fn shutdown(mut self) -> Result<(), ConsumerError> {
        self.senders.clear();

        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(result) => result?,
                Err(e) => {
                    error!(error = %e, "normalization worker panicked");
                    return Err(ConsumerError::WorkerLost);
                }
            }
        }
        Ok(())
    }

    async fn collect_failure(&mut self) -> ConsumerError {
        self.senders.clear();

        while let Some(joined) = self.workers.join_next().await {
            match joined {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => return e,
                Err(e) => {
                    error!(error = %e, "normalization worker panicked");
                    return ConsumerError::WorkerLost;
                }
            }
        }
        ConsumerError::WorkerLost
    }
}

async fn work(
    id: usize,
    normalizer: Normalizer,
    mut records: mpsc::Receiver<Prepared>,
) -> Result<(), ConsumerError> {
    while let Some(prepared) = records.recv().await {
        if let Err(e) = normalizer.admit(prepared).await {
            error!(worker = id, error = %e, "normalization worker stopping");
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::membership::InMemoryMembership;
    use crate::sink::MemorySink;
    use crate::stats::ConsumerStats;

    #[tokio::test]
    async fn test_pool_dedups_across_workers_and_keeps_per_key_order() {
        let sink = Arc::new(MemorySink::new());
        let stats = Arc::new(ConsumerStats::new());
        let normalizer = Normalizer::new(
            Arc::new(InMemoryMembership::new(10_000, 0.2)),
            sink.clone(),
            stats.clone(),
        );

        let mut pool = WorkerPool::start(normalizer.clone(), 4, 8);
        for round in 0..3 {
            for id in 0..50 {
                let line = format!(r#"{{"id": {id}, "type": "round-{round}"}}"#);
                pool.dispatch(normalizer.prepare(&line).unwrap())
                    .await
                    .unwrap();
            }
        }
        pool.shutdown().await.unwrap();

        let records = sink.records();
        assert_eq!(records.len(), 50);
        // The first occurrence of every key wins
        assert!(records.iter().all(|r| r.kind == "round-0"));
        assert_eq!(stats.processed(), 50);
        assert_eq!(stats.deduped(), 100);
    }

    #[tokio::test]
    async fn test_stopped_reports_worker_failure() {
        let normalizer = Normalizer::new(
            Arc::new(InMemoryMembership::new(10_000, 0.2)),
            Arc::new(MemorySink::full()),
            Arc::new(ConsumerStats::new()),
        );

        let mut pool = WorkerPool::start(normalizer.clone(), 2, 8);
        pool.dispatch(normalizer.prepare(r#"{"id": 1}"#).unwrap())
            .await
            .unwrap();

        let error = tokio::time::timeout(std::time::Duration::from_secs(5), pool.stopped())
            .await
            .unwrap();
        assert!(matches!(error, ConsumerError::OutputWrite(_)));
    }
}
