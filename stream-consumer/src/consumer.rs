use tracing::info;

use crate::error::ConsumerError;
use crate::normalizer::Normalizer;
use crate::pool::WorkerPool;
use crate::tailer::LogTailer;

/// Drives tailed lines through normalization until the tailer stops.
pub struct Consumer {
    tailer: LogTailer,
    normalizer: Normalizer,
    workers: usize,
    queue_capacity: usize,
}

impl Consumer {
    pub fn new(tailer: LogTailer, normalizer: Normalizer) -> Self {
        Self {
            tailer,
            normalizer,
            workers: 1,
            queue_capacity: 10_000,
        }
    }

    /// Normalize on `workers` tasks instead of inline. Only worthwhile with more than one.
    pub fn with_workers(mut self, workers: usize, queue_capacity: usize) -> Self {
        self.workers = workers.max(1);
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    /// Returns once the tailer is cancelled and every accepted record is written and
    /// flushed, or on the first fatal error.
    pub async fn run(mut self) -> Result<(), ConsumerError> {
        let result = if self.workers > 1 {
            self.run_pool().await
        } else {
            self.run_inline().await
        };

        // Records already written are flushed even when stopping on an error
        let flushed = self.normalizer.flush().await;
        result.and(flushed)?;

        let stats = self.normalizer.stats();
        info!(
            processed = stats.processed(),
            deduped = stats.deduped(),
            errors = stats.errors(),
            "consumer stopped"
        );
        Ok(())
    }

    async fn run_inline(&mut self) -> Result<(), ConsumerError> {
        while let Some(line) = self.tailer.next_line().await {
            match line {
                Ok(line) => {
                    self.normalizer.process_line(&line).await?;
                }
                Err(e) => self.normalizer.reject(e.into()),
            }
        }
        Ok(())
    }

    async fn run_pool(&mut self) -> Result<(), ConsumerError> {
        let mut pool = WorkerPool::start(self.normalizer.clone(), self.workers, self.queue_capacity);

        loop {
            tokio::select! {
                line = self.tailer.next_line() => match line {
                    Some(Ok(line)) => {
                        if let Some(prepared) = self.normalizer.prepare(&line) {
                            pool.dispatch(prepared).await?;
                        }
                    }
                    Some(Err(e)) => self.normalizer.reject(e.into()),
                    None => break,
                },
                // A failed worker ends the run even while no input arrives
                error = pool.stopped() => return Err(error),
            }
        }

        pool.shutdown().await
    }
}
