use std::sync::Mutex;

use async_trait::async_trait;
use stream_common::logfile::RotatingLogWriter;
use tokio::sync;

use crate::error::ConsumerError;
use crate::normalize::NormalizedRecord;

#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist one record. An error here is fatal for the consumer.
    async fn write(&self, record: &NormalizedRecord) -> Result<(), ConsumerError>;
    async fn flush(&self) -> Result<(), ConsumerError>;
}

/// Appends records to the rotating output log, one compact JSON object per line.
pub struct LogSink {
    writer: sync::Mutex<RotatingLogWriter>,
    retries: u32,
}

impl LogSink {
    pub fn new(writer: RotatingLogWriter, retries: u32) -> Self {
        Self {
            writer: sync::Mutex::new(writer),
            retries,
        }
    }
}

#[async_trait]
impl RecordSink for LogSink {
    async fn write(&self, record: &NormalizedRecord) -> Result<(), ConsumerError> {
        let line = serde_json::to_string(record)
            .map_err(|e| ConsumerError::OutputWrite(std::io::Error::other(e)))?;

        self.writer
            .lock()
            .await
            .append_with_retries(&line, self.retries)
            .await
            .map_err(ConsumerError::OutputWrite)
    }

    async fn flush(&self) -> Result<(), ConsumerError> {
        self.writer
            .lock()
            .await
            .flush()
            .await
            .map_err(ConsumerError::OutputWrite)
    }
}

/// Keeps records in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<NormalizedRecord>>,
    full: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// A sink whose every write fails, like a log on a full disk.
    pub fn full() -> Self {
        Self {
            full: true,
            ..Default::default()
        }
    }

    pub fn records(&self) -> Vec<NormalizedRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn write(&self, record: &NormalizedRecord) -> Result<(), ConsumerError> {
        if self.full {
            return Err(ConsumerError::OutputWrite(std::io::Error::other(
                "no space left on device",
            )));
        }
        self.records
            .lock()
            .map_err(|_| {
                ConsumerError::OutputWrite(std::io::Error::other("poisoned memory sink lock"))
            })?
            .push(record.clone());
        Ok(())
    }

    async fn flush(&self) -> Result<(), ConsumerError> {
        Ok(())
    }
}
