use stream_common::backoff::BackoffPolicy;
use stream_common::health::HealthHandle;
use stream_common::logfile::RotatingLogWriter;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::client::StreamClient;
use crate::error::{ConnectionError, ReaderError};
use crate::frame::FrameReader;
use crate::metrics_consts::{CONNECTION_ERRORS, FRAMES_RECEIVED, RAW_BYTES_WRITTEN, RECONNECTS};
use crate::record::RawRecord;

/// Pulls frames from the stream and appends them to the raw log, reconnecting forever.
///
/// The id of a frame only becomes the resumption point once the frame is on disk, so a
/// reconnect after a crash mid-write asks the server for that frame again.
pub struct StreamReader {
    client: StreamClient,
    writer: RotatingLogWriter,
    backoff: BackoffPolicy,
    /// Immediate retries of a failed raw append before giving up.
    write_retries: u32,
    progress_log_every: u64,
    liveness: HealthHandle,
    last_event_id: Option<String>,
    frames_written: u64,
    /// Connection failures since the last successful connect. Drives the backoff.
    failures: u32,
}

impl StreamReader {
    pub fn new(
        client: StreamClient,
        writer: RotatingLogWriter,
        backoff: BackoffPolicy,
        write_retries: u32,
        progress_log_every: u64,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            client,
            writer,
            backoff,
            write_retries,
            progress_log_every: progress_log_every.max(1),
            liveness,
            last_event_id: None,
            frames_written: 0,
            failures: 0,
        }
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Run until `cancel` fires. Connection failures are retried with backoff; only a raw
    /// log that cannot be written to ends the loop with an error.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<(), ReaderError> {
        while !cancel.is_cancelled() {
            self.liveness.report_healthy();

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = self.client.connect(self.last_event_id.as_deref()) => connected,
            };

            let disconnect = match connected {
                Ok(mut frames) => {
                    info!(
                        url = %self.client.url(),
                        last_event_id = self.last_event_id.as_deref().unwrap_or("none"),
                        "connected to stream"
                    );
                    self.failures = 0;

                    match self.pump(&mut frames, &cancel).await {
                        Ok(Some(disconnect)) => disconnect,
                        Ok(None) => break,
                        Err(e) => {
                            error!(error = %e, "giving up on the raw log");
                            if let Err(flush) = self.writer.flush().await {
                                warn!(error = %flush, "failed to flush raw log");
                            }
                            return Err(e);
                        }
                    }
                }
                Err(e) => e,
            };

            let delay = self.backoff.next_delay(self.failures);
            self.failures = self.failures.saturating_add(1);

            metrics::counter!(CONNECTION_ERRORS, "cause" => cause(&disconnect)).increment(1);
            metrics::counter!(RECONNECTS).increment(1);
            warn!(
                error = %disconnect,
                failures = self.failures,
                delay_ms = delay.as_millis() as u64,
                "stream disconnected, reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.writer.flush().await.map_err(ReaderError::RawWrite)?;
        info!(
            frames = self.frames_written,
            last_event_id = self.last_event_id.as_deref().unwrap_or("none"),
            "stream reader stopped"
        );
        Ok(())
    }

    /// Persist frames until the connection fails or `cancel` fires. Returns the connection
    /// failure, or `None` on cancellation.
    async fn pump(
        &mut self,
        frames: &mut FrameReader,
        cancel: &CancellationToken,
    ) -> Result<Option<ConnectionError>, ReaderError> {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                frame = frames.next_frame() => frame,
            };

            match frame {
                Ok(frame) => self.persist(RawRecord::from(frame)).await?,
                Err(e) => return Ok(Some(e)),
            }
        }
    }

    async fn persist(&mut self, record: RawRecord) -> Result<(), ReaderError> {
        let line = record.log_line();
        self.writer
            .append_with_retries(&line, self.write_retries)
            .await
            .map_err(ReaderError::RawWrite)?;

        metrics::counter!(FRAMES_RECEIVED).increment(1);
        metrics::counter!(RAW_BYTES_WRITTEN).increment(line.len() as u64 + 1);
        self.liveness.report_healthy();

        if let Some(id) = record.id {
            self.last_event_id = Some(id);
        }

        self.frames_written += 1;
        if self.frames_written % self.progress_log_every == 0 {
            info!(
                frames = self.frames_written,
                path = %self.writer.path().display(),
                "stream progress"
            );
        }
        Ok(())
    }
}

fn cause(error: &ConnectionError) -> &'static str {
    match error {
        ConnectionError::Request(_) => "request",
        ConnectionError::ResponseTimeout(_) => "response_timeout",
        ConnectionError::BadStatus(_) => "status",
        ConnectionError::BadContentType(_) => "content_type",
        ConnectionError::Stream(_) => "body",
        ConnectionError::Stalled(_) => "stalled",
        ConnectionError::Closed => "closed",
    }
}
