//! Follows one logical log made of rotated files.
//!
//! The tailer never trusts a handle shared with the writer: it re-derives the active
//! file from the directory listing. A rotation is only acted on once the old file has
//! stopped growing, and the tailer moves to the file that directly follows the one it
//! was reading, so a burst of rotations cannot make it skip a file.
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use futures::Stream;
use stream_common::health::HealthHandle;
use stream_common::logfile;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ParseError, TailError};
use crate::metrics_consts::{TAIL_BYTES_READ, TAIL_FILE_SWITCHES, TAIL_TRUNCATIONS};

/// Upper bound of a single read.
const READ_CHUNK: u64 = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    /// Looking for the file to read next.
    Resolving,
    /// Reading from the cursor.
    Following,
    /// At end of file, polling for growth.
    AwaitingData { empty_polls: u32 },
    /// Cancelled. Terminal.
    Stopped,
}

/// Position in the logical log. Only held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamCursor {
    pub path: PathBuf,
    pub offset: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct TailerOptions {
    pub poll_interval: Duration,
    /// Consecutive empty polls at end of file before checking for a rotation.
    pub empty_polls_before_resolve: u32,
    /// Wait before re-resolving when the expected file does not exist.
    pub missing_file_delay: Duration,
}

impl Default for TailerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            empty_polls_before_resolve: 10,
            missing_file_delay: Duration::from_millis(200),
        }
    }
}

enum Growth {
    Grew(u64),
    Unchanged,
    Truncated(u64),
}

pub struct LogTailer {
    dir: PathBuf,
    prefix: String,
    options: TailerOptions,
    cancel: CancellationToken,
    liveness: Option<HealthHandle>,
    state: TailState,
    cursor: Option<StreamCursor>,
    file: Option<fs::File>,
    /// Bytes after the last line terminator seen.
    partial: Vec<u8>,
    lines: VecDeque<Result<String, ParseError>>,
}

impl LogTailer {
    /// A tailer that starts at offset 0 of the newest file matching `prefix` in `dir`.
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: &str,
        options: TailerOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.to_owned(),
            options,
            cancel,
            liveness: None,
            state: TailState::Resolving,
            cursor: None,
            file: None,
            partial: Vec::new(),
            lines: VecDeque::new(),
        }
    }

    /// Report healthy on every poll cycle.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    pub fn cursor(&self) -> Option<&StreamCursor> {
        self.cursor.as_ref()
    }

    /// The next complete line, or `None` once cancelled. A line that is not valid UTF-8
    /// is yielded as an error so that it is counted rather than repaired.
    pub async fn next_line(&mut self) -> Option<Result<String, ParseError>> {
        loop {
            if self.cancel.is_cancelled() {
                self.stop();
            }
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }

            let state = self.state;
            match state {
                TailState::Stopped => return None,
                _ if !self.lines.is_empty() => return self.lines.pop_front(),
                TailState::Resolving => self.resolve().await,
                TailState::Following => self.follow().await,
                TailState::AwaitingData { empty_polls } => self.await_data(empty_polls).await,
            }
        }
    }

    /// The lines as a stream, ending on cancellation.
    pub fn into_stream(self) -> impl Stream<Item = Result<String, ParseError>> {
        futures::stream::unfold(self, |mut tailer| async move {
            let line = tailer.next_line().await?;
            Some((line, tailer))
        })
    }

    fn stop(&mut self) {
        if self.state != TailState::Stopped {
            if let Some(cursor) = &self.cursor {
                info!(path = %cursor.path.display(), offset = cursor.offset, "tailer stopped");
            }
            self.state = TailState::Stopped;
            self.file = None;
            self.lines.clear();
        }
    }

    /// Sleep, waking early on cancellation.
    async fn pause(&mut self, duration: Duration) {
        tokio::select! {
            _ = self.cancel.cancelled() => self.stop(),
            _ = tokio::time::sleep(duration) => {}
        }
    }

    async fn resolve(&mut self) {
        match self.next_file().await {
            Ok(Some(path)) => self.open(path),
            Ok(None) => self.state = TailState::Following,
            Err(TailError::RotationRace(path)) => {
                debug!(path = %path.display(), "log file not there yet");
                self.pause(self.options.missing_file_delay).await;
            }
            Err(e) => {
                warn!(error = %e, "failed to resolve log file");
                self.pause(self.options.missing_file_delay).await;
            }
        }
    }

    /// The file to move to, or `None` to keep following the current one.
    async fn next_file(&self) -> Result<Option<PathBuf>, TailError> {
        let listing = |source| TailError::Io {
            path: self.dir.clone(),
            source,
        };

        let Some(cursor) = &self.cursor else {
            let latest = logfile::resolve_latest(&self.dir, &self.prefix)
                .await
                .map_err(listing)?;
            return match fs::metadata(&latest).await {
                Ok(_) => Ok(Some(latest)),
                Err(_) => Err(TailError::RotationRace(latest)),
            };
        };

        let files = logfile::all_files(&self.dir, &self.prefix)
            .await
            .map_err(listing)?;
        let next = match files.iter().position(|path| *path == cursor.path) {
            Some(i) => files.get(i + 1).cloned(),
            // The file we were reading is gone: pick up wherever the writer is now
            None => files.last().cloned(),
        };

        let Some(next) = next else {
            return match fs::metadata(&cursor.path).await {
                Ok(_) => Ok(None),
                Err(_) => Err(TailError::RotationRace(cursor.path.clone())),
            };
        };

        // Only leave the old file once it has stopped growing
        if let Ok(Growth::Grew(_)) = self.growth().await {
            return Ok(None);
        }
        Ok(Some(next))
    }

    fn open(&mut self, path: PathBuf) {
        if let Some(previous) = &self.cursor {
            if previous.path == path {
                self.state = TailState::Following;
                return;
            }
            if !self.partial.is_empty() {
                warn!(
                    path = %previous.path.display(),
                    bytes = self.partial.len(),
                    "dropping unterminated line at end of rotated file"
                );
            }
            info!(from = %previous.path.display(), to = %path.display(), "following rotated log file");
            metrics::counter!(TAIL_FILE_SWITCHES).increment(1);
        } else {
            info!(path = %path.display(), "tailing log file");
        }

        self.partial.clear();
        self.file = None;
        self.cursor = Some(StreamCursor { path, offset: 0 });
        self.state = TailState::Following;
    }

    async fn follow(&mut self) {
        match self.growth().await {
            Ok(Growth::Grew(size)) => {
                if let Err(e) = self.read_to(size).await {
                    self.recover(e).await;
                }
            }
            Ok(Growth::Unchanged) => self.state = TailState::AwaitingData { empty_polls: 0 },
            Ok(Growth::Truncated(size)) => self.restart(size),
            Err(e) => self.recover(e).await,
        }
    }

    async fn await_data(&mut self, empty_polls: u32) {
        self.pause(self.options.poll_interval).await;
        if self.state == TailState::Stopped {
            return;
        }

        match self.growth().await {
            Ok(Growth::Grew(_)) => self.state = TailState::Following,
            Ok(Growth::Truncated(size)) => self.restart(size),
            Ok(Growth::Unchanged) => {
                let empty_polls = empty_polls + 1;
                self.state = if empty_polls >= self.options.empty_polls_before_resolve {
                    TailState::Resolving
                } else {
                    TailState::AwaitingData { empty_polls }
                };
            }
            Err(e) => self.recover(e).await,
        }
    }

    /// Compare the size of the current file with the cursor.
    async fn growth(&self) -> Result<Growth, TailError> {
        let Some(cursor) = &self.cursor else {
            return Ok(Growth::Unchanged);
        };

        let size = match fs::metadata(&cursor.path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TailError::RotationRace(cursor.path.clone()))
            }
            Err(source) => {
                return Err(TailError::Io {
                    path: cursor.path.clone(),
                    source,
                })
            }
        };

        Ok(match size.cmp(&cursor.offset) {
            std::cmp::Ordering::Greater => Growth::Grew(size),
            std::cmp::Ordering::Equal => Growth::Unchanged,
            std::cmp::Ordering::Less => Growth::Truncated(size),
        })
    }

    /// The file shrank below the cursor: it was truncated or replaced. Start it over.
    fn restart(&mut self, size: u64) {
        if let Some(cursor) = &mut self.cursor {
            warn!(
                path = %cursor.path.display(),
                offset = cursor.offset,
                size,
                "log file truncated, reading it again from the start"
            );
            cursor.offset = 0;
        }
        metrics::counter!(TAIL_TRUNCATIONS).increment(1);

        self.partial.clear();
        self.file = None;
        self.state = TailState::Resolving;
    }

    async fn recover(&mut self, error: TailError) {
        match &error {
            TailError::RotationRace(path) => {
                debug!(path = %path.display(), "log file disappeared, re-resolving")
            }
            TailError::Io { .. } => warn!(error = %error, "failed to read log file, re-resolving"),
        }
        self.file = None;
        self.state = TailState::Resolving;
        self.pause(self.options.missing_file_delay).await;
    }

    /// Read from the cursor up to at most `size`, queueing every completed line.
    async fn read_to(&mut self, size: u64) -> Result<(), TailError> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(());
        };
        let io_error = |source| TailError::Io {
            path: cursor.path.clone(),
            source,
        };

        let file = match self.file.take() {
            Some(file) => file,
            None => {
                let mut file = match fs::File::open(&cursor.path).await {
                    Ok(file) => file,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(TailError::RotationRace(cursor.path.clone()))
                    }
                    Err(e) => return Err(io_error(e)),
                };
                file.seek(SeekFrom::Start(cursor.offset))
                    .await
                    .map_err(io_error)?;
                file
            }
        };
        let file = self.file.insert(file);

        let want = (size - cursor.offset).min(READ_CHUNK);
        let mut chunk = Vec::with_capacity(want as usize);
        let read = file
            .take(want)
            .read_to_end(&mut chunk)
            .await
            .map_err(io_error)?;

        cursor.offset += read as u64;
        metrics::counter!(TAIL_BYTES_READ).increment(read as u64);

        self.partial.extend_from_slice(&chunk);
        split_lines(&mut self.partial, &mut self.lines);
        Ok(())
    }
}

/// Move every terminated line out of `buffer`, leaving the unterminated rest.
fn split_lines(buffer: &mut Vec<u8>, lines: &mut VecDeque<Result<String, ParseError>>) {
    let Some(last) = buffer.iter().rposition(|b| *b == b'\n') else {
        return;
    };
    let rest = buffer.split_off(last + 1);

    for raw in buffer.split(|b| *b == b'\n') {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        lines.push_back(String::from_utf8(raw.to_vec()).map_err(ParseError::from));
    }

    *buffer = rest;
}
