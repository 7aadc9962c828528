//! Append-only, size-rotated JSON-lines files.
//!
//! A logical log is a directory plus a prefix. Before the first rotation lines go to
//! `<prefix>.jsonl`; each rotation starts `<prefix>-<YYYYMMDD-HHMMSS>.jsonl`, and the
//! timestamped names sort lexically in rotation order. Readers never share a handle
//! with the writer: both sides call [`resolve_latest`] to find the active file.
//!
//! Lines are written with a single `write` of `text + "\n"` on a file opened in append
//! mode. Concurrent appenders rely on the OS keeping small appends whole; there is no
//! application-level locking.
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeDelta, Utc};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::metrics_consts::LOG_ROTATIONS_TOTAL;

pub const LOG_EXTENSION: &str = "jsonl";
const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const STAMP_LEN: usize = 15;

/// The file used before any rotation happened.
pub fn base_path(dir: &Path, prefix: &str) -> PathBuf {
    dir.join(format!("{prefix}.{LOG_EXTENSION}"))
}

/// The rotated file name for a given instant, truncated to the second.
pub fn rotation_path(dir: &Path, prefix: &str, at: DateTime<Utc>) -> PathBuf {
    dir.join(format!(
        "{prefix}-{}.{LOG_EXTENSION}",
        at.format(STAMP_FORMAT)
    ))
}

/// Parse the rotation stamp out of a file name, if it is a rotated file of `prefix`.
pub fn rotation_stamp(path: &Path, prefix: &str) -> Option<NaiveDateTime> {
    let name = path.file_name()?.to_str()?;
    let stamp = name
        .strip_prefix(prefix)?
        .strip_prefix('-')?
        .strip_suffix(LOG_EXTENSION)?
        .strip_suffix('.')?;

    if stamp.len() != STAMP_LEN {
        return None;
    }
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()
}

/// Pick the path the writer should switch to when rotating away from `current`.
///
/// The result always sorts after `current` when `current` is itself a rotated file:
/// if the clock has not moved past its stamp (two rotations within a second, or a
/// clock step backwards) the stamp is advanced one second past the current one.
pub fn next_rotation_path(dir: &Path, prefix: &str, current: &Path, now: DateTime<Utc>) -> PathBuf {
    let candidate = now.naive_utc().trunc_subsecs(0);

    let stamp = match rotation_stamp(current, prefix) {
        Some(previous) if candidate <= previous => previous + TimeDelta::seconds(1),
        _ => candidate,
    };

    rotation_path(dir, prefix, stamp.and_utc())
}

/// All rotated files of `prefix` in `dir`, oldest first. A missing directory is empty.
pub async fn rotated_files(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if rotation_stamp(&path, prefix).is_some() {
            files.push(path);
        }
    }

    // YYYYMMDD-HHMMSS sorts lexically
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(files)
}

/// Every file of the logical log, in write order: the base file first, then rotations.
pub async fn all_files(dir: &Path, prefix: &str) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let base = base_path(dir, prefix);
    if fs::try_exists(&base).await? {
        files.push(base);
    }
    files.extend(rotated_files(dir, prefix).await?);
    Ok(files)
}

/// The currently active file: the newest rotated file, or the base file if none exist.
pub async fn resolve_latest(dir: &Path, prefix: &str) -> io::Result<PathBuf> {
    Ok(rotated_files(dir, prefix)
        .await?
        .pop()
        .unwrap_or_else(|| base_path(dir, prefix)))
}

/// Append one line to `path`, creating the parent directory and the file as needed.
pub async fn append_line(path: &Path, text: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;

    file.write_all(&line_bytes(text)).await?;
    file.flush().await
}

/// True when the file exists and is at or above `max_bytes`. Unreadable metadata never rotates.
pub async fn should_rotate(path: &Path, max_bytes: u64) -> bool {
    match fs::metadata(path).await {
        Ok(metadata) => metadata.len() >= max_bytes,
        Err(_) => false,
    }
}

fn line_bytes(text: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(text.len() + 1);
    buf.extend_from_slice(text.as_bytes());
    buf.push(b'\n');
    buf
}

/// A writer for one logical log that keeps its active file open and rotates by size.
pub struct RotatingLogWriter {
    dir: PathBuf,
    prefix: String,
    /// Rotate once the active file reaches this many bytes.
    max_bytes: u64,
    /// Only stat the file every this many appends.
    check_every: u64,
    path: PathBuf,
    file: Option<fs::File>,
    appends_since_check: u64,
}

impl RotatingLogWriter {
    /// Resume the logical log in `dir`: appends go to the file a tailer would resolve.
    pub async fn open(
        dir: impl Into<PathBuf>,
        prefix: &str,
        max_bytes: u64,
        check_every: u64,
    ) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        let path = resolve_latest(&dir, prefix).await?;

        info!(path = %path.display(), "appending to log file");

        Ok(Self {
            dir,
            prefix: prefix.to_owned(),
            max_bytes,
            check_every: check_every.max(1),
            path,
            file: None,
            appends_since_check: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `text` as one line and rotate if the periodic size check says so.
    ///
    /// On failure the handle is dropped, so a retry reopens the file.
    pub async fn append(&mut self, text: &str) -> io::Result<()> {
        if let Err(e) = self.write_line(text).await {
            self.file = None;
            return Err(e);
        }

        self.appends_since_check += 1;
        if self.appends_since_check >= self.check_every {
            self.appends_since_check = 0;
            // The line is already written: a failed rotation must not fail the append
            if let Err(e) = self.maybe_rotate().await {
                warn!(path = %self.path.display(), error = %e, "failed to rotate log file");
            }
        }
        Ok(())
    }

    /// Append with up to `retries` immediate retries. The last error is returned if every
    /// attempt failed; callers treat that as fatal.
    pub async fn append_with_retries(&mut self, text: &str, retries: u32) -> io::Result<()> {
        let mut attempt = 0;
        loop {
            match self.append(text).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    warn!(path = %self.path.display(), error = %e, attempt, "append failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_line(&mut self, text: &str) -> io::Result<()> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?
            }
        };
        let file = self.file.insert(file);

        file.write_all(&line_bytes(text)).await?;
        file.flush().await
    }

    /// Rotate when the active file has grown past the limit. Returns whether it rotated.
    pub async fn maybe_rotate(&mut self) -> io::Result<bool> {
        if should_rotate(&self.path, self.max_bytes).await {
            self.rotate().await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Close the active file and start the next one. The new file is created right away
    /// so that tailers can observe the rotation.
    pub async fn rotate(&mut self) -> io::Result<PathBuf> {
        self.flush().await?;
        self.file = None;

        let next = next_rotation_path(&self.dir, &self.prefix, &self.path, Utc::now());
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&next)
            .await?;

        info!(from = %self.path.display(), to = %next.display(), "rotated log file");
        metrics::counter!(LOG_ROTATIONS_TOTAL, "prefix" => self.prefix.clone()).increment(1);

        self.file = Some(file);
        self.path = next.clone();
        Ok(next)
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, h, m, s).unwrap()
    }

    #[test]
    fn test_rotation_names_sort_in_time_order() {
        let dir = Path::new("/data");
        let earlier = rotation_path(dir, "raw", at(9, 59, 59));
        let later = rotation_path(dir, "raw", at(10, 0, 0));

        assert_eq!(earlier, Path::new("/data/raw-20240309-095959.jsonl"));
        assert!(earlier.file_name() < later.file_name());
    }

    #[test]
    fn test_rotation_stamp_only_matches_own_prefix() {
        assert!(rotation_stamp(Path::new("/d/raw-20240309-100000.jsonl"), "raw").is_some());
        assert!(rotation_stamp(Path::new("/d/raw.jsonl"), "raw").is_none());
        assert!(rotation_stamp(Path::new("/d/raw-extra-20240309-100000.jsonl"), "raw").is_none());
        assert!(rotation_stamp(Path::new("/d/processed-20240309-100000.jsonl"), "raw").is_none());
        assert!(rotation_stamp(Path::new("/d/raw-20241309-100000.jsonl"), "raw").is_none());
    }

    #[test]
    fn test_next_rotation_path_advances_within_the_same_second() {
        let dir = Path::new("/data");
        let current = rotation_path(dir, "raw", at(10, 0, 0));

        let next = next_rotation_path(dir, "raw", &current, at(10, 0, 0));
        assert_eq!(next, Path::new("/data/raw-20240309-100001.jsonl"));

        let behind = next_rotation_path(dir, "raw", &current, at(9, 0, 0));
        assert!(behind.file_name() > current.file_name());

        let ahead = next_rotation_path(dir, "raw", &current, at(11, 0, 0));
        assert_eq!(ahead, Path::new("/data/raw-20240309-110000.jsonl"));

        let from_base = next_rotation_path(dir, "raw", &base_path(dir, "raw"), at(9, 0, 0));
        assert_eq!(from_base, Path::new("/data/raw-20240309-090000.jsonl"));
    }

    #[tokio::test]
    async fn test_resolve_latest_prefers_newest_rotation() {
        let dir = tempfile::tempdir().unwrap();

        assert_eq!(
            resolve_latest(dir.path(), "raw").await.unwrap(),
            base_path(dir.path(), "raw")
        );

        append_line(&base_path(dir.path(), "raw"), "{}").await.unwrap();
        append_line(&rotation_path(dir.path(), "raw", at(10, 0, 0)), "{}")
            .await
            .unwrap();
        append_line(&rotation_path(dir.path(), "raw", at(11, 0, 0)), "{}")
            .await
            .unwrap();
        append_line(&rotation_path(dir.path(), "processed", at(12, 0, 0)), "{}")
            .await
            .unwrap();

        assert_eq!(
            resolve_latest(dir.path(), "raw").await.unwrap(),
            rotation_path(dir.path(), "raw", at(11, 0, 0))
        );
        assert_eq!(all_files(dir.path(), "raw").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_append_line_creates_parent_and_terminates_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("raw.jsonl");

        append_line(&path, r#"{"a":1}"#).await.unwrap();
        append_line(&path, r#"{"a":2}"#).await.unwrap();

        let contents = fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "{\"a\":1}\n{\"a\":2}\n");
    }

    #[tokio::test]
    async fn test_should_rotate_at_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.jsonl");

        assert!(!should_rotate(&path, 10).await);
        append_line(&path, "123456789").await.unwrap();
        assert!(should_rotate(&path, 10).await);
        assert!(!should_rotate(&path, 11).await);
    }

    #[tokio::test]
    async fn test_writer_rotates_and_resumes_latest() {
        let dir = tempfile::tempdir().unwrap();

        let mut writer = RotatingLogWriter::open(dir.path(), "raw", 64, 1)
            .await
            .unwrap();
        assert_eq!(writer.path(), base_path(dir.path(), "raw"));

        for i in 0..10 {
            writer
                .append(&format!(r#"{{"id":{i},"pad":"xxxxxxxxxx"}}"#))
                .await
                .unwrap();
        }
        writer.flush().await.unwrap();

        let rotated = rotated_files(dir.path(), "raw").await.unwrap();
        assert!(!rotated.is_empty());
        assert_eq!(writer.path(), rotated.last().unwrap().as_path());

        let mut lines = 0;
        for file in all_files(dir.path(), "raw").await.unwrap() {
            lines += fs::read_to_string(&file).await.unwrap().lines().count();
        }
        assert_eq!(lines, 10);

        let resumed = RotatingLogWriter::open(dir.path(), "raw", 64, 1)
            .await
            .unwrap();
        assert_eq!(resumed.path(), writer.path());
    }

    #[tokio::test]
    async fn test_append_with_retries_gives_up_then_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let base = base_path(dir.path(), "raw");
        let mut writer = RotatingLogWriter::open(dir.path(), "raw", u64::MAX, 100)
            .await
            .unwrap();

        // A directory in place of the log file makes every open fail
        fs::create_dir(&base).await.unwrap();
        assert!(writer.append_with_retries("lost", 2).await.is_err());

        fs::remove_dir(&base).await.unwrap();
        writer.append_with_retries("kept", 2).await.unwrap();
        writer.flush().await.unwrap();

        assert_eq!(fs::read_to_string(&base).await.unwrap(), "kept\n");
    }
}
