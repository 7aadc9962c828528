use std::path::Path;
use std::str::FromStr;

use stream_common::logfile;
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::error::ConsumerError;
use crate::key::DedupKey;
use crate::membership::MembershipStore;

/// What the membership store holds when the consumer starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPolicy {
    /// Start with no members. Records re-read after a restart are emitted again.
    Empty,
    /// Admit the key of every record already in the output log before tailing.
    OutputLog,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown rebuild policy {0:?}, expected empty or output-log")]
pub struct ParseRebuildPolicyError(String);

impl FromStr for RebuildPolicy {
    type Err = ParseRebuildPolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "empty" => Ok(RebuildPolicy::Empty),
            "output-log" | "output_log" => Ok(RebuildPolicy::OutputLog),
            _ => Err(ParseRebuildPolicyError(s.to_owned())),
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RebuildSummary {
    pub files: usize,
    pub admitted: u64,
    pub skipped: u64,
}

/// Replay the `key` of every output record, oldest file first, into `store`.
pub async fn rebuild_from_output(
    store: &dyn MembershipStore,
    dir: &Path,
    prefix: &str,
) -> Result<RebuildSummary, ConsumerError> {
    let files = logfile::all_files(dir, prefix)
        .await
        .map_err(|source| ConsumerError::Rebuild {
            path: dir.to_path_buf(),
            source,
        })?;

    let mut summary = RebuildSummary {
        files: files.len(),
        ..Default::default()
    };

    for path in files {
        let read_error = |source| ConsumerError::Rebuild {
            path: path.clone(),
            source,
        };
        let file = fs::File::open(&path).await.map_err(read_error)?;
        let mut lines = BufReader::new(file).lines();

        while let Some(line) = lines.next_line().await.map_err(read_error)? {
            let key = serde_json::from_str::<serde_json::Value>(&line)
                .ok()
                .and_then(|record| record.get("key")?.as_str().map(DedupKey::from));

            let Some(key) = key else {
                summary.skipped += 1;
                continue;
            };
            match store.try_insert(&key).await {
                Ok(_) => summary.admitted += 1,
                Err(source) => {
                    return Err(ConsumerError::MembershipStoreUnavailable { retries: 0, source })
                }
            }
        }
    }

    if summary.skipped > 0 {
        warn!(skipped = summary.skipped, "output log lines without a key");
    }
    info!(
        files = summary.files,
        admitted = summary.admitted,
        "rebuilt membership from output log"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_policy() {
        assert_eq!("empty".parse(), Ok(RebuildPolicy::Empty));
        assert_eq!(" Output-Log ".parse(), Ok(RebuildPolicy::OutputLog));
        assert!("disk".parse::<RebuildPolicy>().is_err());
    }
}
