use std::path::PathBuf;

use thiserror::Error;

/// A raw line that is not a JSON object.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("line is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("line is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("line is valid JSON but not an object")]
    NotAnObject,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum KeyError {
    #[error("record has no identity field and none of the fallback fields")]
    NoIdentity,
}

/// Why a single line was skipped. Counted, never propagated past the normalizer.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl RecordError {
    pub fn reason(&self) -> &'static str {
        match self {
            RecordError::Parse(_) => "parse",
            RecordError::Key(_) => "key",
        }
    }
}

/// Conditions the tailer recovers from by re-resolving the active file.
#[derive(Error, Debug)]
pub enum TailError {
    #[error("log file {0} disappeared, likely rotated or not created yet")]
    RotationRace(PathBuf),
    #[error("failed to read log file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum MembershipError {
    #[error("membership store unavailable: {0}")]
    Unavailable(String),
}

/// Errors that stop the consumer process.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("failed to load configuration: {0}")]
    Environment(#[from] envconfig::Error),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("membership store stayed unavailable after {retries} retries: {source}")]
    MembershipStoreUnavailable {
        retries: u32,
        #[source]
        source: MembershipError,
    },
    #[error("failed to write to the output log: {0}")]
    OutputWrite(#[source] std::io::Error),
    #[error("failed to rebuild membership from {path}: {source}")]
    Rebuild {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("a normalization worker stopped unexpectedly")]
    WorkerLost,
}
