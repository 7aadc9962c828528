use std::time;

use thiserror::Error;

/// Failures of the streaming connection. All of them are recovered by reconnecting.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("request to stream endpoint failed: {0}")]
    Request(#[source] reqwest::Error),
    #[error("stream endpoint sent no response within {0:?}")]
    ResponseTimeout(time::Duration),
    #[error("stream endpoint responded with status {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("stream endpoint responded with content type {0:?}, expected text/event-stream")]
    BadContentType(String),
    #[error("error reading stream body: {0}")]
    Stream(#[source] reqwest::Error),
    #[error("no data received from stream for {0:?}")]
    Stalled(time::Duration),
    #[error("stream closed by the server")]
    Closed,
}

/// Errors that stop the reader process.
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("failed to load configuration: {0}")]
    Environment(#[from] envconfig::Error),
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("failed to append to the raw log: {0}")]
    RawWrite(#[source] std::io::Error),
}
