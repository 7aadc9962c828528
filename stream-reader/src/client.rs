use std::time;

use futures::StreamExt;
use reqwest::header;
use tracing::{debug, warn};

use crate::error::ConnectionError;
use crate::frame::FrameReader;

pub const EVENT_STREAM: &str = "text/event-stream";
pub const LAST_EVENT_ID: &str = "Last-Event-ID";

/// Opens connections to a server-sent events endpoint.
///
/// The client only knows how to connect; reconnecting and resuming is up to the caller,
/// which passes back the last event id it persisted.
#[derive(Clone)]
pub struct StreamClient {
    client: reqwest::Client,
    url: url::Url,
    connect_timeout: time::Duration,
    stall_timeout: time::Duration,
}

impl StreamClient {
    pub fn new(
        url: url::Url,
        user_agent: &str,
        connect_timeout: time::Duration,
        stall_timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(EVENT_STREAM));
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static("no-cache"),
        );

        // No overall request timeout: the body is read for as long as the stream lives.
        // Waiting for the response head is bounded in `connect`.
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .default_headers(headers)
            .connect_timeout(connect_timeout)
            .build()?;

        Ok(Self {
            client,
            url,
            connect_timeout,
            stall_timeout,
        })
    }

    pub fn url(&self) -> &url::Url {
        &self.url
    }

    /// Connect, optionally resuming after `last_event_id`, and return a reader over the
    /// frames of the response body.
    pub async fn connect(
        &self,
        last_event_id: Option<&str>,
    ) -> Result<FrameReader, ConnectionError> {
        let mut request = self.client.get(self.url.clone());

        if let Some(id) = last_event_id {
            match header::HeaderValue::from_str(id) {
                Ok(value) => request = request.header(LAST_EVENT_ID, value),
                Err(_) => warn!(id, "last event id is not a valid header value, not resuming"),
            }
        }

        let response = tokio::time::timeout(self.connect_timeout, request.send())
            .await
            .map_err(|_| ConnectionError::ResponseTimeout(self.connect_timeout))?
            .map_err(ConnectionError::Request)?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConnectionError::BadStatus(status));
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with(EVENT_STREAM) {
            return Err(ConnectionError::BadContentType(content_type.to_owned()));
        }

        debug!(url = %self.url, resumed = last_event_id.is_some(), "connected to stream");

        Ok(FrameReader::new(
            response.bytes_stream().boxed(),
            self.stall_timeout,
        ))
    }
}
