//! Server-sent events framing.
//!
//! The body of a streaming response is split into lines; lines are folded into frames.
//! Comment lines (heartbeats) are dropped, `id:` lines set the frame id, `data:` lines
//! accumulate the payload and a blank line closes the frame. A frame with a line that
//! is not UTF-8 is dropped whole.
use std::time;

use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::warn;

use crate::error::ConnectionError;
use crate::metrics_consts::FRAMES_DISCARDED;

/// A boxed response body, as produced by `reqwest::Response::bytes_stream`.
pub type BodyStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

/// One server-pushed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    data: Vec<String>,
    id: Option<String>,
    corrupt: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line, without its `\n` terminator. Returns a frame when the line closes one.
    pub fn push_line(&mut self, line: &str) -> Option<Frame> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            let id = self.id.take();
            if std::mem::take(&mut self.corrupt) {
                self.data.clear();
                warn!(id = id.as_deref().unwrap_or("none"), "dropping frame that is not UTF-8");
                metrics::counter!(FRAMES_DISCARDED).increment(1);
                return None;
            }
            if self.data.is_empty() {
                return None;
            }
            let data = self.data.join("\n");
            self.data.clear();
            return Some(Frame { id, data });
        }

        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_owned()),
            "id" => self.id = Some(value.to_owned()),
            // event, retry and unknown fields carry nothing we persist
            _ => {}
        }
        None
    }

    /// Feed a line that could not be decoded. The frame it belongs to is dropped.
    pub fn push_invalid_line(&mut self) {
        self.corrupt = true;
    }
}

/// Reads frames off a response body. The sequence only ends with an error: a closed or
/// broken body surfaces as a `ConnectionError` and the caller reconnects.
pub struct FrameReader {
    body: BodyStream,
    buffer: BytesMut,
    decoder: FrameDecoder,
    /// Fail when the body yields nothing, heartbeats included, for this long.
    stall_timeout: time::Duration,
}

impl FrameReader {
    pub fn new(body: BodyStream, stall_timeout: time::Duration) -> Self {
        Self {
            body,
            buffer: BytesMut::new(),
            decoder: FrameDecoder::new(),
            stall_timeout,
        }
    }

    pub async fn next_frame(&mut self) -> Result<Frame, ConnectionError> {
        loop {
            while let Some(line) = self.next_line() {
                let frame = match std::str::from_utf8(&line) {
                    Ok(line) => self.decoder.push_line(line),
                    Err(_) => {
                        self.decoder.push_invalid_line();
                        None
                    }
                };
                if let Some(frame) = frame {
                    return Ok(frame);
                }
            }

            match tokio::time::timeout(self.stall_timeout, self.body.next()).await {
                Err(_) => return Err(ConnectionError::Stalled(self.stall_timeout)),
                Ok(None) => return Err(ConnectionError::Closed),
                Ok(Some(Err(e))) => return Err(ConnectionError::Stream(e)),
                Ok(Some(Ok(chunk))) => self.buffer.extend_from_slice(&chunk),
            }
        }
    }

    /// The next line without its terminator.
    fn next_line(&mut self) -> Option<Bytes> {
        let end = self.buffer.iter().position(|b| *b == b'\n')?;
        let mut line = self.buffer.split_to(end + 1);
        line.truncate(end);
        Some(line.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&'static str]) -> BodyStream {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
            .collect();
        futures::stream::iter(chunks).boxed()
    }

    #[test]
    fn test_decoder_joins_data_lines_and_captures_id() {
        let mut decoder = FrameDecoder::new();

        assert_eq!(decoder.push_line("event: message"), None);
        assert_eq!(decoder.push_line("id: [{\"offset\":7}]"), None);
        assert_eq!(decoder.push_line("data: {\"a\":"), None);
        assert_eq!(decoder.push_line("data: 1}"), None);

        assert_eq!(
            decoder.push_line(""),
            Some(Frame {
                id: Some("[{\"offset\":7}]".to_owned()),
                data: "{\"a\":\n1}".to_owned(),
            })
        );
    }

    #[test]
    fn test_decoder_drops_heartbeats_and_resets_between_frames() {
        let mut decoder = FrameDecoder::new();

        assert_eq!(decoder.push_line(":ok"), None);
        assert_eq!(decoder.push_line(""), None);

        decoder.push_line("id: 1");
        decoder.push_line("data: first");
        assert_eq!(
            decoder.push_line("\r"),
            Some(Frame {
                id: Some("1".to_owned()),
                data: "first".to_owned(),
            })
        );

        decoder.push_line("data: second");
        assert_eq!(
            decoder.push_line(""),
            Some(Frame {
                id: None,
                data: "second".to_owned(),
            })
        );
    }

    #[test]
    fn test_decoder_id_without_data_is_discarded() {
        let mut decoder = FrameDecoder::new();

        decoder.push_line("id: 5");
        assert_eq!(decoder.push_line(""), None);

        decoder.push_line("data: x");
        assert_eq!(decoder.push_line("").and_then(|f| f.id), None);
    }

    #[tokio::test]
    async fn test_reader_frames_across_chunk_boundaries() {
        let mut reader = FrameReader::new(
            body(&[
                ": heartbeat\n",
                "id: 1\nda",
                "ta: {\"n\":1}\n",
                "\nid: 2\ndata: {\"n\":2}\n\n",
            ]),
            time::Duration::from_secs(5),
        );

        let first = reader.next_frame().await.unwrap();
        assert_eq!(first.id.as_deref(), Some("1"));
        assert_eq!(first.data, "{\"n\":1}");

        let second = reader.next_frame().await.unwrap();
        assert_eq!(second.id.as_deref(), Some("2"));

        assert!(matches!(
            reader.next_frame().await,
            Err(ConnectionError::Closed)
        ));
    }

    #[test]
    fn test_decoder_drops_frame_with_invalid_line() {
        let mut decoder = FrameDecoder::new();

        decoder.push_line("id: 3");
        decoder.push_line("data: {\"a\":");
        decoder.push_invalid_line();
        assert_eq!(decoder.push_line(""), None);

        decoder.push_line("data: next");
        assert_eq!(
            decoder.push_line(""),
            Some(Frame {
                id: None,
                data: "next".to_owned(),
            })
        );
    }

    #[tokio::test]
    async fn test_reader_skips_frame_that_is_not_utf8() {
        let chunks: Vec<Result<Bytes, reqwest::Error>> = vec![
            Ok(Bytes::from_static(b"id: 1\ndata: {\"t\": \"\xff\xfe\"}\n\n")),
            Ok(Bytes::from_static(b"id: 2\ndata: {\"t\": \"ok\"}\n\n")),
        ];
        let mut reader = FrameReader::new(
            futures::stream::iter(chunks).boxed(),
            time::Duration::from_secs(5),
        );

        let frame = reader.next_frame().await.unwrap();
        assert_eq!(frame.id.as_deref(), Some("2"));
        assert_eq!(frame.data, "{\"t\": \"ok\"}");
    }

    #[tokio::test]
    async fn test_reader_detects_stall() {
        let stalled: BodyStream = futures::stream::pending::<Result<Bytes, reqwest::Error>>().boxed();
        let mut reader = FrameReader::new(stalled, time::Duration::from_millis(20));

        assert!(matches!(
            reader.next_frame().await,
            Err(ConnectionError::Stalled(_))
        ));
    }

    #[tokio::test]
    async fn test_partial_frame_is_not_yielded_on_close() {
        let mut reader = FrameReader::new(
            body(&["id: 9\ndata: {\"cut\":"]),
            time::Duration::from_secs(5),
        );

        assert!(matches!(
            reader.next_frame().await,
            Err(ConnectionError::Closed)
        ));
    }
}
