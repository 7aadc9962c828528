use std::borrow::Cow;

use crate::frame::Frame;

/// A frame as it is persisted: the source payload, untouched when it is already a single
/// line, plus the stream id that becomes the resumption point once it is written.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub id: Option<String>,
    pub payload: String,
}

impl From<Frame> for RawRecord {
    fn from(frame: Frame) -> Self {
        Self {
            id: frame.id,
            payload: frame.data,
        }
    }
}

impl RawRecord {

    /// The payload as one JSON-lines entry.
    ///
    /// Multi-line payloads are re-serialized compactly. A multi-line payload that is not
    /// JSON has its line breaks flattened, so it still occupies exactly one line and the
    /// consumer counts it as a parse error instead of reading fragments.
    pub fn log_line(&self) -> Cow<'_, str> {
        if !self.payload.contains(['\n', '\r']) {
            return Cow::Borrowed(&self.payload);
        }

        match serde_json::from_str::<serde_json::Value>(&self.payload) {
            Ok(value) => Cow::Owned(value.to_string()),
            Err(_) => Cow::Owned(self.payload.replace(['\r', '\n'], " ")),
        }
    }
}
