pub const FRAMES_RECEIVED: &str = "stream_frames_received_total";
pub const RECONNECTS: &str = "stream_reconnects_total";
pub const CONNECTION_ERRORS: &str = "stream_connection_errors_total";
pub const RAW_BYTES_WRITTEN: &str = "stream_raw_bytes_written_total";
pub const FRAMES_DISCARDED: &str = "stream_frames_discarded_total";
