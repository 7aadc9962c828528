/// Records normalized and written to the output log.
pub const RECORDS_PROCESSED: &str = "consumer_records_processed_total";

/// Records skipped because their key was already a member.
pub const RECORDS_DEDUPED: &str = "consumer_records_deduped_total";

/// Lines that failed to parse or had no usable identity, labelled by `reason`.
pub const RECORDS_ERRORED: &str = "consumer_records_errored_total";

/// Seconds between a line leaving the tailer and its record being written.
pub const RECORD_LATENCY: &str = "consumer_record_latency_seconds";

pub const MEMBERSHIP_SIZE: &str = "consumer_membership_size";
pub const MEMBERSHIP_EVICTED: &str = "consumer_membership_evicted_total";

/// Membership operations that failed and were retried.
pub const MEMBERSHIP_RETRIES: &str = "consumer_membership_retries_total";

pub const TAIL_FILE_SWITCHES: &str = "consumer_tail_file_switches_total";
pub const TAIL_TRUNCATIONS: &str = "consumer_tail_truncations_total";
pub const TAIL_BYTES_READ: &str = "consumer_tail_bytes_read_total";

pub const METRICS_LOG_FAILURES: &str = "consumer_metrics_log_failures_total";
