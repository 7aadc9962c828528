/// Counter for log file rotations, labelled by file prefix
pub const LOG_ROTATIONS_TOTAL: &str = "log_rotations_total";
