//! Time utilities for problemd
//!
//! Wall-clock time drives the new-problem throttle, problem directory names
//! and the `time` element of every problem.

use chrono::{DateTime, Local};

/// Format of the timestamp part of a problem directory name
pub const DUMP_DIR_TIME_FORMAT: &str = "%Y-%m-%d-%H:%M:%S";

/// Current local time
pub fn now() -> DateTime<Local> {
    Local::now()
}

/// Current time as seconds since the Unix epoch
///
/// Times before the epoch are clamped to zero.
pub fn epoch_secs() -> u64 {
    u64::try_from(now().timestamp()).unwrap_or(0)
}

/// Timestamp used in new problem directory names
pub fn format_dump_dir_time(dt: &DateTime<Local>) -> String {
    dt.format(DUMP_DIR_TIME_FORMAT).to_string()
}

/// Parse the decimal epoch seconds stored in `time`-like elements
pub fn parse_epoch_secs(text: &str) -> Option<u64> {
    text.trim().parse().ok()
}
