//! Time helpers, grounded on the `now_msec`-style helper this codebase's
//! resync/GC/upsync scheduling loops rely on for delay computations.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_msec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock is before the Unix epoch")
		.as_millis() as u64
}

/// Current time in whole seconds since the Unix epoch, used by the folder
/// allocator's generational rotation periods.
pub fn now_secs() -> u64 {
	now_msec() / 1000
}
