//! Time utilities for safe timestamp handling.

use crate::voucher::error::VoucherError;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in seconds since Unix epoch.
///
/// In the extremely rare case where system time is before Unix epoch,
/// it returns an error instead of panicking.
pub(crate) fn current_timestamp() -> Result<i64, VoucherError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .map_err(|_| VoucherError::ClockError("System time is before Unix epoch".to_string()))
}

/// Check if a deadline lies strictly before `now`.
pub(crate) fn is_past(deadline: i64, now: i64) -> bool {
    deadline < now
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_timestamp() {
        let ts = current_timestamp().unwrap();
        // Should be a reasonable timestamp (after year 2020)
        assert!(ts > 1577836800); // 2020-01-01 00:00:00 UTC
    }

    #[test]
    fn test_is_past() {
        let now = current_timestamp().unwrap();
        assert!(is_past(now - 1, now));
        assert!(!is_past(now, now));
        assert!(!is_past(now + 3600, now));
    }
}
