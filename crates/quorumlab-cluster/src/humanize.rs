//! Human-readable times and sizes for status text.

use std::time::{Duration, SystemTime};

const SECOND: u64 = 1;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;
const WEEK: u64 = 7 * DAY;
const MONTH: u64 = 30 * DAY;
const YEAR: u64 = 12 * MONTH;

/// (upper bound in seconds, format, divisor). A divisor of 0 means the
/// format is used verbatim.
const MAGNITUDES: &[(u64, &str, u64)] = &[
    (SECOND, "now", 0),
    (2 * SECOND, "1 second", 0),
    (MINUTE, "seconds", SECOND),
    (2 * MINUTE, "1 minute", 0),
    (HOUR, "minutes", MINUTE),
    (2 * HOUR, "1 hour", 0),
    (DAY, "hours", HOUR),
    (2 * DAY, "1 day", 0),
    (WEEK, "days", DAY),
    (2 * WEEK, "1 week", 0),
    (MONTH, "weeks", WEEK),
    (2 * MONTH, "1 month", 0),
    (YEAR, "months", MONTH),
    (18 * MONTH, "1 year", 0),
    (2 * YEAR, "2 years", 0),
    (u64::MAX, "years", YEAR),
];

/// Describe `then` relative to the current time ("3 seconds ago").
pub fn time(then: SystemTime) -> String {
    relative(then, SystemTime::now())
}

/// Describe `then` relative to `now`.
pub fn relative(then: SystemTime, now: SystemTime) -> String {
    let (elapsed, suffix) = match now.duration_since(then) {
        Ok(d) => (d, "ago"),
        Err(e) => (e.duration(), "from now"),
    };
    describe(elapsed, suffix)
}

fn describe(elapsed: Duration, suffix: &str) -> String {
    let secs = elapsed.as_secs();
    for &(bound, label, divisor) in MAGNITUDES {
        if secs >= bound {
            continue;
        }
        return match (label, divisor) {
            ("now", _) => "now".to_string(),
            (label, 0) => format!("{} {}", label, suffix),
            (label, divisor) => format!("{} {} {}", secs / divisor, label, suffix),
        };
    }
    format!("a long while {}", suffix)
}

const SIZES: &[&str] = &["B", "kB", "MB", "GB", "TB", "PB", "EB"];

/// SI size string ("16 kB", "1.5 MB").
pub fn bytes(size: u64) -> String {
    if size < 10 {
        return format!("{} B", size);
    }
    let mut exp = 0;
    let mut scaled = size as f64;
    while scaled >= 1000.0 && exp + 1 < SIZES.len() {
        scaled /= 1000.0;
        exp += 1;
    }
    let val = (scaled * 10.0 + 0.5).floor() / 10.0;
    if val < 10.0 {
        format!("{:.1} {}", val, SIZES[exp])
    } else {
        format!("{:.0} {}", val, SIZES[exp])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ago(secs: u64) -> String {
        let now = SystemTime::now();
        relative(now - Duration::from_secs(secs), now)
    }

    #[test]
    fn test_relative_time() {
        assert_eq!(ago(0), "now");
        assert_eq!(ago(1), "1 second ago");
        assert_eq!(ago(3), "3 seconds ago");
        assert_eq!(ago(90), "1 minute ago");
        assert_eq!(ago(5 * MINUTE), "5 minutes ago");
        assert_eq!(ago(3 * HOUR), "3 hours ago");
        assert_eq!(ago(DAY + HOUR), "1 day ago");
        assert_eq!(ago(3 * WEEK), "3 weeks ago");
        assert_eq!(ago(3 * YEAR), "3 years ago");
    }

    #[test]
    fn test_relative_time_future() {
        let now = SystemTime::now();
        assert_eq!(
            relative(now + Duration::from_secs(10), now),
            "10 seconds from now"
        );
    }

    #[test]
    fn test_bytes() {
        assert_eq!(bytes(0), "0 B");
        assert_eq!(bytes(9), "9 B");
        assert_eq!(bytes(100), "100 B");
        assert_eq!(bytes(1500), "1.5 kB");
        assert_eq!(bytes(16384), "16 kB");
        assert_eq!(bytes(2_500_000), "2.5 MB");
        assert_eq!(bytes(82_854_982), "83 MB");
    }
}
