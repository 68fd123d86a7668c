/// Human-readable rendering for report and log cells.
use chrono::{DateTime, Utc};
use humansize::{format_size, BINARY};
use std::time::Duration;

/// Byte count in binary units (KiB, MiB, ...).
pub fn bytes(count: u64) -> String {
    format_size(count, BINARY)
}

/// `D days, HH:MM:SS.mmm (S.SS seconds)`.
pub fn duration(span: Duration) -> String {
    let total = span.as_secs();
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;
    let millis = span.subsec_millis();
    format!(
        "{days} days, {hours:02}:{minutes:02}:{seconds:02}.{millis:03} ({:.2} seconds)",
        span.as_secs_f64()
    )
}

/// UTC wall-clock timestamp with millisecond precision.
pub fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y/%m/%d %H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_duration_sub_second() {
        assert_eq!(
            duration(Duration::from_millis(250)),
            "0 days, 00:00:00.250 (0.25 seconds)"
        );
    }

    #[test]
    fn test_duration_rolls_into_days() {
        let span =
            Duration::from_secs(2 * 86_400 + 3 * 3_600 + 4 * 60 + 5) + Duration::from_millis(500);
        assert_eq!(duration(span), "2 days, 03:04:05.500 (183845.50 seconds)");
    }

    #[test]
    fn test_timestamp_format() {
        let at = Utc.with_ymd_and_hms(2023, 3, 7, 14, 5, 9).unwrap()
            + chrono::TimeDelta::milliseconds(42);
        assert_eq!(timestamp(&at), "2023/03/07 14:05:09.042");
    }

    #[test]
    fn test_bytes_uses_binary_units() {
        assert!(bytes(3 * 1024 * 1024).contains("MiB"));
        assert!(bytes(2048).contains("KiB"));
    }
}
