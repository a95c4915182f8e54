use chrono::prelude::*;
use chrono_tz::Tz;

use crate::errors::{NutifyErrorKind, Result};

/// Get the time since the UNIX epoch in seconds
pub fn sec_since_epoch() -> u64 {
    Utc::now().timestamp() as u64
}

/// Get the time since the UNIX epoch in milliseconds
pub fn ms_since_epoch() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// The current UTC wall clock, truncated to whole seconds.
///
/// Sample and event timestamps are stored naïve-UTC at second granularity.
pub fn utc_now_secs() -> NaiveDateTime {
    let now = Utc::now().naive_utc();
    now.with_nanosecond(0).unwrap_or(now)
}

/// Resolve a timezone by IANA name.
pub fn parse_timezone(name: &str) -> Result<Tz> {
    name.parse::<Tz>()
        .map_err(|_| NutifyErrorKind::InvalidTimezone(name.to_owned()).into())
}

/// Convert a stored naïve-UTC timestamp into the configured local timezone.
pub fn to_local(utc: NaiveDateTime, tz: Tz) -> DateTime<Tz> {
    Utc.from_utc_datetime(&utc).with_timezone(&tz)
}

/// The current wall clock in the configured local timezone.
pub fn local_now(tz: Tz) -> DateTime<Tz> {
    Utc::now().with_timezone(&tz)
}

/// Render a stored naïve-UTC timestamp as a local ISO string for display.
pub fn format_local(utc: NaiveDateTime, tz: Tz) -> String {
    to_local(utc, tz).format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_now_secs_truncates() {
        let now = utc_now_secs();
        assert_eq!(now.nanosecond(), 0);
    }

    #[test]
    fn test_parse_timezone() {
        assert!(parse_timezone("Europe/Rome").is_ok());
        assert!(parse_timezone("Not/AZone").is_err());
    }

    #[test]
    fn test_to_local_conversion() {
        let tz = parse_timezone("Europe/Rome").unwrap();
        // 2024-06-01 is CEST (UTC+2)
        let utc = NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(10, 0, 0)
            .unwrap();
        let local = to_local(utc, tz);
        assert_eq!(local.hour(), 12);
        assert_eq!(format_local(utc, tz), "2024-06-01 12:00:00");
    }
}
