//! Small helpers.

use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc};
use std::time::Duration;

pub fn tif_from_str(s: &str) -> webull_unofficial::models::TimeInForce {
    match s.to_ascii_uppercase().as_str() {
        "GTC" => webull_unofficial::models::TimeInForce::GoodTillCancel,
        _ => webull_unofficial::models::TimeInForce::Day,
    }
}

pub fn sanitize_symbol(sym: &str) -> String {
    sym.trim().to_uppercase()
}

/// Parse an expiration in any of the shapes venues hand out:
/// "2025-08-16", "20250816", "2025/08/16".
pub fn parse_expiration(s: &str) -> Option<NaiveDate> {
    let d: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if d.len() < 8 {
        return None;
    }
    NaiveDate::parse_from_str(&d[..8], "%Y%m%d").ok()
}

/// Time until the next local occurrence of `hour:00`.
pub fn until_next_local_hour(now: DateTime<Local>, hour: u32) -> Duration {
    let hour = hour.min(23);
    let today_at = now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest());
    let next = match today_at {
        Some(t) if t > now => t,
        Some(t) => t + ChronoDuration::days(1),
        None => now + ChronoDuration::hours(1),
    };
    (next - now).to_std().unwrap_or(Duration::from_secs(60))
}

/// Local midnight of `now`'s day, in UTC.
pub fn start_of_local_day(now: DateTime<Local>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .unwrap_or(now - ChronoDuration::hours(24))
        .with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiration_shapes() {
        let want = NaiveDate::from_ymd_opt(2025, 8, 16);
        assert_eq!(parse_expiration("2025-08-16"), want);
        assert_eq!(parse_expiration("20250816"), want);
        assert_eq!(parse_expiration("2025/08/16 00:00:00"), want);
        assert_eq!(parse_expiration("08/16"), None);
    }

    #[test]
    fn next_hour_is_within_a_day() {
        let now = Local::now();
        let wait = until_next_local_hour(now, 16);
        assert!(wait <= Duration::from_secs(25 * 3600));
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn local_day_starts_before_now() {
        let now = Local::now();
        let start = start_of_local_day(now);
        assert!(start <= now.with_timezone(&Utc));
        assert!(now.with_timezone(&Utc) - start <= ChronoDuration::hours(25));
    }

    #[test]
    fn sanitize() {
        assert_eq!(sanitize_symbol("  nvda "), "NVDA");
    }
}
