//! UTC calendar arithmetic used for schedules, renewals and reminder windows.

use chrono::{DateTime, Duration, Months, NaiveTime, Utc};

const SECONDS_PER_DAY: i64 = 86_400;

/// Add `months` calendar months, clamping the day to the last valid day of the
/// target month. Time of day is preserved.
///
/// Jan 31 + 1 month is Feb 28 (Feb 29 in leap years).
pub fn add_months_clamped(at: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    // chrono clamps the day-of-month; it only fails past year 262143.
    at.checked_add_months(Months::new(months))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Midnight UTC of the day containing `at`.
pub fn utc_day_start(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Days elapsed since 1970-01-01 UTC.
pub fn utc_day_number(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(SECONDS_PER_DAY)
}

/// Half-open `[start, end)` bounds of the UTC day containing `at`.
pub fn utc_day_bounds(at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = utc_day_start(at);
    let end = start
        .checked_add_signed(Duration::days(1))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    (start, end)
}

pub fn same_utc_day(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    utc_day_number(a) == utc_day_number(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn test_add_months_clamps_to_month_end() {
        assert_eq!(add_months_clamped(at(2025, 1, 31, 9, 30), 1), at(2025, 2, 28, 9, 30));
        assert_eq!(add_months_clamped(at(2024, 1, 31, 9, 30), 1), at(2024, 2, 29, 9, 30));
        assert_eq!(add_months_clamped(at(2025, 1, 31, 0, 0), 3), at(2025, 4, 30, 0, 0));
        assert_eq!(add_months_clamped(at(2025, 8, 31, 0, 0), 6), at(2026, 2, 28, 0, 0));
    }

    #[test]
    fn test_add_months_crosses_year() {
        assert_eq!(add_months_clamped(at(2025, 11, 15, 12, 0), 12), at(2026, 11, 15, 12, 0));
        assert_eq!(add_months_clamped(at(2025, 12, 31, 23, 59), 2), at(2026, 2, 28, 23, 59));
    }

    #[test]
    fn test_add_zero_months_is_identity() {
        let t = at(2025, 3, 31, 8, 0);
        assert_eq!(add_months_clamped(t, 0), t);
    }

    #[test]
    fn test_day_start_and_bounds() {
        let t = at(2025, 2, 10, 12, 0);
        assert_eq!(utc_day_start(t), at(2025, 2, 10, 0, 0));

        let (start, end) = utc_day_bounds(t);
        assert_eq!(start, at(2025, 2, 10, 0, 0));
        assert_eq!(end, at(2025, 2, 11, 0, 0));
    }

    #[test]
    fn test_day_number() {
        assert_eq!(utc_day_number(at(1970, 1, 1, 23, 59)), 0);
        assert_eq!(utc_day_number(at(1970, 1, 2, 0, 0)), 1);
        assert_eq!(utc_day_number(Utc.timestamp_opt(-1, 0).unwrap()), -1);
    }

    #[test]
    fn test_same_utc_day() {
        assert!(same_utc_day(at(2025, 5, 1, 0, 0), at(2025, 5, 1, 23, 59)));
        assert!(!same_utc_day(at(2025, 5, 1, 23, 59), at(2025, 5, 2, 0, 0)));
    }
}
