use chrono::{DateTime, Utc};

pub const MS_PER_DAY: i64 = 86_400_000;

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn to_date(ms: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
}

/// Whole days elapsed between `earlier` and `later`, rounded down.
/// Negative spans (clock skew between devices) count as zero.
pub fn whole_days_between(earlier: i64, later: i64) -> i64 {
    later.saturating_sub(earlier).max(0) / MS_PER_DAY
}

pub fn days_ms(days: u32) -> i64 {
    i64::from(days) * MS_PER_DAY
}
