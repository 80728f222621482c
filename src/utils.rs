use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Timelike, Utc};

/// Calendar day string (YYYY-MM-DD) for `now` shifted into the server's
/// configured timezone offset. Dates embedded in record keys always use
/// this, never raw UTC, so quests roll over at the server's local midnight.
pub fn local_date_string(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    shifted(now, utc_offset_minutes).format("%Y-%m-%d").to_string()
}

/// Yesterday's local calendar day string.
pub fn local_yesterday_string(now: DateTime<Utc>, utc_offset_minutes: i32) -> String {
    local_date_string(now - Duration::days(1), utc_offset_minutes)
}

/// Local wall-clock time of day for reset-gate comparisons.
pub fn local_time_of_day(now: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveTime {
    shifted(now, utc_offset_minutes).time()
}

/// True once local time has reached `hh:mm`.
pub fn at_or_after(now: DateTime<Utc>, utc_offset_minutes: i32, hh: u32, mm: u32) -> bool {
    let t = local_time_of_day(now, utc_offset_minutes);
    (t.hour(), t.minute()) >= (hh, mm)
}

fn shifted(now: DateTime<Utc>, utc_offset_minutes: i32) -> DateTime<FixedOffset> {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).unwrap());
    now.with_timezone(&offset)
}
