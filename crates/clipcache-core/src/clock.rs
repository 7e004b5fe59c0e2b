//! Wall-clock conversions for the recorder, which runs on Central European
//! time: UTC+1, or UTC+2 from the last Sunday of March to the last Sunday of
//! October. Both transitions happen at 01:00 UTC.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};

const STANDARD_OFFSET_HOURS: i64 = 1;
const SUMMER_OFFSET_HOURS: i64 = 2;
const TRANSITION_HOUR_UTC: u32 = 1;

/// Calendar fields of a recorder-local instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDateTime {
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl LocalDateTime {
    fn from_naive(naive: NaiveDateTime) -> Self {
        Self {
            year: naive.year(),
            month: naive.month(),
            day: naive.day(),
            hour: naive.hour(),
            minute: naive.minute(),
            second: naive.second(),
        }
    }

    /// Day folder name on the recorder, `YYYY-MM-DD`.
    pub fn folder_date(&self) -> String {
        format!("{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }

    /// Hour folder name on the recorder, `HH`.
    pub fn folder_hour(&self) -> String {
        format!("{:02}", self.hour)
    }
}

/// Instant of the DST transition in `month` of `year` (01:00 UTC on the last Sunday).
pub fn transition_at(year: i32, month: u32) -> Option<DateTime<Utc>> {
    let end_of_month = NaiveDate::from_ymd_opt(year, month, 31)?;
    let back = i64::from(end_of_month.weekday().num_days_from_sunday());
    let sunday = end_of_month - Duration::days(back);
    let naive = sunday.and_hms_opt(TRANSITION_HOUR_UTC, 0, 0)?;
    Some(Utc.from_utc_datetime(&naive))
}

pub fn is_dst(at: DateTime<Utc>) -> bool {
    match (transition_at(at.year(), 3), transition_at(at.year(), 10)) {
        (Some(start), Some(end)) => at >= start && at < end,
        _ => false,
    }
}

pub fn local_offset_hours(at: DateTime<Utc>) -> i64 {
    if is_dst(at) {
        SUMMER_OFFSET_HOURS
    } else {
        STANDARD_OFFSET_HOURS
    }
}

fn offset_for_secs(secs: i64) -> i64 {
    DateTime::from_timestamp(secs, 0)
        .map(local_offset_hours)
        .unwrap_or(STANDARD_OFFSET_HOURS)
}

pub fn utc_to_local(utc_secs: i64) -> i64 {
    utc_secs + offset_for_secs(utc_secs) * 3600
}

/// Convert recorder-local seconds back to UTC.
///
/// The first estimate uses the offset in force at the local reading; if that
/// estimate lands on the other side of a transition the offset is recomputed
/// once. Local times skipped in spring resolve forward; repeated times in
/// autumn resolve to the second (standard time) occurrence.
pub fn local_to_utc(local_secs: i64) -> i64 {
    let guess_offset = offset_for_secs(local_secs);
    let first = local_secs - guess_offset * 3600;
    let actual_offset = offset_for_secs(first);
    if actual_offset == guess_offset {
        first
    } else {
        local_secs - actual_offset * 3600
    }
}

pub fn utc_to_local_date(utc_secs: i64) -> Option<LocalDateTime> {
    let local = DateTime::from_timestamp(utc_to_local(utc_secs), 0)?;
    Some(LocalDateTime::from_naive(local.naive_utc()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, mi, s).unwrap()
    }

    #[test]
    fn transitions_fall_on_last_sunday() {
        assert_eq!(transition_at(2024, 3), Some(utc(2024, 3, 31, 1, 0, 0)));
        assert_eq!(transition_at(2024, 10), Some(utc(2024, 10, 27, 1, 0, 0)));
        assert_eq!(transition_at(2023, 3), Some(utc(2023, 3, 26, 1, 0, 0)));
        assert_eq!(transition_at(2023, 10), Some(utc(2023, 10, 29, 1, 0, 0)));
    }

    #[test]
    fn offsets_by_season() {
        assert_eq!(local_offset_hours(utc(2024, 1, 15, 12, 0, 0)), 1);
        assert_eq!(local_offset_hours(utc(2024, 7, 15, 12, 0, 0)), 2);
        assert_eq!(local_offset_hours(utc(2024, 12, 31, 23, 59, 59)), 1);
    }

    #[test]
    fn local_date_crosses_midnight() {
        let secs = utc(2024, 7, 15, 22, 30, 0).timestamp();
        let local = utc_to_local_date(secs).unwrap();
        assert_eq!(local.folder_date(), "2024-07-16");
        assert_eq!(local.folder_hour(), "00");
        assert_eq!(local.minute, 30);
    }

    #[test]
    fn local_to_utc_corrects_across_spring_boundary() {
        // 01:30 CET on the transition day is still standard time.
        let local = utc(2024, 3, 31, 1, 30, 0).timestamp();
        assert_eq!(local_to_utc(local), utc(2024, 3, 31, 0, 30, 0).timestamp());
        // 04:00 CEST is well inside summer time.
        let local = utc(2024, 3, 31, 4, 0, 0).timestamp();
        assert_eq!(local_to_utc(local), utc(2024, 3, 31, 2, 0, 0).timestamp());
    }

    #[test]
    fn repeated_autumn_hour_resolves_to_standard_time() {
        let local = utc(2024, 10, 27, 2, 30, 0).timestamp();
        assert_eq!(local_to_utc(local), utc(2024, 10, 27, 1, 30, 0).timestamp());
    }

    proptest! {
        #[test]
        fn round_trips_away_from_autumn_fallback(secs in 0i64..4_102_444_800) {
            let at = DateTime::from_timestamp(secs, 0).unwrap();
            let fallback = transition_at(at.year(), 10).unwrap();
            prop_assume!(at < fallback - Duration::hours(1) || at >= fallback);
            prop_assert_eq!(local_to_utc(utc_to_local(secs)), secs);
        }
    }
}
