use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike};

use crate::error::{CronError, Result};
use crate::field::{self, BitSet, Field};

/// How far ahead `next_after` searches. Covers the longest legitimate wait
/// (Feb 29 across a skipped leap year) with margin.
const SEARCH_DAYS: i64 = 366 * 9;

/// Longest local-time gap we step over when a firing lands inside one.
/// Some zones have skipped an entire calendar day.
const MAX_GAP_MINUTES: i64 = 25 * 60;

/// A validated five-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: BitSet,
    hours: BitSet,
    days_of_month: BitSet,
    months: BitSet,
    days_of_week: BitSet,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a five-field expression or one of the `@` aliases.
    pub fn parse(expr: &str) -> Result<Self> {
        let trimmed = expr.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_alias(trimmed)?
        } else {
            trimmed
        };

        let parts: Vec<&str> = expanded.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount(parts.len()));
        }

        let minute = field::parse_field(parts[0], &field::MINUTE)?;
        let hour = field::parse_field(parts[1], &field::HOUR)?;
        let dom = field::parse_field(parts[2], &field::DAY_OF_MONTH)?;
        let month = field::parse_field(parts[3], &field::MONTH)?;
        let dow = field::parse_field(parts[4], &field::DAY_OF_WEEK)?;

        let schedule = Self {
            source: trimmed.to_string(),
            minutes: minute.values,
            hours: hour.values,
            days_of_month: dom.values,
            months: month.values,
            days_of_week: dow.values,
            dom_restricted: dom.restricted,
            dow_restricted: dow.restricted,
        };
        schedule.ensure_reachable(&dom, &month)?;
        Ok(schedule)
    }

    /// The expression as written (aliases are kept unexpanded).
    pub fn expression(&self) -> &str {
        &self.source
    }

    /// Whether the calendar day `date` is eligible. When both day fields are
    /// restricted either may match; otherwise both must.
    pub fn matches_date(&self, date: NaiveDate) -> bool {
        if !self.months.contains(date.month()) {
            return false;
        }
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether the local wall-clock minute `local` is a firing time.
    pub fn matches(&self, local: NaiveDateTime) -> bool {
        self.matches_date(local.date())
            && self.hours.contains(local.hour())
            && self.minutes.contains(local.minute())
    }

    /// The first firing instant strictly after `after`, evaluated on the
    /// wall clock of `after`'s zone.
    pub fn next_after<Z: TimeZone>(&self, after: &DateTime<Z>) -> Option<DateTime<Z>> {
        let zone = after.timezone();
        let local = after.naive_local();
        let start = local.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);

        let mut date = start.date();
        let last = date + Duration::days(SEARCH_DAYS);
        while date <= last {
            if self.matches_date(date) {
                for hour in self.hours.iter() {
                    for minute in self.minutes.iter() {
                        let Some(naive) = date.and_hms_opt(hour, minute, 0) else {
                            continue;
                        };
                        if naive < start {
                            continue;
                        }
                        match resolve_local(&zone, naive) {
                            Some(instant) if instant > *after => return Some(instant),
                            _ => {}
                        }
                    }
                }
            }
            date = date.succ_opt()?;
        }
        None
    }

    /// Lazy, strictly increasing sequence of firings after `after`.
    pub fn upcoming<Z: TimeZone>(&self, after: DateTime<Z>) -> Upcoming<'_, Z> {
        Upcoming {
            schedule: self,
            cursor: after,
        }
    }

    fn ensure_reachable(&self, dom: &Field, month: &Field) -> Result<()> {
        // With a wildcard weekday the day-of-month has to exist in some month.
        if !dom.restricted || self.dow_restricted {
            return Ok(());
        }
        let reachable = month
            .values
            .iter()
            .any(|m| dom.values.iter().any(|d| d <= max_days_in_month(m)));
        if reachable && !dom.values.is_empty() {
            Ok(())
        } else {
            Err(CronError::NeverFires(self.source.clone()))
        }
    }
}

impl FromStr for CronSchedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Iterator returned by [`CronSchedule::upcoming`].
pub struct Upcoming<'a, Z: TimeZone> {
    schedule: &'a CronSchedule,
    cursor: DateTime<Z>,
}

impl<Z: TimeZone> Iterator for Upcoming<'_, Z> {
    type Item = DateTime<Z>;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.schedule.next_after(&self.cursor)?;
        self.cursor = next.clone();
        Some(next)
    }
}

/// Map a local wall-clock time to an instant: the earlier instant when the
/// time is ambiguous, the first instant after the gap when it does not exist.
fn resolve_local<Z: TimeZone>(zone: &Z, naive: NaiveDateTime) -> Option<DateTime<Z>> {
    if let Some(instant) = zone.from_local_datetime(&naive).earliest() {
        return Some(instant);
    }
    (1..=MAX_GAP_MINUTES).find_map(|m| {
        zone.from_local_datetime(&(naive + Duration::minutes(m)))
            .earliest()
    })
}

fn expand_alias(alias: &str) -> Result<&'static str> {
    match alias.to_ascii_lowercase().as_str() {
        "@hourly" => Ok("0 * * * *"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@monthly" => Ok("0 0 1 * *"),
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        _ => Err(CronError::UnknownAlias(alias.to_string())),
    }
}

fn max_days_in_month(month: u32) -> u32 {
    match month {
        2 => 29,
        4 | 6 | 9 | 11 => 30,
        _ => 31,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use chrono_tz::America::New_York;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn every_five_minutes() {
        let s = CronSchedule::parse("*/5 * * * *").unwrap();
        let runs: Vec<_> = s.upcoming(utc(2026, 3, 1, 10, 2)).take(3).collect();
        assert_eq!(
            runs,
            vec![utc(2026, 3, 1, 10, 5), utc(2026, 3, 1, 10, 10), utc(2026, 3, 1, 10, 15)]
        );
    }

    #[test]
    fn next_is_strictly_after_an_exact_match() {
        let s = CronSchedule::parse("0 2 * * *").unwrap();
        let next = s.next_after(&utc(2026, 5, 4, 2, 0)).unwrap();
        assert_eq!(next, utc(2026, 5, 5, 2, 0));
    }

    #[test]
    fn seconds_are_ignored_when_advancing() {
        let s = CronSchedule::parse("* * * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 59).unwrap();
        assert_eq!(s.next_after(&after).unwrap(), utc(2026, 1, 1, 0, 1));
    }

    #[test]
    fn aliases_expand() {
        let daily = CronSchedule::parse("@daily").unwrap();
        assert_eq!(daily.expression(), "@daily");
        assert_eq!(daily.next_after(&utc(2026, 1, 1, 5, 0)).unwrap(), utc(2026, 1, 2, 0, 0));

        let weekly = CronSchedule::parse("@weekly").unwrap();
        // 2026-01-04 is a Sunday.
        assert_eq!(weekly.next_after(&utc(2026, 1, 1, 0, 0)).unwrap(), utc(2026, 1, 4, 0, 0));

        assert!(CronSchedule::parse("@hourly").is_ok());
        assert!(CronSchedule::parse("@monthly").is_ok());
        assert!(CronSchedule::parse("@yearly").is_ok());
        assert!(matches!(
            CronSchedule::parse("@fortnightly"),
            Err(CronError::UnknownAlias(_))
        ));
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert_eq!(CronSchedule::parse("not a cron"), Err(CronError::FieldCount(3)));
        assert_eq!(CronSchedule::parse(""), Err(CronError::FieldCount(0)));
        assert!(CronSchedule::parse("0 0 * * * *").is_err());
    }

    #[test]
    fn rejects_impossible_dates() {
        assert!(matches!(
            CronSchedule::parse("0 0 31 2 *"),
            Err(CronError::NeverFires(_))
        ));
        assert!(CronSchedule::parse("0 0 30 2,4 *").is_ok());
    }

    #[test]
    fn leap_day_is_found() {
        let s = CronSchedule::parse("0 0 29 2 *").unwrap();
        assert_eq!(s.next_after(&utc(2026, 3, 1, 0, 0)).unwrap(), utc(2028, 2, 29, 0, 0));
    }

    #[test]
    fn restricted_day_fields_are_ored() {
        // The 13th or any Friday.
        let s = CronSchedule::parse("0 9 13 * 5").unwrap();
        // 2026-02-06 is a Friday, before the 13th.
        assert_eq!(s.next_after(&utc(2026, 2, 1, 0, 0)).unwrap(), utc(2026, 2, 6, 9, 0));
        assert!(s.matches_date(NaiveDate::from_ymd_opt(2026, 2, 13).unwrap()));
    }

    #[test]
    fn wildcard_weekday_requires_day_of_month() {
        let s = CronSchedule::parse("0 9 13 * *").unwrap();
        assert!(!s.matches_date(NaiveDate::from_ymd_opt(2026, 2, 6).unwrap()));
    }

    #[test]
    fn evaluates_in_the_zone_wall_clock() {
        let s = CronSchedule::parse("0 9 * * *").unwrap();
        let after = New_York.with_ymd_and_hms(2026, 1, 10, 12, 0, 0).unwrap();
        let next = s.next_after(&after).unwrap();
        // 09:00 EST is 14:00 UTC.
        assert_eq!(next.with_timezone(&Utc), utc(2026, 1, 11, 14, 0));
    }

    #[test]
    fn spring_forward_gap_fires_at_end_of_gap() {
        // 2026-03-08 02:00 EST jumps to 03:00 EDT in New York.
        let s = CronSchedule::parse("30 2 * * *").unwrap();
        let after = New_York.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap();
        let next = s.next_after(&after).unwrap();
        assert_eq!(next.with_timezone(&Utc), utc(2026, 3, 8, 7, 0));

        // The following day is back to the normal wall-clock time.
        let following = s.next_after(&next).unwrap();
        assert_eq!(following.with_timezone(&Utc), utc(2026, 3, 9, 6, 30));
    }

    #[test]
    fn gap_minutes_collapse_into_one_firing() {
        let s = CronSchedule::parse("*/15 * * * *").unwrap();
        let after = New_York.with_ymd_and_hms(2026, 3, 8, 1, 50, 0).unwrap();
        let runs: Vec<_> = s
            .upcoming(after)
            .take(3)
            .map(|t| t.with_timezone(&Utc))
            .collect();
        // 02:00..02:45 do not exist; 03:00 EDT fires once, then 03:15.
        assert_eq!(runs, vec![utc(2026, 3, 8, 7, 0), utc(2026, 3, 8, 7, 15), utc(2026, 3, 8, 7, 30)]);
    }

    #[test]
    fn fall_back_fires_on_first_occurrence_only() {
        // 2026-11-01 02:00 EDT falls back to 01:00 EST in New York.
        let s = CronSchedule::parse("30 1 * * *").unwrap();
        let after = New_York.with_ymd_and_hms(2026, 11, 1, 0, 0, 0).unwrap();
        let first = s.next_after(&after).unwrap();
        // 01:30 EDT is 05:30 UTC.
        assert_eq!(first.with_timezone(&Utc), utc(2026, 11, 1, 5, 30));

        let second = s.next_after(&first).unwrap();
        // Not 06:30 UTC (01:30 EST) but the next day.
        assert_eq!(second.with_timezone(&Utc), utc(2026, 11, 2, 6, 30));
    }

    #[test]
    fn upcoming_is_strictly_increasing() {
        let s = CronSchedule::parse("*/20 0-3 * * *").unwrap();
        let after = New_York.with_ymd_and_hms(2026, 10, 31, 23, 0, 0).unwrap();
        let runs: Vec<_> = s.upcoming(after).take(30).collect();
        assert!(runs.windows(2).all(|w| w[0] < w[1]));
    }
}
