use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{CronError, Result};
use crate::schedule::CronSchedule;

/// Resolve an IANA zone name such as `Europe/Berlin`.
pub fn parse_zone(name: &str) -> Result<Tz> {
    name.trim()
        .parse::<Tz>()
        .map_err(|_| CronError::UnknownZone(name.to_string()))
}

/// Lenient variant used when loading stored rows: unknown names fall back
/// to UTC.
pub fn zone_or_utc(name: &str) -> Tz {
    parse_zone(name).unwrap_or(Tz::UTC)
}

/// The next `count` firings of `schedule` in `zone` after `after`, as UTC.
pub fn next_runs(
    schedule: &CronSchedule,
    zone: Tz,
    after: DateTime<Utc>,
    count: usize,
) -> Vec<DateTime<Utc>> {
    schedule
        .upcoming(after.with_timezone(&zone))
        .take(count)
        .map(|t| t.with_timezone(&Utc))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parses_known_zones() {
        assert_eq!(parse_zone("America/New_York").unwrap(), Tz::America__New_York);
        assert_eq!(parse_zone("UTC").unwrap(), Tz::UTC);
    }

    #[test]
    fn unknown_zone_is_an_error_or_utc() {
        assert!(matches!(parse_zone("Mars/Olympus"), Err(CronError::UnknownZone(_))));
        assert_eq!(zone_or_utc("Mars/Olympus"), Tz::UTC);
    }

    #[test]
    fn next_runs_are_daily_in_zone() {
        let s = CronSchedule::parse("0 2 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let runs = next_runs(&s, parse_zone("Europe/Berlin").unwrap(), after, 5);
        assert_eq!(runs.len(), 5);
        // 02:00 CEST is 00:00 UTC.
        assert_eq!(runs[0], Utc.with_ymd_and_hms(2026, 6, 2, 0, 0, 0).unwrap());
        for pair in runs.windows(2) {
            assert_eq!(pair[1] - pair[0], chrono::Duration::days(1));
        }
    }
}
