use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::error::{SyncError, SyncResult};

/// Parsed cron expression
///
/// Five-field expressions use Unix crontab semantics: minute precision and
/// day-of-week `0`-`7` with both `0` and `7` meaning Sunday. They are
/// rewritten into the `cron` crate's dialect (leading seconds field,
/// `1` = Sunday). Six/seven-field expressions (seconds, optional year) are
/// passed through in that dialect unchanged.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> SyncResult<Self> {
        let trimmed = expression.trim();
        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = match fields.as_slice() {
            [minute, hour, dom, month, dow] => {
                format!("0 {} {} {} {} {}", minute, hour, dom, month, unix_weekdays(dow, expression)?)
            },
            _ => trimmed.to_string(),
        };
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| SyncError::config(format!("Invalid cron expression '{}': {}", expression, e)))?;
        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

/// Shift numeric Unix weekdays (`0`/`7` = Sunday) to `1` = Sunday
///
/// Names (`MON-FRI`), `*` and `?` are left alone. A range ending on `7`
/// wraps back to Sunday, so `5-7` becomes `6-7,1`.
fn unix_weekdays(field: &str, expression: &str) -> SyncResult<String> {
    let invalid = || SyncError::config(format!("Invalid day-of-week in cron expression '{}'", expression));
    let day = |part: &str| -> SyncResult<Option<u8>> {
        if !part.chars().all(|c| c.is_ascii_digit()) {
            return Ok(None);
        }
        match part.parse::<u8>() {
            Ok(n) if n <= 7 => Ok(Some(n)),
            _ => Err(invalid()),
        }
    };
    let shift = |n: u8| if n == 7 { 1 } else { n + 1 };

    let mut items = Vec::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(step)),
            None => (item, None),
        };
        let step_suffix = step.map(|s| format!("/{}", s)).unwrap_or_default();

        let mapped = match range.split_once('-') {
            Some((start, end)) => match (day(start)?, day(end)?) {
                (Some(0), Some(7)) => format!("1-7{}", step_suffix),
                (Some(start), Some(7)) if step.is_none() => format!("{}-7,1", shift(start)),
                (Some(_), Some(7)) => return Err(invalid()),
                (Some(start), Some(end)) => format!("{}-{}{}", shift(start), shift(end), step_suffix),
                _ => item.to_string(),
            },
            None => match day(range)? {
                Some(n) => format!("{}{}", shift(n), step_suffix),
                None => item.to_string(),
            },
        };
        items.push(mapped);
    }
    Ok(items.join(","))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_five_field_expression() {
        let schedule = CronSchedule::parse("*/15 * * * *").unwrap();
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 10, 7, 30).unwrap();
        assert_eq!(
            schedule.next_after(now),
            Some(Utc.with_ymd_and_hms(2026, 4, 1, 10, 15, 0).unwrap())
        );
    }

    #[test]
    fn test_next_is_strictly_after() {
        let schedule = CronSchedule::parse("0 0 * * * *").unwrap();
        let on_the_hour = Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap();
        assert_eq!(
            schedule.next_after(on_the_hour),
            Some(Utc.with_ymd_and_hms(2026, 4, 1, 11, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_five_field_weekdays_follow_crontab() {
        // Wednesday
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 10, 0, 0).unwrap();
        let at_nine = |day| Some(Utc.with_ymd_and_hms(2026, 4, day, 9, 0, 0).unwrap());

        assert_eq!(CronSchedule::parse("0 9 * * 1").unwrap().next_after(now), at_nine(6));
        assert_eq!(CronSchedule::parse("0 9 * * 0").unwrap().next_after(now), at_nine(5));
        assert_eq!(CronSchedule::parse("0 9 * * 7").unwrap().next_after(now), at_nine(5));
        assert_eq!(CronSchedule::parse("0 9 * * MON").unwrap().next_after(now), at_nine(6));

        let friday = Utc.with_ymd_and_hms(2026, 4, 3, 10, 0, 0).unwrap();
        assert_eq!(CronSchedule::parse("0 9 * * 1-5").unwrap().next_after(friday), at_nine(6));
        assert_eq!(CronSchedule::parse("0 9 * * 5-7").unwrap().next_after(friday), at_nine(4));
    }

    #[test]
    fn test_weekday_field_translation() {
        assert_eq!(unix_weekdays("*", "").unwrap(), "*");
        assert_eq!(unix_weekdays("0,6", "").unwrap(), "1,7");
        assert_eq!(unix_weekdays("1-5/2", "").unwrap(), "2-6/2");
        assert_eq!(unix_weekdays("5-7", "").unwrap(), "6-7,1");
        assert!(unix_weekdays("8", "").is_err());
    }

    #[test]
    fn test_invalid_expression() {
        assert!(matches!(CronSchedule::parse("every tuesday"), Err(SyncError::Config(_))));
    }
}
