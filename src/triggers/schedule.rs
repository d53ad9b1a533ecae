//! Schedule trigger watcher.
//!
//! Every firing re-arms itself with a single-shot sleep instead of a fixed
//! interval, so a slow handler cannot compound drift. Cron-like schedules
//! wake every 60s and test the expression against the configured timezone.

use crate::triggers::TriggerFire;
use crate::workflow::runner::StartContext;
use crate::workflow::schema::{ScheduleMode, ScheduleTimezone, ScheduleTriggerConfig, Trigger};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, TimeZone, Timelike, Utc};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Cadence of cron-expression checks.
const CRON_TICK: Duration = Duration::from_secs(60);

/// Watcher loop for one schedule trigger. Runs until the task is aborted.
pub(crate) async fn watch(
    workflow_id: String,
    trigger: Trigger,
    cfg: ScheduleTriggerConfig,
    fire: Arc<TriggerFire>,
) {
    let cron = cfg
        .cron_expression
        .as_deref()
        .and_then(|expr| CronExpression::parse(expr).ok());

    loop {
        let delay = next_delay(&cfg);
        let jitter = if cfg.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=cfg.jitter_ms)
        } else {
            0
        };
        tokio::time::sleep(delay + Duration::from_millis(jitter)).await;

        if cfg.mode == ScheduleMode::CronLike {
            let matches = match &cron {
                Some(expr) => match cfg.timezone {
                    ScheduleTimezone::Utc => expr.matches(&Utc::now()),
                    ScheduleTimezone::Local => expr.matches(&Local::now()),
                },
                None => false,
            };
            if !matches {
                continue;
            }
        }

        fire.fire(&workflow_id, &trigger, StartContext::default());
    }
}

/// Delay until the next wake-up for a schedule config.
fn next_delay(cfg: &ScheduleTriggerConfig) -> Duration {
    match cfg.mode {
        ScheduleMode::EveryMinutes => {
            Duration::from_millis((cfg.every_minutes.unwrap_or(1).max(1)) * 60_000)
        }
        ScheduleMode::EveryMs => Duration::from_millis(cfg.every_ms.unwrap_or(0).max(10)),
        ScheduleMode::DailyAt => {
            let time = cfg.daily_time.as_deref().unwrap_or("09:00");
            match cfg.timezone {
                ScheduleTimezone::Utc => delay_until_daily(&Utc::now(), time),
                ScheduleTimezone::Local => delay_until_daily(&Local::now(), time),
            }
        }
        ScheduleMode::CronLike => CRON_TICK,
    }
}

/// Parse "HH:MM" into (hour, minute).
pub fn parse_daily_time(time: &str) -> Option<(u32, u32)> {
    let (hour, minute) = time.trim().split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    if hour > 23 || minute > 59 {
        return None;
    }
    Some((hour, minute))
}

/// Delay until the next HH:MM occurrence in `now`'s timezone, rolling to
/// tomorrow when today's slot has passed.
fn delay_until_daily<Tz: TimeZone>(now: &DateTime<Tz>, time: &str) -> Duration {
    let Some((hour, minute)) = parse_daily_time(time) else {
        return Duration::from_secs(60);
    };
    let mut next = now
        .with_hour(hour)
        .and_then(|t| t.with_minute(minute))
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or_else(|| now.clone());
    if next <= *now {
        next = next + ChronoDuration::days(1);
    }
    (next - now.clone()).to_std().unwrap_or(Duration::from_secs(60))
}

/// A 5-field cron expression (minute, hour, day-of-month, month,
/// day-of-week) supporting `*`, `*/n`, comma lists, and ranges.
#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

#[derive(Debug, Clone)]
enum CronField {
    Any,
    Step(u32),
    List(Vec<CronEntry>),
}

#[derive(Debug, Clone)]
enum CronEntry {
    Value(u32),
    Range(u32, u32),
}

impl CronExpression {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let parts: Vec<&str> = expr.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(format!(
                "Cron expression must have 5 fields, got {}",
                parts.len()
            ));
        }
        Ok(Self {
            minute: CronField::parse(parts[0])?,
            hour: CronField::parse(parts[1])?,
            day_of_month: CronField::parse(parts[2])?,
            month: CronField::parse(parts[3])?,
            day_of_week: CronField::parse(parts[4])?,
        })
    }

    /// Match against a timestamp in its own timezone. Day-of-week uses
    /// 0 = Sunday.
    pub fn matches<Tz: TimeZone>(&self, at: &DateTime<Tz>) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day_of_month.matches(at.day())
            && self.month.matches(at.month())
            && self.day_of_week.matches(at.weekday().num_days_from_sunday())
    }
}

impl CronField {
    fn parse(field: &str) -> Result<Self, String> {
        if field == "*" {
            return Ok(CronField::Any);
        }
        if let Some(step) = field.strip_prefix("*/") {
            let step: u32 = step
                .parse()
                .map_err(|_| format!("Invalid cron step: {field}"))?;
            if step == 0 {
                return Err("Cron step must be positive".to_string());
            }
            return Ok(CronField::Step(step));
        }
        let entries = field
            .split(',')
            .map(|token| {
                if let Some((start, end)) = token.split_once('-') {
                    let start: u32 = start
                        .parse()
                        .map_err(|_| format!("Invalid cron range: {token}"))?;
                    let end: u32 = end
                        .parse()
                        .map_err(|_| format!("Invalid cron range: {token}"))?;
                    Ok(CronEntry::Range(start, end))
                } else {
                    token
                        .parse()
                        .map(CronEntry::Value)
                        .map_err(|_| format!("Invalid cron value: {token}"))
                }
            })
            .collect::<Result<Vec<_>, String>>()?;
        if entries.is_empty() {
            return Err("Empty cron field".to_string());
        }
        Ok(CronField::List(entries))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Step(step) => value % step == 0,
            CronField::List(entries) => entries.iter().any(|entry| match entry {
                CronEntry::Value(v) => *v == value,
                CronEntry::Range(start, end) => value >= *start && value <= *end,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // 2026-03-04 is a Wednesday.
        Utc.with_ymd_and_hms(2026, 3, 4, h, m, 0).unwrap()
    }

    #[test]
    fn test_cron_every_15_minutes() {
        let expr = CronExpression::parse("*/15 * * * *").unwrap();
        for minute in 0..60 {
            let expected = minute % 15 == 0;
            assert_eq!(
                expr.matches(&at(10, minute)),
                expected,
                "minute {minute}"
            );
        }
    }

    #[test]
    fn test_cron_lists_and_ranges() {
        let expr = CronExpression::parse("0 9-17 * * 1,3,5").unwrap();
        assert!(expr.matches(&at(9, 0)));
        assert!(expr.matches(&at(17, 0)));
        assert!(!expr.matches(&at(18, 0)));
        assert!(!expr.matches(&at(9, 5)));

        // 2026-03-08 is a Sunday.
        let sunday = Utc.with_ymd_and_hms(2026, 3, 8, 9, 0, 0).unwrap();
        assert!(!expr.matches(&sunday));
    }

    #[test]
    fn test_cron_parse_errors() {
        assert!(CronExpression::parse("* * * *").is_err());
        assert!(CronExpression::parse("*/0 * * * *").is_err());
        assert!(CronExpression::parse("a * * * *").is_err());
    }

    #[test]
    fn test_parse_daily_time() {
        assert_eq!(parse_daily_time("09:30"), Some((9, 30)));
        assert_eq!(parse_daily_time("23:59"), Some((23, 59)));
        assert_eq!(parse_daily_time("24:00"), None);
        assert_eq!(parse_daily_time("9"), None);
    }

    #[test]
    fn test_delay_until_daily_rolls_over() {
        let now = Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap();

        let later_today = delay_until_daily(&now, "10:30");
        assert_eq!(later_today, Duration::from_secs(30 * 60));

        let tomorrow = delay_until_daily(&now, "09:00");
        assert_eq!(tomorrow, Duration::from_secs(23 * 3600));
    }

    #[test]
    fn test_next_delay_floors() {
        let cfg = ScheduleTriggerConfig {
            mode: ScheduleMode::EveryMs,
            every_minutes: None,
            every_ms: Some(1),
            daily_time: None,
            cron_expression: None,
            timezone: ScheduleTimezone::Local,
            jitter_ms: 0,
        };
        assert_eq!(next_delay(&cfg), Duration::from_millis(10));

        let cfg = ScheduleTriggerConfig {
            mode: ScheduleMode::EveryMinutes,
            every_minutes: Some(0),
            every_ms: None,
            daily_time: None,
            cron_expression: None,
            timezone: ScheduleTimezone::Local,
            jitter_ms: 0,
        };
        assert_eq!(next_delay(&cfg), Duration::from_secs(60));
    }
}
