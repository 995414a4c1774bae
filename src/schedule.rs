//! Cron-style schedules and the minute clock that fires them
//!
//! Each device registers a five-field cron expression (minute, hour,
//! day-of-month, month, day-of-week) under a name. The [`ScheduleClock`]
//! wakes on minute boundaries and emits one [`ScheduleDue`] per name per
//! matching minute:
//!
//! - ticks are duplicate-suppressed through a minute watermark, so a minute
//!   never fires twice;
//! - a backward clock jump never re-fires past minutes (the watermark stays);
//! - a forward jump emits one event per crossed matching minute, with the
//!   downstream run-once wrapper coalescing any backlog.

use chrono::{DateTime, Datelike, Duration, DurationRound, Local, Timelike};
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Upper bound on forward-jump catch-up, one day of minutes. A clock that
/// leaps further only replays the most recent day.
const MAX_CATCH_UP_MINUTES: i64 = 24 * 60;

/// One field of a cron expression.
#[derive(Clone, Debug, PartialEq, Eq)]
struct CronField {
    /// `*` or `*/1`: matches every value
    any: bool,
    values: BTreeSet<u32>,
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        self.any || self.values.contains(&value)
    }

    fn parse(field: &str, min: u32, max: u32) -> Result<Self> {
        if field == "*" {
            return Ok(Self {
                any: true,
                values: BTreeSet::new(),
            });
        }

        let mut values = BTreeSet::new();
        for part in field.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| Error::Schedule(format!("invalid step in {part:?}")))?;
                    if step == 0 {
                        return Err(Error::Schedule(format!("zero step in {part:?}")));
                    }
                    (range, step)
                }
                None => (part, 1),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                let a = parse_bound(a, min, max)?;
                let b = parse_bound(b, min, max)?;
                if a > b {
                    return Err(Error::Schedule(format!("inverted range {part:?}")));
                }
                (a, b)
            } else {
                let v = parse_bound(range, min, max)?;
                (v, v)
            };

            let mut v = start;
            while v <= end {
                values.insert(v);
                v += step;
            }
        }

        Ok(Self { any: false, values })
    }
}

fn parse_bound(raw: &str, min: u32, max: u32) -> Result<u32> {
    let value: u32 = raw
        .parse()
        .map_err(|_| Error::Schedule(format!("invalid value {raw:?}")))?;
    if value < min || value > max {
        return Err(Error::Schedule(format!(
            "value {value} outside {min}..={max}"
        )));
    }
    Ok(value)
}

/// A parsed five-field cron expression.
///
/// Fields are minute (0-59), hour (0-23), day-of-month (1-31), month (1-12),
/// and day-of-week (0-7, both 0 and 7 meaning Sunday). Lists, ranges, and
/// steps are supported. Per the classic rule, when day-of-month and
/// day-of-week are both restricted, a minute matches if *either* does.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronSchedule {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Schedule(format!(
                "expected 5 fields, got {} in {expression:?}",
                fields.len()
            )));
        }

        let mut day_of_week = CronField::parse(fields[4], 0, 7)?;
        // 7 is an alias for Sunday.
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }

        Ok(Self {
            minute: CronField::parse(fields[0], 0, 59)?,
            hour: CronField::parse(fields[1], 0, 23)?,
            day_of_month: CronField::parse(fields[2], 1, 31)?,
            month: CronField::parse(fields[3], 1, 12)?,
            day_of_week,
        })
    }
}

impl CronSchedule {
    /// Whether `now`'s minute matches this schedule.
    pub fn matches(&self, now: DateTime<Local>) -> bool {
        if !self.minute.matches(now.minute())
            || !self.hour.matches(now.hour())
            || !self.month.matches(now.month())
        {
            return false;
        }

        let dom = self.day_of_month.matches(now.day());
        let dow = self.day_of_week.matches(now.weekday().num_days_from_sunday());

        match (self.day_of_month.any, self.day_of_week.any) {
            // Both restricted: either one qualifies the day.
            (false, false) => dom || dow,
            _ => dom && dow,
        }
    }
}

/// A schedule firing: the named schedule's minute has arrived.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScheduleDue {
    /// Name the schedule was registered under
    pub name: String,
}

/// Minute-granularity clock over a set of named cron schedules.
pub struct ScheduleClock {
    schedules: RwLock<HashMap<String, CronSchedule>>,
    due_tx: mpsc::UnboundedSender<ScheduleDue>,
    cancel: CancellationToken,
    watermark: Mutex<Option<DateTime<Local>>>,
}

impl ScheduleClock {
    /// Create a clock; due events arrive on the returned receiver.
    pub fn new(cancel: CancellationToken) -> (Self, mpsc::UnboundedReceiver<ScheduleDue>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        (
            Self {
                schedules: RwLock::new(HashMap::new()),
                due_tx,
                cancel,
                watermark: Mutex::new(None),
            },
            due_rx,
        )
    }

    /// Register (or replace) a named schedule.
    pub fn add_schedule(&self, name: &str, expression: &str) -> Result<()> {
        let schedule: CronSchedule = expression.parse()?;
        if let Ok(mut map) = self.schedules.write() {
            map.insert(name.to_string(), schedule);
        }
        Ok(())
    }

    /// Remove a named schedule; pending due events are unaffected.
    pub fn remove_schedule(&self, name: &str) {
        if let Ok(mut map) = self.schedules.write() {
            map.remove(name);
        }
    }

    /// Run the clock until cancellation.
    pub async fn run(self: std::sync::Arc<Self>) {
        tracing::info!("schedule clock started");
        loop {
            let now = Local::now();
            // Wake shortly after the next minute boundary.
            let to_next = 60 - u64::from(now.second().min(59));
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(std::time::Duration::from_secs(to_next)) => {
                    self.tick(Local::now());
                }
            }
        }
        tracing::info!("schedule clock stopped");
    }

    /// Evaluate one wall-clock observation. Exposed for tests; `run` calls
    /// this once per minute boundary.
    pub fn tick(&self, now: DateTime<Local>) {
        let Ok(minute) = now.duration_trunc(Duration::minutes(1)) else {
            return;
        };

        let mut watermark = match self.watermark.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let first_unfired = match *watermark {
            // Backward jump or duplicate tick inside one minute: nothing fires.
            Some(previous) if minute <= previous => return,
            Some(previous) => {
                let behind = (minute - previous).num_minutes();
                if behind > MAX_CATCH_UP_MINUTES {
                    tracing::warn!(
                        minutes_skipped = behind - MAX_CATCH_UP_MINUTES,
                        "clock jumped forward, truncating schedule catch-up"
                    );
                    minute - Duration::minutes(MAX_CATCH_UP_MINUTES)
                } else {
                    previous + Duration::minutes(1)
                }
            }
            None => minute,
        };

        let Ok(schedules) = self.schedules.read() else {
            return;
        };
        let mut cursor = first_unfired;
        while cursor <= minute {
            for (name, schedule) in schedules.iter() {
                if schedule.matches(cursor) {
                    tracing::debug!(schedule = %name, minute = %cursor, "schedule due");
                    self.due_tx.send(ScheduleDue { name: name.clone() }).ok();
                }
            }
            cursor += Duration::minutes(1);
        }

        *watermark = Some(minute);
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 5, h, m, 0).unwrap()
    }

    #[test]
    fn parses_wildcards_steps_ranges_and_lists() {
        let schedule: CronSchedule = "*/15 8-17 1,15 * 1-5".parse().unwrap();
        // 2024-03-05 is a Tuesday (dow 2); dom 5 does not match but dow does.
        assert!(schedule.matches(at(8, 0)));
        assert!(schedule.matches(at(8, 45)));
        assert!(!schedule.matches(at(8, 7)));
        assert!(!schedule.matches(at(18, 0)));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!("* * * *".parse::<CronSchedule>().is_err());
        assert!("61 * * * *".parse::<CronSchedule>().is_err());
        assert!("*/0 * * * *".parse::<CronSchedule>().is_err());
        assert!("5-2 * * * *".parse::<CronSchedule>().is_err());
        assert!("x * * * *".parse::<CronSchedule>().is_err());
    }

    #[test]
    fn seven_aliases_sunday() {
        let schedule: CronSchedule = "0 0 * * 7".parse().unwrap();
        // 2024-03-03 is a Sunday.
        let sunday = Local.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap();
        assert!(schedule.matches(sunday));
    }

    #[test]
    fn dom_and_dow_use_or_when_both_restricted() {
        let schedule: CronSchedule = "0 0 5 * 0".parse().unwrap();
        // March 5th 2024 is a Tuesday: dom matches, dow doesn't.
        assert!(schedule.matches(Local.with_ymd_and_hms(2024, 3, 5, 0, 0, 0).unwrap()));
        // March 3rd is a Sunday: dow matches, dom doesn't.
        assert!(schedule.matches(Local.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap()));
        // March 4th is a Monday: neither matches.
        assert!(!schedule.matches(Local.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap()));
    }

    fn clock() -> (std::sync::Arc<ScheduleClock>, mpsc::UnboundedReceiver<ScheduleDue>) {
        let (clock, rx) = ScheduleClock::new(CancellationToken::new());
        (std::sync::Arc::new(clock), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ScheduleDue>) -> Vec<String> {
        let mut names = Vec::new();
        while let Ok(due) = rx.try_recv() {
            names.push(due.name);
        }
        names
    }

    #[tokio::test]
    async fn one_fire_per_matching_minute() {
        let (clock, mut rx) = clock();
        clock.add_schedule("SHELBY", "* * * * *").unwrap();

        clock.tick(at(10, 0));
        // Two observations of the same minute fire once.
        clock.tick(at(10, 0));
        assert_eq!(drain(&mut rx), vec!["SHELBY"]);

        clock.tick(at(10, 1));
        assert_eq!(drain(&mut rx), vec!["SHELBY"]);
    }

    #[tokio::test]
    async fn backward_jump_does_not_refire() {
        let (clock, mut rx) = clock();
        clock.add_schedule("SHELBY", "* * * * *").unwrap();

        clock.tick(at(10, 5));
        drain(&mut rx);

        clock.tick(at(10, 2));
        assert!(drain(&mut rx).is_empty());

        // Catching back up past the watermark fires the crossed minutes once.
        clock.tick(at(10, 6));
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[tokio::test]
    async fn forward_jump_fires_each_crossed_matching_minute() {
        let (clock, mut rx) = clock();
        clock.add_schedule("SHELBY", "*/5 * * * *").unwrap();

        clock.tick(at(10, 0));
        drain(&mut rx);

        // Jump 10:00 -> 10:17 crosses 10:05, 10:10, 10:15.
        clock.tick(at(10, 17));
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn removed_schedule_stops_firing() {
        let (clock, mut rx) = clock();
        clock.add_schedule("SHELBY", "* * * * *").unwrap();
        clock.tick(at(10, 0));
        drain(&mut rx);

        clock.remove_schedule("SHELBY");
        clock.tick(at(10, 1));
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn clock_task_stops_on_cancellation() {
        let cancel = CancellationToken::new();
        let (clock, _rx) = ScheduleClock::new(cancel.clone());
        let handle = tokio::spawn(std::sync::Arc::new(clock).run());

        cancel.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("clock should stop promptly")
            .unwrap();
    }
}
