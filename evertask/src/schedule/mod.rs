//! Recurring schedule descriptors and the drift-free rescheduling algorithm.
//!
//! Grounded on the teacher's `Job::calculate_next_run_at_from_frequency` /
//! `find_next_run_time` (`kernel/jobs/job.rs`), which recomputes a next
//! run from a stored frequency, generalized here into a closed descriptor
//! type with a pure `next()` and the skip-tracking loop spec.md requires
//! (§4.3) that the teacher's simpler RRULE recompute does not have.

mod builder;
mod cron;

pub use builder::{MonthDay, ScheduleBuilder};
pub use cron::CronSchedule;

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Safety bound on [`RecurringSchedule::next_valid`]'s skip loop (§4.3).
pub const MAX_SKIPS: u32 = 1000;

/// A recurring schedule descriptor (spec.md §3.2).
///
/// Each variant is a pure, deterministic, total function of a reference
/// instant via [`RecurringSchedule::next`]; it never reads wall-clock time
/// itself and has no side effects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecurringSchedule {
    Cron(CronSchedule),
    EverySeconds(u32),
    EveryMinutes { n: u32, at_second: Option<u32> },
    EveryHours { n: u32, at_minute: Option<u32> },
    EveryDays { n: u32, times: Vec<NaiveTime> },
    EveryWeeks { n: u32, weekdays: Vec<Weekday>, times: Vec<NaiveTime> },
    EveryMonths { n: u32, day: MonthDay, times: Vec<NaiveTime> },
    OnSpecificDaysOfWeek { weekdays: Vec<Weekday>, times: Vec<NaiveTime> },
    OnSpecificMonths { months: Vec<u32>, day: MonthDay, times: Vec<NaiveTime> },
}

impl RecurringSchedule {
    pub fn cron(expression: &str) -> Result<Self, String> {
        Ok(RecurringSchedule::Cron(CronSchedule::parse(expression)?))
    }

    /// Smallest instant strictly greater than `from` satisfying this
    /// schedule, or `None` if the schedule is exhausted/misconfigured
    /// (spec §3.2, §9 zero-period note).
    pub fn next(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RecurringSchedule::Cron(c) => c.next(from),
            RecurringSchedule::EverySeconds(n) => step_next(from, Duration::seconds(i64::from(*n))),
            RecurringSchedule::EveryMinutes { n, at_second } => {
                next_every_unit(from, Duration::minutes(i64::from(*n)), *at_second, |dt, s| {
                    dt.with_second(s).and_then(|d| d.with_nanosecond(0))
                })
            }
            RecurringSchedule::EveryHours { n, at_minute } => {
                next_every_unit(from, Duration::hours(i64::from(*n)), *at_minute, |dt, m| {
                    dt.with_minute(m).and_then(|d| d.with_second(0)).and_then(|d| d.with_nanosecond(0))
                })
            }
            RecurringSchedule::EveryDays { n, times } => next_day_stepped(from, *n, times),
            RecurringSchedule::EveryWeeks { n, weekdays, times } => {
                next_weekly(from, *n, weekdays, times)
            }
            RecurringSchedule::EveryMonths { n, day, times } => next_monthly(from, *n, day, times),
            RecurringSchedule::OnSpecificDaysOfWeek { weekdays, times } => {
                next_weekly(from, 1, weekdays, times)
            }
            RecurringSchedule::OnSpecificMonths { months, day, times } => {
                next_specific_months(from, months, day, times)
            }
        }
    }

    /// Drift-free rescheduling (spec §4.3): advances from `from_scheduled`
    /// (the *intended* time of the run that just finished, not its actual
    /// completion time) past any occurrences already missed relative to
    /// `now`, returning the next future occurrence and the list skipped
    /// along the way.
    pub fn next_valid(
        &self,
        from_scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> (Option<DateTime<Utc>>, Vec<DateTime<Utc>>) {
        let mut skipped = Vec::new();
        let mut candidate = self.next(from_scheduled);
        let mut skips = 0u32;
        while let Some(c) = candidate {
            if c >= now || skips >= MAX_SKIPS {
                break;
            }
            skipped.push(c);
            skips += 1;
            candidate = self.next(c);
        }
        (candidate, skipped)
    }
}

/// First-occurrence rule for a freshly dispatched recurring (or delayed)
/// task (spec §4.9 step 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirstOccurrence {
    RunNow,
    RunDelayed(std::time::Duration),
    RunAt(DateTime<Utc>),
    /// First occurrence is whatever the schedule's own `next(now)` produces.
    ScheduleNext,
}

fn step_next(from: DateTime<Utc>, period: Duration) -> Option<DateTime<Utc>> {
    if period <= Duration::zero() {
        return None;
    }
    from.checked_add_signed(period)
}

/// Shared stepping helper for `EveryMinutes`/`EveryHours`: step by `n`
/// units of `period`, then snap to the configured sub-field (`at_second`/
/// `at_minute`) if one was given.
fn next_every_unit(
    from: DateTime<Utc>,
    period: Duration,
    at_sub_field: Option<u32>,
    snap: impl Fn(DateTime<Utc>, u32) -> Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    let stepped = step_next(from, period)?;
    match at_sub_field {
        Some(sub) => snap(stepped, sub),
        None => Some(stepped),
    }
}

fn next_day_stepped(from: DateTime<Utc>, n: u32, times: &[NaiveTime]) -> Option<DateTime<Utc>> {
    if n == 0 || times.is_empty() {
        return None;
    }
    let mut sorted_times = times.to_vec();
    sorted_times.sort();

    // First try the remaining times-of-day on `from`'s own date.
    for t in &sorted_times {
        let candidate = combine(from.date_naive(), *t)?;
        if candidate > from {
            return Some(candidate);
        }
    }
    let next_date = from.date_naive() + Duration::days(i64::from(n));
    combine(next_date, sorted_times[0])
}

fn next_weekly(
    from: DateTime<Utc>,
    n: u32,
    weekdays: &[Weekday],
    times: &[NaiveTime],
) -> Option<DateTime<Utc>> {
    if n == 0 || weekdays.is_empty() || times.is_empty() {
        return None;
    }
    let mut sorted_times = times.to_vec();
    sorted_times.sort();

    // Search day by day, respecting an `n`-week stride measured from
    // `from`'s own week (ISO week starting Monday).
    let base_week_start = from.date_naive() - Duration::days(i64::from(from.weekday().num_days_from_monday()));
    let mut date = from.date_naive();
    for _ in 0..(7 * n as i64 * 4 + 7) {
        if weekdays.contains(&date.weekday()) {
            let week_start = date - Duration::days(i64::from(date.weekday().num_days_from_monday()));
            let weeks_elapsed = (week_start - base_week_start).num_days() / 7;
            if weeks_elapsed % i64::from(n) == 0 {
                for t in &sorted_times {
                    if let Some(candidate) = combine(date, *t) {
                        if candidate > from {
                            return Some(candidate);
                        }
                    }
                }
            }
        }
        date += Duration::days(1);
    }
    None
}

fn next_monthly(from: DateTime<Utc>, n: u32, day: &MonthDay, times: &[NaiveTime]) -> Option<DateTime<Utc>> {
    if n == 0 || times.is_empty() {
        return None;
    }
    let mut sorted_times = times.to_vec();
    sorted_times.sort();

    let mut year = from.year();
    let mut month = from.month();
    for _ in 0..120 {
        if let Some(date) = day.resolve(year, month) {
            for t in &sorted_times {
                if let Some(candidate) = combine(date, *t) {
                    if candidate > from {
                        return Some(candidate);
                    }
                }
            }
        }
        for _ in 0..n {
            if month == 12 {
                month = 1;
                year += 1;
            } else {
                month += 1;
            }
        }
    }
    None
}

fn next_specific_months(
    from: DateTime<Utc>,
    months: &[u32],
    day: &MonthDay,
    times: &[NaiveTime],
) -> Option<DateTime<Utc>> {
    if months.is_empty() || times.is_empty() {
        return None;
    }
    let mut sorted_times = times.to_vec();
    sorted_times.sort();
    let mut sorted_months = months.to_vec();
    sorted_months.sort_unstable();

    let mut year = from.year();
    for _ in 0..20 {
        for &month in &sorted_months {
            if let Some(date) = day.resolve(year, month) {
                for t in &sorted_times {
                    if let Some(candidate) = combine(date, *t) {
                        if candidate > from {
                            return Some(candidate);
                        }
                    }
                }
            }
        }
        year += 1;
    }
    None
}

fn combine(date: chrono::NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&date.and_time(time)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn s1_drift_free_no_skip() {
        // spec.md S1: hourly at :00, scheduled 02:00, executes finishing 02:45.
        let sched = RecurringSchedule::cron("0 * * * *").unwrap();
        let base = at(2024, 1, 1, 2, 0);
        let now = at(2024, 1, 1, 2, 45);
        let (next, skipped) = sched.next_valid(base, now);
        assert_eq!(next, Some(at(2024, 1, 1, 3, 0)));
        assert!(skipped.is_empty());
    }

    #[test]
    fn s2_skip_after_downtime() {
        // spec.md S2: same schedule, engine resumes at 05:30.
        let sched = RecurringSchedule::cron("0 * * * *").unwrap();
        let base = at(2024, 1, 1, 2, 0);
        let now = at(2024, 1, 1, 5, 30);
        let (next, skipped) = sched.next_valid(base, now);
        assert_eq!(next, Some(at(2024, 1, 1, 6, 0)));
        assert_eq!(
            skipped,
            vec![at(2024, 1, 1, 3, 0), at(2024, 1, 1, 4, 0), at(2024, 1, 1, 5, 0)]
        );
    }

    #[test]
    fn every_seconds_steps_forward() {
        let sched = RecurringSchedule::EverySeconds(30);
        let from = at(2024, 1, 1, 0, 0);
        assert_eq!(sched.next(from), Some(from + Duration::seconds(30)));
    }

    #[test]
    fn zero_period_schedule_yields_none() {
        // spec.md §9: a zero-period descriptor is treated as misconfiguration.
        let sched = RecurringSchedule::EverySeconds(0);
        assert_eq!(sched.next(at(2024, 1, 1, 0, 0)), None);
    }

    #[test]
    fn every_days_picks_next_time_of_day() {
        let times = vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap(), NaiveTime::from_hms_opt(17, 0, 0).unwrap()];
        let sched = RecurringSchedule::EveryDays { n: 1, times };
        let next = sched.next(at(2024, 1, 1, 10, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 1, 17, 0));
    }

    #[test]
    fn every_days_rolls_to_next_period_when_all_times_passed() {
        let times = vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap()];
        let sched = RecurringSchedule::EveryDays { n: 2, times };
        let next = sched.next(at(2024, 1, 1, 10, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 3, 9, 0));
    }

    #[test]
    fn every_weeks_respects_stride() {
        let times = vec![NaiveTime::from_hms_opt(9, 0, 0).unwrap()];
        let sched = RecurringSchedule::EveryWeeks {
            n: 2,
            weekdays: vec![Weekday::Mon],
            times,
        };
        // 2024-01-01 is a Monday (week 0); next should skip a week.
        let next = sched.next(at(2024, 1, 1, 9, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 15, 9, 0));
    }

    #[test]
    fn next_valid_respects_max_skips_bound() {
        let sched = RecurringSchedule::EverySeconds(1);
        let base = at(2024, 1, 1, 0, 0);
        let now = base + Duration::seconds(10_000);
        let (next, skipped) = sched.next_valid(base, now);
        assert_eq!(skipped.len() as u32, MAX_SKIPS);
        assert!(next.unwrap() < now);
    }
}
