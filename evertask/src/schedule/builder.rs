//! Fluent construction of [`super::RecurringSchedule`] values, mirroring
//! the ergonomics of the teacher's `ScheduleOptions` builder
//! (`kernel/jobs/manager.rs`) without needing its `TypedBuilder` macro,
//! since the schedule descriptor is a closed enum rather than an
//! open struct of optional fields.

use chrono::{NaiveTime, Weekday};
use serde::{Deserialize, Serialize};

use super::RecurringSchedule;

/// Which day within a month a monthly/yearly schedule fires on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonthDay {
    /// Fixed day-of-month (1-31); months shorter than this are skipped.
    DayOfMonth(u32),
    /// The Nth occurrence (1-based, or 5 for "last") of a weekday in the month.
    NthWeekday(u32, Weekday),
}

impl MonthDay {
    pub fn resolve(&self, year: i32, month: u32) -> Option<chrono::NaiveDate> {
        match self {
            MonthDay::DayOfMonth(d) => chrono::NaiveDate::from_ymd_opt(year, month, *d),
            MonthDay::NthWeekday(n, weekday) => nth_weekday_of_month(year, month, *n, *weekday),
        }
    }
}

fn nth_weekday_of_month(year: i32, month: u32, n: u32, weekday: Weekday) -> Option<chrono::NaiveDate> {
    use chrono::Datelike;

    let first = chrono::NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset = (7 + weekday.num_days_from_monday() as i64 - first.weekday().num_days_from_monday() as i64) % 7;
    let first_match = first + chrono::Duration::days(offset);

    if n == 5 {
        // "Last" occurrence: step forward by weeks while still in-month.
        let mut candidate = first_match;
        loop {
            let next = candidate + chrono::Duration::weeks(1);
            if next.month() != month {
                return Some(candidate);
            }
            candidate = next;
        }
    }
    let candidate = first_match + chrono::Duration::weeks(i64::from(n - 1));
    if candidate.month() == month {
        Some(candidate)
    } else {
        None
    }
}

/// Fluent entry point for building a [`RecurringSchedule`] without hand
/// assembling enum variants, e.g. `ScheduleBuilder::every_days(1).at(&[t]).build()`.
pub struct ScheduleBuilder;

impl ScheduleBuilder {
    pub fn cron(expression: &str) -> Result<RecurringSchedule, String> {
        RecurringSchedule::cron(expression)
    }

    pub fn every_seconds(n: u32) -> RecurringSchedule {
        RecurringSchedule::EverySeconds(n)
    }

    pub fn every_minutes(n: u32) -> EveryMinutesBuilder {
        EveryMinutesBuilder { n, at_second: None }
    }

    pub fn every_hours(n: u32) -> EveryHoursBuilder {
        EveryHoursBuilder { n, at_minute: None }
    }

    pub fn every_days(n: u32) -> DailyBuilder {
        DailyBuilder { n, times: Vec::new() }
    }

    pub fn every_weeks(n: u32, weekdays: Vec<Weekday>) -> WeeklyBuilder {
        WeeklyBuilder {
            n,
            weekdays,
            times: Vec::new(),
        }
    }

    pub fn on_specific_days_of_week(weekdays: Vec<Weekday>) -> WeeklyBuilder {
        WeeklyBuilder {
            n: 1,
            weekdays,
            times: Vec::new(),
        }
    }

    pub fn every_months(n: u32, day: MonthDay) -> MonthlyBuilder {
        MonthlyBuilder { n, day, times: Vec::new() }
    }

    pub fn on_specific_months(months: Vec<u32>, day: MonthDay) -> SpecificMonthsBuilder {
        SpecificMonthsBuilder { months, day, times: Vec::new() }
    }
}

pub struct EveryMinutesBuilder {
    n: u32,
    at_second: Option<u32>,
}

impl EveryMinutesBuilder {
    pub fn at_second(mut self, second: u32) -> Self {
        self.at_second = Some(second);
        self
    }

    pub fn build(self) -> RecurringSchedule {
        RecurringSchedule::EveryMinutes {
            n: self.n,
            at_second: self.at_second,
        }
    }
}

pub struct EveryHoursBuilder {
    n: u32,
    at_minute: Option<u32>,
}

impl EveryHoursBuilder {
    pub fn at_minute(mut self, minute: u32) -> Self {
        self.at_minute = Some(minute);
        self
    }

    pub fn build(self) -> RecurringSchedule {
        RecurringSchedule::EveryHours {
            n: self.n,
            at_minute: self.at_minute,
        }
    }
}

pub struct DailyBuilder {
    n: u32,
    times: Vec<NaiveTime>,
}

impl DailyBuilder {
    pub fn at(mut self, times: &[NaiveTime]) -> Self {
        self.times.extend_from_slice(times);
        self
    }

    pub fn build(self) -> RecurringSchedule {
        RecurringSchedule::EveryDays {
            n: self.n,
            times: self.times,
        }
    }
}

pub struct WeeklyBuilder {
    n: u32,
    weekdays: Vec<Weekday>,
    times: Vec<NaiveTime>,
}

impl WeeklyBuilder {
    pub fn at(mut self, times: &[NaiveTime]) -> Self {
        self.times.extend_from_slice(times);
        self
    }

    pub fn build(self) -> RecurringSchedule {
        if self.n == 1 {
            // on_specific_days_of_week and every_weeks(1, ..) are the same descriptor.
            RecurringSchedule::OnSpecificDaysOfWeek {
                weekdays: self.weekdays,
                times: self.times,
            }
        } else {
            RecurringSchedule::EveryWeeks {
                n: self.n,
                weekdays: self.weekdays,
                times: self.times,
            }
        }
    }
}

pub struct MonthlyBuilder {
    n: u32,
    day: MonthDay,
    times: Vec<NaiveTime>,
}

impl MonthlyBuilder {
    pub fn at(mut self, times: &[NaiveTime]) -> Self {
        self.times.extend_from_slice(times);
        self
    }

    pub fn build(self) -> RecurringSchedule {
        RecurringSchedule::EveryMonths {
            n: self.n,
            day: self.day,
            times: self.times,
        }
    }
}

pub struct SpecificMonthsBuilder {
    months: Vec<u32>,
    day: MonthDay,
    times: Vec<NaiveTime>,
}

impl SpecificMonthsBuilder {
    pub fn at(mut self, times: &[NaiveTime]) -> Self {
        self.times.extend_from_slice(times);
        self
    }

    pub fn build(self) -> RecurringSchedule {
        RecurringSchedule::OnSpecificMonths {
            months: self.months,
            day: self.day,
            times: self.times,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, NaiveDate};

    #[test]
    fn day_of_month_resolves_when_in_range() {
        let day = MonthDay::DayOfMonth(15);
        assert_eq!(day.resolve(2024, 2), NaiveDate::from_ymd_opt(2024, 2, 15));
    }

    #[test]
    fn day_of_month_out_of_range_is_none() {
        let day = MonthDay::DayOfMonth(30);
        assert_eq!(day.resolve(2024, 2), None);
    }

    #[test]
    fn nth_weekday_first_monday() {
        let day = MonthDay::NthWeekday(1, Weekday::Mon);
        let resolved = day.resolve(2024, 1).unwrap();
        assert_eq!(resolved, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
        assert_eq!(resolved.weekday(), Weekday::Mon);
    }

    #[test]
    fn nth_weekday_last_friday() {
        let day = MonthDay::NthWeekday(5, Weekday::Fri);
        let resolved = day.resolve(2024, 1).unwrap();
        assert_eq!(resolved, NaiveDate::from_ymd_opt(2024, 1, 26).unwrap());
    }

    #[test]
    fn builder_produces_expected_variant() {
        let times = [NaiveTime::from_hms_opt(9, 0, 0).unwrap()];
        let sched = ScheduleBuilder::every_days(1).at(&times).build();
        matches!(sched, RecurringSchedule::EveryDays { .. });
    }

    #[test]
    fn weekly_builder_with_stride_one_becomes_specific_days() {
        let sched = ScheduleBuilder::on_specific_days_of_week(vec![Weekday::Mon]).build();
        assert!(matches!(sched, RecurringSchedule::OnSpecificDaysOfWeek { .. }));
    }
}
