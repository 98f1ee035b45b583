//! Five-field Unix cron parsing and occurrence search.
//!
//! The teacher depends on `tokio-cron-scheduler`, whose `cron` crate
//! backend parses the 6-7 field "seconds-first" dialect
//! (`scheduled_tasks.rs` uses `"0 0 * * * *"`). spec.md calls for the
//! five-field Unix form (minute hour day-of-month month day-of-week), so
//! this parser is hand-written rather than bent onto the wrong dialect.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// A single cron field: either the literal wildcard `*`, or an explicit
/// set of accepted values (from a number, a `a-b` range, a `*/n` step, or
/// a comma list of any of those).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Field {
    wildcard: bool,
    values: Vec<u32>,
}

impl Field {
    fn contains(&self, v: u32) -> bool {
        self.wildcard || self.values.contains(&v)
    }

    fn parse(raw: &str, min: u32, max: u32) -> Result<Field, String> {
        if raw == "*" {
            return Ok(Field {
                wildcard: true,
                values: (min..=max).collect(),
            });
        }
        let mut values = Vec::new();
        for part in raw.split(',') {
            values.extend(Self::parse_part(part, min, max)?);
        }
        values.sort_unstable();
        values.dedup();
        if values.is_empty() {
            return Err(format!("cron field {raw:?} produced no values"));
        }
        for v in &values {
            if *v < min || *v > max {
                return Err(format!("cron field {raw:?} out of range [{min}, {max}]"));
            }
        }
        Ok(Field {
            wildcard: false,
            values,
        })
    }

    fn parse_part(part: &str, min: u32, max: u32) -> Result<Vec<u32>, String> {
        let (range_part, step) = match part.split_once('/') {
            Some((r, s)) => (
                r,
                s.parse::<u32>()
                    .map_err(|_| format!("invalid step {s:?} in {part:?}"))?,
            ),
            None => (part, 1),
        };
        if step == 0 {
            return Err(format!("step of zero in {part:?}"));
        }
        let (lo, hi) = if range_part == "*" {
            (min, max)
        } else if let Some((a, b)) = range_part.split_once('-') {
            let a: u32 = a.parse().map_err(|_| format!("invalid range start in {part:?}"))?;
            let b: u32 = b.parse().map_err(|_| format!("invalid range end in {part:?}"))?;
            if a > b {
                return Err(format!("range start after end in {part:?}"));
            }
            (a, b)
        } else {
            let v: u32 = range_part
                .parse()
                .map_err(|_| format!("invalid value {range_part:?}"))?;
            (v, v)
        };
        Ok((lo..=hi).step_by(step as usize).collect())
    }
}

/// A parsed five-field cron expression, evaluated against UTC instants.
///
/// Day-of-month and day-of-week combine with the standard cron OR rule:
/// if *both* fields are restricted (neither is a literal `*`), a day
/// matches when either field matches; if only one is restricted, that
/// field alone decides; if neither is restricted, every day matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronSchedule {
    expression: String,
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

/// Upper bound on how far into the future [`CronSchedule::next`] searches
/// before concluding the expression can never match again (e.g. Feb 30).
const SEARCH_HORIZON: Duration = Duration::days(366 * 4);

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self, String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let [minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(format!(
                "expected 5 space-separated fields (minute hour day-of-month month day-of-week), got {:?}",
                expression
            ));
        };
        Ok(CronSchedule {
            expression: expression.to_string(),
            minute: Field::parse(minute, 0, 59)?,
            hour: Field::parse(hour, 0, 23)?,
            day_of_month: Field::parse(dom, 1, 31)?,
            month: Field::parse(month, 1, 12)?,
            day_of_week: Field::parse(dow, 0, 7)?,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    fn day_matches(&self, dt: DateTime<Utc>) -> bool {
        let dom_restricted = !self.day_of_month.wildcard;
        let dow_restricted = !self.day_of_week.wildcard;
        let dom_match = self.day_of_month.contains(dt.day());
        // cron day-of-week is 0-6 (Sun-Sat) with 7 also accepted as Sunday.
        let weekday_num = dt.weekday().num_days_from_sunday();
        let dow_match = self.day_of_week.contains(weekday_num) || self.day_of_week.contains(weekday_num + 7);

        match (dom_restricted, dow_restricted) {
            (true, true) => dom_match || dow_match,
            (true, false) => dom_match,
            (false, true) => dow_match,
            (false, false) => true,
        }
    }

    /// Smallest instant strictly greater than `from` satisfying the
    /// expression, or `None` if nothing matches within the search horizon.
    pub fn next(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = from
            .checked_add_signed(Duration::minutes(1))?
            .with_second(0)?
            .with_nanosecond(0)?;
        let limit = from.checked_add_signed(SEARCH_HORIZON)?;

        loop {
            if candidate > limit {
                return None;
            }
            if !self.month.contains(candidate.month()) {
                candidate = first_of_next_month(candidate)?;
                continue;
            }
            if !self.day_matches(candidate) {
                candidate = start_of_next_day(candidate)?;
                continue;
            }
            if !self.hour.contains(candidate.hour()) {
                candidate = start_of_next_hour(candidate)?;
                continue;
            }
            if !self.minute.contains(candidate.minute()) {
                candidate = candidate.checked_add_signed(Duration::minutes(1))?;
                continue;
            }
            return Some(candidate);
        }
    }
}

fn first_of_next_month(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    chrono::NaiveDate::from_ymd_opt(year, month, 1)?
        .and_hms_opt(0, 0, 0)?
        .and_utc()
        .into()
}

fn start_of_next_day(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    dt.date_naive()
        .succ_opt()?
        .and_hms_opt(0, 0, 0)?
        .and_utc()
        .into()
}

fn start_of_next_hour(dt: DateTime<Utc>) -> Option<DateTime<Utc>> {
    dt.date_naive()
        .and_hms_opt(dt.hour(), 0, 0)?
        .and_utc()
        .checked_add_signed(Duration::hours(1))
}
