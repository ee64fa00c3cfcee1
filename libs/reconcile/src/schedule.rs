//! Time-of-day prebuild schedules.
//!
//! A schedule is a five-field cron expression read as a continuous range
//! rather than a series of instants: `* 9-18 * * 1-5` is in force from
//! 09:00:00 through 18:59:59, Monday to Friday. The minute field must be `*`.
//!
//! Fields accept `*`, `?`, single values, `a-b` ranges, `/step` and comma
//! lists. Months and weekdays also accept three-letter names. As in cron, a
//! day matches when both day fields match, unless both are restricted, in
//! which case either one is enough.

use std::str::FromStr;

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::ScheduleError;
use crate::model::PrebuildSchedule;

const MONTHS: [&str; 12] = [
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// One cron field as a bitset of allowed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    /// The field was written as `*` or `?`.
    star: bool,
}

impl Field {
    fn parse(
        field: &'static str,
        raw: &str,
        min: u32,
        max: u32,
        names: &[&str],
    ) -> Result<Self, ScheduleError> {
        let invalid = || ScheduleError::InvalidField {
            field,
            value: raw.to_string(),
        };

        let mut parsed = Field {
            bits: 0,
            star: false,
        };
        for part in raw.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| invalid())?;
                    if step == 0 {
                        return Err(invalid());
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" || range == "?" {
                parsed.star = true;
                (min, max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                (
                    value(lo, min, names).ok_or_else(invalid)?,
                    value(hi, min, names).ok_or_else(invalid)?,
                )
            } else {
                let start = value(range, min, names).ok_or_else(invalid)?;
                // `5/15` means every 15th value from 5 on.
                (start, if step.is_some() { max } else { start })
            };

            if start < min || end > max || start > end {
                return Err(invalid());
            }

            let step = step.unwrap_or(1);
            let mut v = start;
            while v <= end {
                parsed.bits |= 1u64 << v;
                let Some(next) = v.checked_add(step) else {
                    break;
                };
                v = next;
            }
        }

        Ok(parsed)
    }

    fn has(&self, v: u32) -> bool {
        self.bits & (1u64 << v) != 0
    }

    fn intersects(&self, other: &Field) -> bool {
        self.bits & other.bits != 0
    }
}

fn value(raw: &str, min: u32, names: &[&str]) -> Option<u32> {
    if let Ok(v) = raw.parse() {
        return Some(v);
    }
    names
        .iter()
        .position(|name| name.eq_ignore_ascii_case(raw))
        .and_then(|idx| u32::try_from(idx).ok())
        .map(|idx| min + idx)
}

/// A parsed schedule expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl FromStr for TimeRange {
    type Err = ScheduleError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        let &[minute, hour, dom, month, dow] = fields.as_slice() else {
            return Err(ScheduleError::FieldCount {
                expression: expression.to_string(),
                count: fields.len(),
            });
        };
        if minute != "*" {
            return Err(ScheduleError::MinuteNotWildcard(expression.to_string()));
        }

        let mut days_of_week = Field::parse("day of week", dow, 0, 7, &WEEKDAYS)?;
        // Sunday may be written as 7.
        if days_of_week.has(7) {
            days_of_week.bits = (days_of_week.bits & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            hours: Field::parse("hour", hour, 0, 23, &[])?,
            days_of_month: Field::parse("day of month", dom, 1, 31, &[])?,
            months: Field::parse("month", month, 1, 12, &MONTHS)?,
            days_of_week,
        })
    }
}

impl TimeRange {
    /// Whether `at`, read in its own timezone, falls inside the range.
    pub fn contains<Z: TimeZone>(&self, at: &DateTime<Z>) -> bool {
        self.hours.has(at.hour())
            && self.months.has(at.month())
            && self.day_matches(at.day(), at.weekday().num_days_from_sunday())
    }

    /// Whether some instant could fall inside both ranges.
    ///
    /// A range restricting only weekdays against one restricting only days
    /// of the month is treated as overlapping.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        if !self.hours.intersects(&other.hours) || !self.months.intersects(&other.months) {
            return false;
        }

        if self.days_of_month.star && other.days_of_month.star {
            self.days_of_week.intersects(&other.days_of_week)
        } else if self.days_of_week.star && other.days_of_week.star {
            self.days_of_month.intersects(&other.days_of_month)
        } else {
            true
        }
    }

    fn day_matches(&self, day_of_month: u32, day_of_week: u32) -> bool {
        let dom = self.days_of_month.has(day_of_month);
        let dow = self.days_of_week.has(day_of_week);
        if self.days_of_month.star || self.days_of_week.star {
            dom && dow
        } else {
            dom || dow
        }
    }
}

/// Parses every schedule and rejects any pair that overlaps.
pub fn validate_schedules(schedules: &[PrebuildSchedule]) -> Result<Vec<TimeRange>, ScheduleError> {
    let ranges = schedules
        .iter()
        .map(|s| s.cron_expression.parse::<TimeRange>())
        .collect::<Result<Vec<_>, _>>()?;

    for (i, first) in ranges.iter().enumerate() {
        for (j, second) in ranges.iter().enumerate().skip(i + 1) {
            if first.overlaps(second) {
                return Err(ScheduleError::Overlap {
                    first: schedules[i].cron_expression.clone(),
                    second: schedules[j].cron_expression.clone(),
                });
            }
        }
    }

    Ok(ranges)
}

/// The schedule in force at `at`, or `None` when no schedule covers it.
pub fn active_schedule<'a>(
    timezone: &str,
    schedules: &'a [PrebuildSchedule],
    at: DateTime<Utc>,
) -> Result<Option<&'a PrebuildSchedule>, ScheduleError> {
    if schedules.is_empty() {
        return Ok(None);
    }
    if timezone.is_empty() {
        return Err(ScheduleError::MissingTimezone);
    }
    let tz: Tz = timezone
        .parse()
        .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;

    let ranges = validate_schedules(schedules)?;
    let local = at.with_timezone(&tz);

    Ok(schedules
        .iter()
        .zip(ranges)
        .find(|(_, range)| range.contains(&local))
        .map(|(schedule, _)| schedule))
}
