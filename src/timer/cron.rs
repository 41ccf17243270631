//! Crontab-style expressions over six bitmask fields.
//!
//! | Field        | Mandatory | Allowed values | Special characters |
//! |--------------|-----------|----------------|--------------------|
//! | Seconds      | No        | 0-59           | * / , -            |
//! | Minutes      | Yes       | 0-59           | * / , -            |
//! | Hours        | Yes       | 0-23           | * / , -            |
//! | Day of month | Yes       | 1-31           | * / , -            |
//! | Month        | Yes       | 1-12           | * / , -            |
//! | Day of week  | Yes       | 0-6 (0=Sunday) | * / , -            |
//!
//! When the seconds field is omitted it defaults to `0`. Each field is
//! a comma list of terms; a term is `RANGE` or `RANGE/STEP`, where
//! `RANGE` is `*`, `N`, `N-N`, or `N/STEP` (shorthand for
//! `N-max/STEP`).

use chrono::{DateTime, Datelike, Months, TimeDelta, Timelike, Utc};

use crate::error::CronParseError;

/// A parsed cron expression: one u64 bitmask per field.
///
/// Day matching is disjunctive between day-of-month and day-of-week,
/// except that a field given as exactly `*` drops out of the
/// disjunction; the wildcard is tracked at parse time rather than
/// inferred from the mask value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronExpr {
    sec: u64,
    min: u64,
    hour: u64,
    dom: u64,
    month: u64,
    dow: u64,
    dom_wild: bool,
    dow_wild: bool,
}

impl CronExpr {
    /// Parse a 5- or 6-field expression.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let mut fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 && fields.len() != 6 {
            return Err(CronParseError::FieldCount(fields.len()));
        }
        if fields.len() == 5 {
            fields.insert(0, "0");
        }

        Ok(Self {
            sec: parse_field(fields[0], 0, 59)?,
            min: parse_field(fields[1], 0, 59)?,
            hour: parse_field(fields[2], 0, 23)?,
            dom: parse_field(fields[3], 1, 31)?,
            month: parse_field(fields[4], 1, 12)?,
            dow: parse_field(fields[5], 0, 6)?,
            dom_wild: fields[3] == "*",
            dow_wild: fields[5] == "*",
        })
    }

    fn match_day(&self, t: &DateTime<Utc>) -> bool {
        if self.dom_wild {
            return self.dow & (1u64 << t.weekday().num_days_from_sunday()) != 0;
        }
        if self.dow_wild {
            return self.dom & (1u64 << t.day()) != 0;
        }
        self.dow & (1u64 << t.weekday().num_days_from_sunday()) != 0
            || self.dom & (1u64 << t.day()) != 0
    }

    /// The smallest instant strictly after `after` (truncated to whole
    /// seconds) matching the expression, or `None` when no match
    /// exists within roughly a year.
    ///
    /// Matching cascades from months down to seconds; whenever a field
    /// increment rolls over, matching restarts from the month step.
    pub fn next(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_nanosecond(0)? + TimeDelta::seconds(1);
        let year = t.year();
        let mut init = false;

        'retry: loop {
            if t.year() > year + 1 {
                return None;
            }

            while self.month & (1u64 << t.month()) == 0 {
                if !init {
                    init = true;
                    t = t.with_day(1)?.with_hour(0)?.with_minute(0)?.with_second(0)?;
                }
                t = t.checked_add_months(Months::new(1))?;
                if t.month() == 1 {
                    continue 'retry;
                }
            }

            while !self.match_day(&t) {
                if !init {
                    init = true;
                    t = t.with_hour(0)?.with_minute(0)?.with_second(0)?;
                }
                t = t + TimeDelta::days(1);
                if t.day() == 1 {
                    continue 'retry;
                }
            }

            while self.hour & (1u64 << t.hour()) == 0 {
                if !init {
                    init = true;
                    t = t.with_minute(0)?.with_second(0)?;
                }
                t = t + TimeDelta::hours(1);
                if t.hour() == 0 {
                    continue 'retry;
                }
            }

            while self.min & (1u64 << t.minute()) == 0 {
                if !init {
                    init = true;
                    t = t.with_second(0)?;
                }
                t = t + TimeDelta::minutes(1);
                if t.minute() == 0 {
                    continue 'retry;
                }
            }

            while self.sec & (1u64 << t.second()) == 0 {
                init = true;
                t = t + TimeDelta::seconds(1);
                if t.second() == 0 {
                    continue 'retry;
                }
            }

            return Some(t);
        }
    }
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<u64, CronParseError> {
    let mut mask = 0u64;

    for term in field.split(',') {
        let range_and_step: Vec<&str> = term.split('/').collect();
        if range_and_step.len() > 2 {
            return Err(CronParseError::TooManySlashes(term.to_string()));
        }
        let range = range_and_step[0];

        let start_and_end: Vec<&str> = range.split('-').collect();
        if start_and_end.len() > 2 {
            return Err(CronParseError::TooManyHyphens(range.to_string()));
        }

        let (start, end) = if start_and_end[0] == "*" {
            if start_and_end.len() != 1 {
                return Err(CronParseError::InvalidRange(range.to_string()));
            }
            (min, max)
        } else {
            let start: u32 = start_and_end[0]
                .parse()
                .map_err(|_| CronParseError::InvalidRange(range.to_string()))?;
            let end = if start_and_end.len() == 1 {
                if range_and_step.len() == 2 {
                    // `N/STEP` means `N-max/STEP`.
                    max
                } else {
                    start
                }
            } else {
                start_and_end[1]
                    .parse()
                    .map_err(|_| CronParseError::InvalidRange(range.to_string()))?
            };
            (start, end)
        };

        if start > end {
            return Err(CronParseError::InvalidRange(range.to_string()));
        }
        if start < min || end > max {
            return Err(CronParseError::OutOfRange {
                min,
                max,
                term: range.to_string(),
            });
        }

        let step = if range_and_step.len() == 1 {
            1
        } else {
            let step: i64 = range_and_step[1]
                .parse()
                .map_err(|_| CronParseError::InvalidIncrement(range_and_step[1].to_string()))?;
            if step <= 0 {
                return Err(CronParseError::InvalidIncrement(
                    range_and_step[1].to_string(),
                ));
            }
            step as u32
        };

        if step == 1 {
            mask |= !(u64::MAX << (end + 1)) & (u64::MAX << start);
        } else {
            let mut i = start;
            while i <= end {
                mask |= 1u64 << i;
                i += step;
            }
        }
    }

    Ok(mask)
}
