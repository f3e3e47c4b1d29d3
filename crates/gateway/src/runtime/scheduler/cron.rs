//! 5-field cron evaluation (minute hour day-of-month month day-of-week),
//! timezone-aware.
//!
//! Expressions parse once into a [`CronExpr`]; evaluation scans forward
//! minute by minute in the job's timezone. DST gaps (non-existent local
//! times) are skipped; ambiguous fall-back times resolve to the earlier
//! instant.

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Timelike, Utc};

use ud_domain::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Parsing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Exact(u32),
    Range(u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Field {
    Any,
    Step(u32),
    Parts(Vec<Part>),
}

impl Field {
    fn parse(raw: &str, min: u32, max: u32) -> Result<Self> {
        if raw == "*" {
            return Ok(Self::Any);
        }
        if let Some(step) = raw.strip_prefix("*/") {
            let n: u32 = step
                .parse()
                .map_err(|_| Error::Validation(format!("bad cron step '{raw}'")))?;
            if n == 0 {
                return Err(Error::Validation("cron step of 0".into()));
            }
            return Ok(Self::Step(n));
        }
        let mut parts = Vec::new();
        for piece in raw.split(',') {
            let part = if let Some((lo, hi)) = piece.split_once('-') {
                let lo: u32 = lo
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad cron range '{piece}'")))?;
                let hi: u32 = hi
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad cron range '{piece}'")))?;
                if lo > hi {
                    return Err(Error::Validation(format!("inverted cron range '{piece}'")));
                }
                Part::Range(lo, hi)
            } else {
                let n: u32 = piece
                    .parse()
                    .map_err(|_| Error::Validation(format!("bad cron value '{piece}'")))?;
                Part::Exact(n)
            };
            let (lo, hi) = match &part {
                Part::Exact(n) => (*n, *n),
                Part::Range(lo, hi) => (*lo, *hi),
            };
            if lo < min || hi > max {
                return Err(Error::Validation(format!(
                    "cron value '{piece}' outside {min}..={max}"
                )));
            }
            parts.push(part);
        }
        Ok(Self::Parts(parts))
    }

    fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Step(n) => value % n == 0,
            Self::Parts(parts) => parts.iter().any(|p| match p {
                Part::Exact(n) => value == *n,
                Part::Range(lo, hi) => value >= *lo && value <= *hi,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    day_of_month: Field,
    month: Field,
    day_of_week: Field,
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(Error::Validation(format!(
                "cron expression must have 5 fields, got {}",
                fields.len()
            )));
        }
        Ok(Self {
            minute: Field::parse(fields[0], 0, 59)?,
            hour: Field::parse(fields[1], 0, 23)?,
            day_of_month: Field::parse(fields[2], 1, 31)?,
            month: Field::parse(fields[3], 1, 12)?,
            day_of_week: Field::parse(fields[4], 0, 6)?,
        })
    }

    fn matches_local(&self, dt: &NaiveDateTime) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_of_month.matches(dt.day())
            && self.month.matches(dt.month())
            && self.day_of_week.matches(dt.weekday().num_days_from_sunday())
    }

    /// Next matching instant strictly after `after`, evaluated in `tz`.
    pub fn next_after(&self, after: &DateTime<Utc>, tz: chrono_tz::Tz) -> Option<DateTime<Utc>> {
        let local_after = after.with_timezone(&tz).naive_local();
        // Advance to the next whole minute.
        let mut candidate = local_after + chrono::Duration::seconds(60 - i64::from(local_after.second()));
        candidate = candidate.with_second(0).unwrap_or(candidate);

        // Bounded scan: one year of minutes.
        let max_checks = 366 * 24 * 60;
        for _ in 0..max_checks {
            if self.matches_local(&candidate) {
                match tz.from_local_datetime(&candidate) {
                    chrono::LocalResult::Single(dt) => return Some(dt.with_timezone(&Utc)),
                    chrono::LocalResult::Ambiguous(earliest, _) => {
                        return Some(earliest.with_timezone(&Utc))
                    }
                    // DST gap: this local minute does not exist.
                    chrono::LocalResult::None => {}
                }
            }
            candidate += chrono::Duration::minutes(1);
        }
        None
    }
}

/// Parse a timezone name, falling back to UTC.
pub fn parse_tz(tz: Option<&str>) -> chrono_tz::Tz {
    match tz {
        Some(name) => name.parse::<chrono_tz::Tz>().unwrap_or(chrono_tz::UTC),
        None => chrono_tz::UTC,
    }
}
