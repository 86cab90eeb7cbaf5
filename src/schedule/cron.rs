use std::collections::BTreeSet;

use anyhow::{Context, Result, bail};
use time::{Duration, OffsetDateTime};

/// A five-field cron expression: minute, hour, day-of-month, month,
/// day-of-week. Supports `*`, values, lists, ranges and `/step`; day-of-week
/// `7` is an alias for Sunday (`0`).
#[derive(Debug, Clone, PartialEq)]
pub struct CronExpr {
    minute: Field,
    hour: Field,
    dom: Field,
    month: Field,
    dow: Field,
}

#[derive(Debug, Clone, PartialEq)]
struct Field {
    values: BTreeSet<u8>,
    any: bool,
}

impl Field {
    fn contains(&self, v: u8) -> bool {
        self.any || self.values.contains(&v)
    }
}

impl CronExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            bail!("expected 5 fields, got {}", fields.len());
        }
        Ok(Self {
            minute: parse_field(fields[0], 0, 59, false).context("minute field")?,
            hour: parse_field(fields[1], 0, 23, false).context("hour field")?,
            dom: parse_field(fields[2], 1, 31, false).context("day-of-month field")?,
            month: parse_field(fields[3], 1, 12, false).context("month field")?,
            dow: parse_field(fields[4], 0, 7, true).context("day-of-week field")?,
        })
    }

    /// The next fire time strictly after `after`, on a minute boundary, UTC.
    ///
    /// Errors when no minute within the next four years matches (e.g.
    /// `0 0 30 2 *`).
    pub fn next_after(&self, after: OffsetDateTime) -> Result<OffsetDateTime> {
        let mut t = after
            .replace_nanosecond(0)
            .and_then(|t| t.replace_second(0))
            .context("truncate to minute")?
            + Duration::minutes(1);

        let bound = t + Duration::days(4 * 366);
        while t < bound {
            if !self.month.contains(t.month() as u8) || !self.day_matches(t) {
                // skip to next midnight
                t = (t + Duration::days(1))
                    .replace_hour(0)
                    .and_then(|t| t.replace_minute(0))
                    .context("roll to midnight")?;
                continue;
            }
            if !self.hour.contains(t.hour()) {
                t = t
                    .replace_minute(0)
                    .context("roll to hour start")?
                    + Duration::hours(1);
                continue;
            }
            if !self.minute.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Ok(t);
        }
        bail!("cron expression never fires")
    }

    /// Vixie-cron day rule: when both day fields are restricted, a day
    /// matches if either does; otherwise the restricted one decides.
    fn day_matches(&self, t: OffsetDateTime) -> bool {
        let dom_ok = self.dom.contains(t.day());
        let dow_ok = self.dow.contains(t.weekday().number_days_from_sunday());
        match (self.dom.any, self.dow.any) {
            (false, false) => dom_ok || dow_ok,
            _ => dom_ok && dow_ok,
        }
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |fl: &Field, f: &mut std::fmt::Formatter<'_>| -> std::fmt::Result {
            if fl.any {
                write!(f, "*")
            } else {
                let vals: Vec<String> = fl.values.iter().map(|v| v.to_string()).collect();
                write!(f, "{}", vals.join(","))
            }
        };
        show(&self.minute, f)?;
        write!(f, " ")?;
        show(&self.hour, f)?;
        write!(f, " ")?;
        show(&self.dom, f)?;
        write!(f, " ")?;
        show(&self.month, f)?;
        write!(f, " ")?;
        show(&self.dow, f)
    }
}

fn parse_field(spec: &str, min: u8, max: u8, dow: bool) -> Result<Field> {
    if spec == "*" {
        return Ok(Field {
            values: BTreeSet::new(),
            any: true,
        });
    }

    let mut values = BTreeSet::new();
    for part in spec.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u8 = s
                    .parse()
                    .with_context(|| format!("bad step in '{part}'"))?;
                if step == 0 {
                    bail!("step must be positive in '{part}'");
                }
                (r, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo: u8 = a.parse().with_context(|| format!("bad range in '{part}'"))?;
            let hi: u8 = b.parse().with_context(|| format!("bad range in '{part}'"))?;
            (lo, hi)
        } else {
            let v: u8 = range
                .parse()
                .with_context(|| format!("bad value '{part}'"))?;
            (v, v)
        };

        if lo < min || hi > max || lo > hi {
            bail!("value out of range in '{part}' (allowed {min}..={max})");
        }
        let mut v = u16::from(lo);
        while v <= u16::from(hi) {
            let val = v as u8;
            // dow 7 aliases Sunday
            values.insert(if dow && val == 7 { 0 } else { val });
            v += u16::from(step);
        }
    }
    Ok(Field { values, any: false })
}
