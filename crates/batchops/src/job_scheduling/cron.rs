//! 5-field cron parsing and next-fire evaluation
//!
//! Schedules are written in the classic 5-field form (minute, hour,
//! day-of-month, month, day-of-week) with day-of-week 0-6 and 0=Sunday.
//! The underlying evaluator expects a seconds-leading expression with
//! 1-based Sundays, so [`CronSpec`] validates the 5-field form and
//! translates it before construction. Evaluation is always in UTC.

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

use crate::errors::{EngineError, EngineResult};

/// Field name plus inclusive value bounds, in field order
const FIELDS: [(&str, u32, u32); 5] = [
    ("minute", 0, 59),
    ("hour", 0, 23),
    ("day-of-month", 1, 31),
    ("month", 1, 12),
    ("day-of-week", 0, 6),
];

/// A validated 5-field cron expression
#[derive(Debug, Clone)]
pub struct CronSpec {
    expression: String,
    schedule: cron::Schedule,
}

impl CronSpec {
    /// Parse and validate a 5-field cron expression
    ///
    /// Rejects with a malformed-schedule error on a wrong field count, an
    /// out-of-range value, a zero step, or an inverted range.
    pub fn parse(expression: &str) -> EngineResult<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(malformed(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut translated = Vec::with_capacity(5);
        for (raw, (name, min, max)) in fields.iter().zip(FIELDS.iter()) {
            // Day-of-week is the only field whose values are renumbered
            let shift = *name == "day-of-week";
            translated.push(
                check_field(raw, name, *min, *max, shift)
                    .map_err(|message| malformed(expression, message))?,
            );
        }

        // Seconds field pinned to 0: fires are minute-aligned
        let seconds_form = format!("0 {}", translated.join(" "));
        let schedule = cron::Schedule::from_str(&seconds_form)
            .map_err(|e| malformed(expression, e.to_string()))?;

        Ok(Self {
            expression: expression.to_string(),
            schedule,
        })
    }

    /// The smallest instant strictly after `t` matching this expression
    pub fn next_fire_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&t).find(|next| *next > t)
    }

    /// The original 5-field form
    pub fn expression(&self) -> &str {
        &self.expression
    }
}

impl fmt::Display for CronSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn malformed(expression: &str, message: impl Into<String>) -> EngineError {
    EngineError::MalformedSchedule {
        expression: expression.to_string(),
        message: message.into(),
    }
}

/// Validate one field's comma list, returning its translated form
fn check_field(
    field: &str,
    name: &str,
    min: u32,
    max: u32,
    shift: bool,
) -> Result<String, String> {
    if field.is_empty() {
        return Err(format!("{name} field is empty"));
    }
    let mut out = Vec::new();
    for token in field.split(',') {
        out.push(check_token(token, name, min, max, shift)?);
    }
    Ok(out.join(","))
}

/// Validate one token (`*`, value, range, or any of those with `/step`)
fn check_token(
    token: &str,
    name: &str,
    min: u32,
    max: u32,
    shift: bool,
) -> Result<String, String> {
    let (base, step) = match token.split_once('/') {
        Some((base, step)) => (base, Some(step)),
        None => (token, None),
    };

    let step_suffix = match step {
        Some(raw) => {
            let value: u32 = raw
                .parse()
                .map_err(|_| format!("invalid step '{raw}' in {name} field"))?;
            if value == 0 {
                return Err(format!("step must be positive in {name} field"));
            }
            format!("/{value}")
        }
        None => String::new(),
    };

    let translated_base = if base == "*" {
        "*".to_string()
    } else if let Some((lo, hi)) = base.split_once('-') {
        let lo = check_value(lo, name, min, max)?;
        let hi = check_value(hi, name, min, max)?;
        if lo > hi {
            return Err(format!("inverted range '{base}' in {name} field"));
        }
        format!("{}-{}", translate(lo, shift), translate(hi, shift))
    } else {
        let value = check_value(base, name, min, max)?;
        translate(value, shift).to_string()
    };

    Ok(format!("{translated_base}{step_suffix}"))
}

fn check_value(raw: &str, name: &str, min: u32, max: u32) -> Result<u32, String> {
    let value: u32 = raw
        .parse()
        .map_err(|_| format!("invalid value '{raw}' in {name} field"))?;
    if value < min || value > max {
        return Err(format!(
            "value {value} out of range {min}-{max} in {name} field"
        ));
    }
    Ok(value)
}

/// Renumber day-of-week values for the evaluator (0=Sunday -> 1=Sunday)
fn translate(value: u32, shift: bool) -> u32 {
    if shift {
        value + 1
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * * 13 *",
            "* * * * 7",
            "*/0 * * * *",
            "10-5 * * * *",
            "abc * * * *",
            "1,,2 * * * *",
        ] {
            assert!(CronSpec::parse(bad).is_err(), "should reject {bad:?}");
        }
    }

    #[test]
    fn accepts_standard_forms() {
        for good in [
            "* * * * *",
            "*/5 * * * *",
            "0 9 * * 1-5",
            "15,45 8-17 * * *",
            "0 0 1 1 *",
            "30 6 * * 0",
            "0-59/10 * * * *",
        ] {
            assert!(CronSpec::parse(good).is_ok(), "should accept {good:?}");
        }
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let spec = CronSpec::parse("*/5 * * * *").unwrap();
        let t = at(2024, 3, 1, 12, 5);
        assert_eq!(spec.next_fire_after(t), Some(at(2024, 3, 1, 12, 10)));
    }

    #[test]
    fn zero_means_sunday() {
        let spec = CronSpec::parse("0 12 * * 0").unwrap();
        // 2024-03-02 is a Saturday
        let next = spec.next_fire_after(at(2024, 3, 2, 0, 0)).unwrap();
        assert_eq!(next.weekday(), Weekday::Sun);
        assert_eq!(next, at(2024, 3, 3, 12, 0));
    }

    #[test]
    fn weekday_range_translates() {
        let spec = CronSpec::parse("0 9 * * 1-5").unwrap();
        // 2024-03-01 18:00 is a Friday evening; next fire is Monday 09:00
        let next = spec.next_fire_after(at(2024, 3, 1, 18, 0)).unwrap();
        assert_eq!(next, at(2024, 3, 4, 9, 0));
        assert_eq!(next.weekday(), Weekday::Mon);
    }

    #[test]
    fn leap_day_schedules_skip_to_leap_years() {
        let spec = CronSpec::parse("0 0 29 2 *").unwrap();
        let next = spec.next_fire_after(at(2023, 3, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 2, 29, 0, 0));
    }

    // Naive reference evaluator: step minute by minute and test each field.
    // Generated expressions keep at least one of day-of-month/day-of-week
    // unrestricted, so the vixie OR rule never comes into play.
    fn field_matches(field: &str, value: u32) -> bool {
        field.split(',').any(|token| {
            let (base, step) = match token.split_once('/') {
                Some((b, s)) => (b, s.parse::<u32>().unwrap()),
                None => (token, 1),
            };
            let (lo, hi) = if base == "*" {
                (0u32, 59u32)
            } else if let Some((l, h)) = base.split_once('-') {
                (l.parse().unwrap(), h.parse().unwrap())
            } else {
                let v = base.parse().unwrap();
                if step == 1 {
                    return v == value;
                }
                (v, 59)
            };
            value >= lo && value <= hi && (value - lo) % step == 0
        })
    }

    fn reference_matches(fields: &[&str], t: DateTime<Utc>) -> bool {
        field_matches(fields[0], t.minute())
            && field_matches(fields[1], t.hour())
            && field_matches(fields[2], t.day())
            && field_matches(fields[3], t.month())
            && field_matches(fields[4], t.weekday().num_days_from_sunday())
    }

    fn reference_next_fire(expr: &str, from: DateTime<Utc>) -> DateTime<Utc> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let mut t = from
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap();
        loop {
            t += chrono::Duration::minutes(1);
            if t > from && reference_matches(&fields, t) {
                return t;
            }
        }
    }

    // Tiny deterministic LCG so the pair set is stable across runs
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }

        fn below(&mut self, bound: u64) -> u64 {
            self.next() % bound
        }
    }

    fn random_field(rng: &mut Lcg, min: u32, max: u32) -> String {
        let span = (max - min + 1) as u64;
        match rng.below(4) {
            0 => "*".to_string(),
            1 => format!("{}", min as u64 + rng.below(span)),
            2 => {
                let lo = min as u64 + rng.below(span);
                let hi = lo + rng.below(span - (lo - min as u64));
                format!("{lo}-{hi}")
            }
            _ => format!("*/{}", 1 + rng.below(14)),
        }
    }

    #[test]
    fn next_fire_matches_reference_evaluator() {
        let mut rng = Lcg(0x5eed_cafe);

        for _ in 0..100 {
            // Keep day-of-month unrestricted so dom/dow combination
            // semantics stay out of the comparison.
            let expr = format!(
                "{} {} * * {}",
                random_field(&mut rng, 0, 59),
                random_field(&mut rng, 0, 23),
                random_field(&mut rng, 0, 6),
            );
            let spec = CronSpec::parse(&expr).expect("generated expression should parse");

            let t = at(2024, 1, 1, 0, 0) + chrono::Duration::minutes(rng.below(400_000) as i64);
            let expected = reference_next_fire(&expr, t);
            let actual = spec.next_fire_after(t).unwrap();
            assert_eq!(actual, expected, "expression {expr:?} from {t}");
        }
    }
}
