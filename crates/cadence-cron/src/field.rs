use crate::error::{CronError, Result};

/// Bounds and symbolic names for one cron field.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldSpec {
    pub name: &'static str,
    pub min: u32,
    pub max: u32,
    /// Symbolic names; `names[i]` stands for `names_base + i`.
    pub names: &'static [&'static str],
    pub names_base: u32,
}

pub(crate) const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};

pub(crate) const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};

pub(crate) const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};

pub(crate) const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &[
        "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
    ],
    names_base: 1,
};

/// Both 0 and 7 mean Sunday.
pub(crate) const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
    names_base: 0,
};

/// Allowed values of a field, one bit per value (all fields fit in 64).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BitSet(u64);

impl BitSet {
    pub fn insert(&mut self, value: u32) {
        self.0 |= 1 << value;
    }

    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Ascending iteration over the members.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(move |v| self.contains(*v))
    }
}

/// A parsed field. `restricted` is false for a bare `*` (or `?`), which
/// matters for the day-of-month / day-of-week combination rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Field {
    pub values: BitSet,
    pub restricted: bool,
}

pub(crate) fn parse_field(raw: &str, spec: &FieldSpec) -> Result<Field> {
    let mut values = BitSet::default();
    let mut restricted = false;

    for item in raw.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => (range, Some(parse_step(step, spec)?)),
            None => (item, None),
        };

        let wildcard = range == "*" || range == "?";
        let (lo, hi) = if wildcard {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let (lo, hi) = (parse_value(a, spec)?, parse_value(b, spec)?);
            if lo > hi {
                return Err(invalid(spec, item));
            }
            (lo, hi)
        } else {
            let v = parse_value(range, spec)?;
            // `5/15` means "from 5 to the end of the range, every 15".
            if step.is_some() {
                (v, spec.max)
            } else {
                (v, v)
            }
        };

        let step = step.unwrap_or(1);
        if !(wildcard && step == 1) {
            restricted = true;
        }
        for v in (lo..=hi).step_by(step as usize) {
            values.insert(v);
        }
    }

    if spec.name == DAY_OF_WEEK.name && values.contains(7) {
        values.insert(0);
    }

    Ok(Field { values, restricted })
}

fn parse_step(raw: &str, spec: &FieldSpec) -> Result<u32> {
    match raw.parse::<u32>() {
        Ok(step) if step > 0 && step <= spec.max.max(1) => Ok(step),
        _ => Err(CronError::InvalidStep {
            field: spec.name,
            value: raw.to_string(),
        }),
    }
}

fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32> {
    let value = match raw.parse::<u32>() {
        Ok(v) => v,
        Err(_) => spec
            .names
            .iter()
            .position(|name| name.eq_ignore_ascii_case(raw))
            .map(|idx| idx as u32 + spec.names_base)
            .ok_or_else(|| invalid(spec, raw))?,
    };
    if value < spec.min || value > spec.max {
        return Err(CronError::OutOfRange {
            field: spec.name,
            value,
            min: spec.min,
            max: spec.max,
        });
    }
    Ok(value)
}

fn invalid(spec: &FieldSpec, raw: &str) -> CronError {
    CronError::InvalidValue {
        field: spec.name,
        value: raw.to_string(),
    }
}
