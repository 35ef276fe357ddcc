use crate::error::{PipelineError, Result};
use crate::utils::{first_day_of_month, last_day_of_month};
use chrono::{Datelike, NaiveDate};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[schemars(description = "One bucket per calendar day")]
    Daily,

    #[default]
    #[schemars(description = "One bucket per calendar month (the dashboard default)")]
    Monthly,
}

/// An inclusive date bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub granularity: Granularity,
}

impl Period {
    pub fn containing(date: NaiveDate, granularity: Granularity) -> Result<Self> {
        match granularity {
            Granularity::Daily => Ok(Self {
                start: date,
                end: date,
                granularity,
            }),
            Granularity::Monthly => Ok(Self {
                start: first_day_of_month(date.year(), date.month())?,
                end: last_day_of_month(date.year(), date.month())?,
                granularity,
            }),
        }
    }

    pub fn next(&self) -> Result<Self> {
        let following = self.end.succ_opt().ok_or_else(|| {
            PipelineError::DateError(format!("No period after {}", self.end))
        })?;
        Self::containing(following, self.granularity)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.granularity {
            Granularity::Daily => write!(f, "{}", self.start.format("%Y-%m-%d")),
            Granularity::Monthly => write!(f, "{}", self.start.format("%Y-%m")),
        }
    }
}

/// Every bucket from the one containing `first` through the one containing `last`.
pub fn periods_between(
    first: NaiveDate,
    last: NaiveDate,
    granularity: Granularity,
) -> Result<Vec<Period>> {
    let mut periods = Vec::new();
    if last < first {
        return Ok(periods);
    }

    let mut current = Period::containing(first, granularity)?;
    loop {
        periods.push(current);
        if current.end >= last {
            break;
        }
        current = current.next()?;
    }

    Ok(periods)
}
