//! Calendar year-month against which the monthly fee is owed.

use std::str::FromStr;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A billing period: one calendar month of one year.
///
/// Ordering is chronological. The wire and storage form is `"YYYY-MM"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BillingPeriod {
    year: i32,
    month: u32,
}

/// Error returned when a period string or its parts are invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid billing period: {0}")]
pub struct PeriodParseError(String);

impl BillingPeriod {
    /// Creates a period, validating that `month` is in `1..=12`.
    pub fn new(year: i32, month: u32) -> Result<Self, PeriodParseError> {
        if !(1..=12).contains(&month) {
            return Err(PeriodParseError(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    /// Returns the period containing the given date.
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// Returns the period containing today's date (UTC).
    pub fn current() -> Self {
        Self::from_date(chrono::Utc::now().date_naive())
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Returns the following month.
    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Iterates from `self` through `last`, both inclusive.
    ///
    /// Yields nothing when `last` is before `self`.
    pub fn through(self, last: BillingPeriod) -> impl Iterator<Item = BillingPeriod> {
        std::iter::successors(Some(self), |p| Some(p.next())).take_while(move |p| *p <= last)
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for BillingPeriod {
    type Err = PeriodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| PeriodParseError(s.to_string()))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(PeriodParseError(s.to_string()));
        }
        let year = year
            .parse::<i32>()
            .map_err(|_| PeriodParseError(s.to_string()))?;
        let month = month
            .parse::<u32>()
            .map_err(|_| PeriodParseError(s.to_string()))?;
        Self::new(year, month)
    }
}

impl Serialize for BillingPeriod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BillingPeriod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
