//! Year-month time periods (canonical form `YYYYMM`)
//!
//! Periods are the unit the leakage guard reasons about. All distances and
//! offsets are computed on an absolute month index, never on the raw `YYYYMM`
//! integer: `202501 - 202412` is one month, not 89.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::value::Value;
use crate::{Error, Result};

/// Smallest accepted year (strict `YYYYMM` validation)
pub const MIN_YEAR: i64 = 2000;
/// Largest accepted year
pub const MAX_YEAR: i64 = 9999;

/// A calendar month, stored as year and month.
///
/// Ordering is chronological because `year` is compared before `month`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Period {
    year: u16,
    month: u8,
}

impl Period {
    /// Create a period from a year and a 1-based month.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPeriod` if the year is outside 2000..=9999 or the month
    /// outside 1..=12.
    pub fn new(year: i64, month: i64) -> Result<Self> {
        match (u16::try_from(year), u8::try_from(month)) {
            (Ok(y), Ok(m))
                if (MIN_YEAR..=MAX_YEAR).contains(&i64::from(y)) && (1..=12).contains(&m) =>
            {
                Ok(Self { year: y, month: m })
            }
            _ => Err(Error::InvalidPeriod(format!(
                "year {year}, month {month} is not a valid YYYYMM period"
            ))),
        }
    }

    /// Parse the canonical integer form, e.g. `202412`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPeriod` unless the value has six digits and a valid month.
    pub fn from_yyyymm(value: i64) -> Result<Self> {
        if !(100_000..=999_999).contains(&value) {
            return Err(Error::InvalidPeriod(format!(
                "{value} is not a six-digit YYYYMM value"
            )));
        }
        Self::new(value / 100, value % 100)
    }

    /// Rebuild a period from its absolute month index.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPeriod` if the index falls outside the supported years.
    pub fn from_month_index(index: i64) -> Result<Self> {
        Self::new(index.div_euclid(12), index.rem_euclid(12) + 1)
    }

    /// Year component.
    #[must_use]
    pub const fn year(self) -> i64 {
        self.year as i64
    }

    /// Month component (1..=12).
    #[must_use]
    pub const fn month(self) -> i64 {
        self.month as i64
    }

    /// Canonical `YYYYMM` integer.
    #[must_use]
    pub const fn yyyymm(self) -> i64 {
        self.year() * 100 + self.month()
    }

    /// Absolute month index (`year * 12 + month - 1`).
    #[must_use]
    pub const fn month_index(self) -> i64 {
        self.year() * 12 + self.month() - 1
    }

    /// Shift by a signed number of calendar months.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPeriod` if the result leaves the supported year range.
    pub fn add_months(self, months: i64) -> Result<Self> {
        Self::from_month_index(self.month_index() + months)
    }

    /// Signed number of months from `earlier` to `self`.
    ///
    /// ```
    /// use churn_store::period::Period;
    ///
    /// let dec = Period::from_yyyymm(202412).unwrap();
    /// let jan = Period::from_yyyymm(202501).unwrap();
    /// assert_eq!(jan.months_since(dec), 1);
    /// ```
    #[must_use]
    pub const fn months_since(self, earlier: Self) -> i64 {
        self.month_index() - earlier.month_index()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidPeriod(format!("'{s}' is not a YYYYMM string")));
        }
        let value: i64 = s
            .parse()
            .map_err(|_| Error::InvalidPeriod(format!("'{s}' is not a YYYYMM string")))?;
        Self::from_yyyymm(value)
    }
}

impl TryFrom<i64> for Period {
    type Error = Error;

    fn try_from(value: i64) -> Result<Self> {
        Self::from_yyyymm(value)
    }
}

impl From<Period> for i64 {
    fn from(period: Period) -> Self {
        period.yyyymm()
    }
}

impl TryFrom<&Value> for Period {
    type Error = Error;

    /// Accepts integer `YYYYMM` values and six-digit strings.
    fn try_from(value: &Value) -> Result<Self> {
        match value {
            Value::Int(v) => Self::from_yyyymm(*v),
            Value::Text(s) => s.parse(),
            other => Err(Error::InvalidPeriod(format!(
                "{other} is not an integer or string YYYYMM value"
            ))),
        }
    }
}

impl From<Period> for Value {
    fn from(period: Period) -> Self {
        Self::Int(period.yyyymm())
    }
}
