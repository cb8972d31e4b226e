//! Monthly partition keys.
//!
//! A [`PartitionKey`] names one calendar month, the unit of idempotent reload.
//! Keys are immutable once constructed and always valid: the month is in
//! `1..=12` and the year has four digits.
//!
//! # Canonical Forms
//!
//! ```text
//! display / serde : "YYYY-MM"   (e.g. "2025-01")
//! compact         : "YYYYMM"    (e.g. "202501", used in archive names)
//! ```
//!
//! # Examples
//!
//! ```rust
//! use chrono::NaiveDate;
//! use velo_core::partition::PartitionKey;
//!
//! let key = PartitionKey::new(2025, 1).unwrap();
//! assert_eq!(key.to_string(), "2025-01");
//! assert_eq!(key.last_day(), NaiveDate::from_ymd_opt(2025, 1, 31).unwrap());
//!
//! // Runs default to the month before the run date.
//! let run_date = NaiveDate::from_ymd_opt(2026, 2, 10).unwrap();
//! assert_eq!(PartitionKey::previous_month_of(run_date).unwrap().to_string(), "2026-01");
//! ```

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const MIN_YEAR: i32 = 1000;
const MAX_YEAR: i32 = 9999;

/// One calendar month identifying a reloadable partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct PartitionKey {
    year: i32,
    month: u32,
}

impl PartitionKey {
    /// Creates a partition key for the given year and month.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPartition`] if the month is outside `1..=12`
    /// or the year is not a four-digit year.
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::invalid_partition(format!(
                "month must be between 1 and 12, got {month}"
            )));
        }
        if !(MIN_YEAR..=MAX_YEAR).contains(&year) {
            return Err(Error::invalid_partition(format!(
                "year must have four digits, got {year}"
            )));
        }
        Ok(Self { year, month })
    }

    /// Returns the partition of the calendar month before `date`.
    ///
    /// A run on 2026-02-10 processes 2026-01; a run on 2026-01-10 processes
    /// 2025-12.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPartition`] if the previous month falls
    /// outside the four-digit year range.
    pub fn previous_month_of(date: NaiveDate) -> Result<Self> {
        Self::new(date.year(), date.month())?
            .previous()
            .ok_or_else(|| Error::invalid_partition(format!("no month precedes {date}")))
    }

    /// Returns the partition of the month before the UTC date of `now`.
    ///
    /// # Errors
    ///
    /// See [`PartitionKey::previous_month_of`].
    pub fn previous_month_at(now: DateTime<Utc>) -> Result<Self> {
        Self::previous_month_of(now.date_naive())
    }

    /// Returns the partition's year.
    #[must_use]
    pub const fn year(&self) -> i32 {
        self.year
    }

    /// Returns the partition's month (`1..=12`).
    #[must_use]
    pub const fn month(&self) -> u32 {
        self.month
    }

    /// Returns the month before this one, or `None` before `1000-01`.
    #[must_use]
    pub const fn previous(&self) -> Option<Self> {
        if self.month > 1 {
            Some(Self {
                year: self.year,
                month: self.month - 1,
            })
        } else if self.year > MIN_YEAR {
            Some(Self {
                year: self.year - 1,
                month: 12,
            })
        } else {
            None
        }
    }

    /// Returns the month after this one, or `None` after `9999-12`.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        if self.month < 12 {
            Some(Self {
                year: self.year,
                month: self.month + 1,
            })
        } else if self.year < MAX_YEAR {
            Some(Self {
                year: self.year + 1,
                month: 1,
            })
        } else {
            None
        }
    }

    /// Returns the first day of the month.
    #[must_use]
    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// Returns the last day of the month (inclusive).
    #[must_use]
    pub fn last_day(&self) -> NaiveDate {
        self.first_day()
            .checked_add_months(Months::new(1))
            .and_then(|next| next.pred_opt())
            .unwrap_or_else(|| self.first_day())
    }

    /// Returns the number of days in the month.
    #[must_use]
    pub fn days(&self) -> u32 {
        self.last_day().day()
    }

    /// Returns the number of whole hours in the month.
    #[must_use]
    pub fn hours(&self) -> u32 {
        self.days() * 24
    }

    /// Returns true if `date` falls within this month.
    #[must_use]
    pub fn contains(&self, date: NaiveDate) -> bool {
        date.year() == self.year && date.month() == self.month
    }

    /// Returns the compact `YYYYMM` form used in archive names.
    #[must_use]
    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for PartitionKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| Error::invalid_partition(format!("expected YYYY-MM, got '{s}'")))?;
        if year.len() != 4 || month.len() != 2 {
            return Err(Error::invalid_partition(format!(
                "expected YYYY-MM, got '{s}'"
            )));
        }
        let year = year
            .parse::<i32>()
            .map_err(|_| Error::invalid_partition(format!("invalid year in '{s}'")))?;
        let month = month
            .parse::<u32>()
            .map_err(|_| Error::invalid_partition(format!("invalid month in '{s}'")))?;
        Self::new(year, month)
    }
}

impl From<PartitionKey> for String {
    fn from(key: PartitionKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for PartitionKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn rejects_out_of_range_month() {
        assert!(PartitionKey::new(2025, 0).is_err());
        assert!(PartitionKey::new(2025, 13).is_err());
        assert!(PartitionKey::new(25, 1).is_err());
    }

    #[test]
    fn previous_month_wraps_year() {
        let key = PartitionKey::previous_month_of(date(2026, 1, 10)).unwrap();
        assert_eq!((key.year(), key.month()), (2025, 12));

        let key = PartitionKey::previous_month_of(date(2026, 2, 10)).unwrap();
        assert_eq!((key.year(), key.month()), (2026, 1));
    }

    #[test]
    fn neighbours_stop_at_four_digit_years() {
        let first = PartitionKey::new(1000, 1).unwrap();
        let last = PartitionKey::new(9999, 12).unwrap();
        assert_eq!(first.previous(), None);
        assert_eq!(last.next(), None);
        assert_eq!(first.next(), Some(PartitionKey::new(1000, 2).unwrap()));
        assert_eq!(last.previous(), Some(PartitionKey::new(9999, 11).unwrap()));
        assert_eq!(last.last_day(), date(9999, 12, 31));
        assert!(PartitionKey::previous_month_of(date(1000, 1, 15)).is_err());
    }

    #[test]
    fn month_bounds_handle_leap_years() {
        let feb_2024 = PartitionKey::new(2024, 2).unwrap();
        assert_eq!(feb_2024.last_day(), date(2024, 2, 29));
        assert_eq!(feb_2024.hours(), 29 * 24);

        let feb_2025 = PartitionKey::new(2025, 2).unwrap();
        assert_eq!(feb_2025.last_day(), date(2025, 2, 28));
    }

    #[test]
    fn january_has_744_hours_and_june_720() {
        assert_eq!(PartitionKey::new(2025, 1).unwrap().hours(), 744);
        assert_eq!(PartitionKey::new(2025, 6).unwrap().hours(), 720);
    }

    #[test]
    fn contains_only_dates_in_month() {
        let key = PartitionKey::new(2025, 1).unwrap();
        assert!(key.contains(date(2025, 1, 1)));
        assert!(key.contains(date(2025, 1, 31)));
        assert!(!key.contains(date(2024, 12, 31)));
        assert!(!key.contains(date(2025, 2, 1)));
    }

    #[test]
    fn display_and_compact_forms() {
        let key = PartitionKey::new(2025, 3).unwrap();
        assert_eq!(key.to_string(), "2025-03");
        assert_eq!(key.compact(), "202503");
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!("2025-1".parse::<PartitionKey>().is_err());
        assert!("202501".parse::<PartitionKey>().is_err());
        assert!("2025-13".parse::<PartitionKey>().is_err());
        assert_eq!(
            "2025-06".parse::<PartitionKey>().unwrap(),
            PartitionKey::new(2025, 6).unwrap()
        );
    }

    #[test]
    fn serde_uses_display_form() {
        let key = PartitionKey::new(2025, 1).unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"2025-01\"");
        assert!(serde_json::from_str::<PartitionKey>("\"2025-00\"").is_err());
    }

    proptest! {
        #[test]
        fn month_is_contiguous_with_neighbours(year in 1001i32..9998, month in 1u32..=12) {
            let key = PartitionKey::new(year, month).unwrap();
            let next = key.next().unwrap();
            let previous = key.previous().unwrap();
            prop_assert_eq!(key.last_day().succ_opt().unwrap(), next.first_day());
            prop_assert_eq!(previous.last_day().succ_opt().unwrap(), key.first_day());
            prop_assert_eq!(next.previous(), Some(key));
        }
    }
}
