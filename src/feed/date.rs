//! Due-date extraction from free-text item descriptions.
//!
//! Library feeds put the due date somewhere in the description, written as
//! `<day> <month abbreviation> <year>` (`"Leihfrist bis 5 Jan 2024"`). The
//! first such phrase is normalized to a calendar date.

use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use thiserror::Error;

/// `<day> <3-letter month> <year>`, optionally with abbreviation dots
/// (`5. Jan. 2024`). The month slot takes any three letters so an
/// unrecognized month is reported instead of silently skipped.
#[allow(clippy::expect_used)]
static DATE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([0-9]{1,2})\.?\s+(\p{L}{3})\.?\s+([0-9]{4})\b")
        .expect("date regex is valid") // Static pattern, safe to panic
});

/// Errors from [`DateExtractor::extract`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DateError {
    #[error("no date found in text")]
    DateNotFound,
    #[error("unknown month abbreviation '{0}'")]
    UnknownMonth(String),
    #[error("'{day} {month} {year}' is not a valid calendar date")]
    InvalidDate { day: u32, month: String, year: i32 },
}

/// Twelve month abbreviations, January first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonthTable {
    names: [String; 12],
}

impl MonthTable {
    pub fn new(names: [&str; 12]) -> Self {
        Self {
            names: names.map(str::to_string),
        }
    }

    /// German abbreviations as used by German library catalogs.
    pub fn german() -> Self {
        Self::new([
            "Jan", "Feb", "Mär", "Apr", "Mai", "Jun", "Jul", "Aug", "Sep", "Okt", "Nov", "Dez",
        ])
    }

    /// Month number (1-12) for an abbreviation. Matching is exact.
    pub fn month_number(&self, token: &str) -> Option<u32> {
        self.names
            .iter()
            .position(|name| name == token)
            .and_then(|i| u32::try_from(i + 1).ok())
    }
}

impl Default for MonthTable {
    fn default() -> Self {
        Self::german()
    }
}

/// Finds and normalizes due dates using one month table.
#[derive(Debug, Clone, Default)]
pub struct DateExtractor {
    months: MonthTable,
}

impl DateExtractor {
    pub fn new(months: MonthTable) -> Self {
        Self { months }
    }

    /// Extract the first date phrase from `text`.
    ///
    /// Only the first match is considered: if its month is unknown the
    /// result is `UnknownMonth`, even when a later phrase would be valid.
    ///
    /// # Examples
    ///
    /// ```
    /// use loanwatch::feed::DateExtractor;
    ///
    /// let dates = DateExtractor::default();
    /// let date = dates.extract("erschienen am 5 Jan 2024").unwrap();
    /// assert_eq!(date.to_string(), "2024-01-05");
    /// ```
    pub fn extract(&self, text: &str) -> Result<NaiveDate, DateError> {
        let caps = DATE_PATTERN
            .captures(text)
            .ok_or(DateError::DateNotFound)?;

        let month_token = &caps[2];
        let month = self
            .months
            .month_number(month_token)
            .ok_or_else(|| DateError::UnknownMonth(month_token.to_string()))?;

        // The pattern limits both to a few ASCII digits, so parsing cannot fail
        let day: u32 = caps[1].parse().map_err(|_| DateError::DateNotFound)?;
        let year: i32 = caps[3].parse().map_err(|_| DateError::DateNotFound)?;

        NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| DateError::InvalidDate {
            day,
            month: month_token.to_string(),
            year,
        })
    }

    /// Extract and format as `YYYY-MM-DD`.
    pub fn extract_iso(&self, text: &str) -> Result<String, DateError> {
        self.extract(text).map(|d| d.format("%Y-%m-%d").to_string())
    }
}
