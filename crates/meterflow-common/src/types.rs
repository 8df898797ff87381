//! Shared domain types

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::MeterflowError;

/// Bucket and key of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> &str {
        file_name(&self.key)
    }

    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self::new(self.bucket.clone(), key)
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Last path segment of an object key
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Accepted archive partition names
pub const ISO_WEEK_PATTERN: &str = r"^\d{4}-W(0[1-9]|[1-4]\d|5[0-3])$";

fn week_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(ISO_WEEK_PATTERN).ok()).as_ref()
}

/// ISO 8601 week, rendered as `2026-W03`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IsoWeek {
    year: i32,
    week: u32,
}

impl IsoWeek {
    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn week(&self) -> u32 {
        self.week
    }

    pub fn of_date(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }

    pub fn of(timestamp: DateTime<Utc>) -> Self {
        Self::of_date(timestamp.date_naive())
    }

    /// The week before the one containing `now`
    pub fn previous(now: DateTime<Utc>) -> Self {
        Self::of_date(now.date_naive() - Duration::days(7))
    }

    /// Monday of this week
    pub fn monday(&self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)
    }
}

impl fmt::Display for IsoWeek {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-W{:02}", self.year, self.week)
    }
}

impl FromStr for IsoWeek {
    type Err = MeterflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !week_pattern().is_some_and(|p| p.is_match(s)) {
            return Err(MeterflowError::InvalidWeek(s.to_string()));
        }

        let year: i32 = s[..4]
            .parse()
            .map_err(|_| MeterflowError::InvalidWeek(s.to_string()))?;
        let week: u32 = s[6..]
            .parse()
            .map_err(|_| MeterflowError::InvalidWeek(s.to_string()))?;

        // W53 only exists in long years
        NaiveDate::from_isoywd_opt(year, week, Weekday::Mon)
            .ok_or_else(|| MeterflowError::InvalidWeek(s.to_string()))?;

        Ok(Self { year, week })
    }
}

impl TryFrom<String> for IsoWeek {
    type Error = MeterflowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<IsoWeek> for String {
    fn from(week: IsoWeek) -> Self {
        week.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    #[test]
    fn test_object_location() {
        let loc = ObjectLocation::new("ingest", "landing/2026/site a.csv");
        assert_eq!(loc.file_name(), "site a.csv");
        assert_eq!(loc.to_string(), "s3://ingest/landing/2026/site a.csv");
        assert_eq!(loc.with_key("processed/site a.csv").bucket, "ingest");
    }

    #[test]
    fn test_iso_week_parse() {
        let week: IsoWeek = "2026-W03".parse().unwrap();
        assert_eq!(week.year(), 2026);
        assert_eq!(week.week(), 3);
        assert_eq!(week.to_string(), "2026-W03");

        assert!("2026-W00".parse::<IsoWeek>().is_err());
        assert!("2026-W54".parse::<IsoWeek>().is_err());
        assert!("2026-3".parse::<IsoWeek>().is_err());
        assert!(" 2026-W03".parse::<IsoWeek>().is_err());
        // 2026 has 53 ISO weeks, 2025 does not
        assert!("2026-W53".parse::<IsoWeek>().is_ok());
        assert!("2025-W53".parse::<IsoWeek>().is_err());
    }

    #[test]
    fn test_iso_week_year_boundary() {
        // 2027-01-01 is a Friday in ISO week 2026-W53
        let ts = Utc.with_ymd_and_hms(2027, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(IsoWeek::of(ts).to_string(), "2026-W53");
    }

    #[test]
    fn test_previous_week() {
        let now = Utc.with_ymd_and_hms(2026, 1, 14, 3, 0, 0).unwrap();
        assert_eq!(IsoWeek::of(now).to_string(), "2026-W03");
        assert_eq!(IsoWeek::previous(now).to_string(), "2026-W02");
    }

    #[test]
    fn test_serde_round_trip_uses_string_form() {
        let week: IsoWeek = "2026-W10".parse().unwrap();
        let json = serde_json::to_string(&week).unwrap();
        assert_eq!(json, "\"2026-W10\"");
        assert!(serde_json::from_str::<IsoWeek>("\"2026-W99\"").is_err());
    }

    proptest! {
        #[test]
        fn prop_week_of_any_date_formats_valid(days in 0i64..40_000) {
            let date = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap() + Duration::days(days);
            let week = IsoWeek::of_date(date);
            prop_assert_eq!(week.to_string().parse::<IsoWeek>().unwrap(), week);
        }
    }
}
