//! Default date window and date normalization for metric requests

use super::RequestSignature;
use crate::{Error, Result};
use chrono::{Duration, NaiveDate, NaiveDateTime};

/// Warehouse timestamp format (`YYYYMMDDHHMMSS`)
pub const DATETIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Length of the default reporting window ending now
pub const DEFAULT_INTERVAL_DAYS: i64 = 14;

const DATETIME_INPUT_FORMATS: &[&str] = &[
    "%Y%m%d%H%M%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
];
const DATE_INPUT_FORMATS: &[&str] = &["%Y%m%d", "%Y-%m-%d"];

/// Normalize a date to midnight in warehouse format (`YYYYMMDD000000`)
pub fn normalize_date(value: &str) -> Result<String> {
    let value = value.trim();
    let date = DATETIME_INPUT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|dt| dt.date())
        .or_else(|| {
            DATE_INPUT_FORMATS
                .iter()
                .find_map(|fmt| NaiveDate::parse_from_str(value, fmt).ok())
        })
        .ok_or_else(|| Error::InvalidInput(format!("unparseable date {:?}", value)))?;

    Ok(format!("{}000000", date.format("%Y%m%d")))
}

/// Fill in `date_start`/`date_end` when absent and normalize them when given.
///
/// The default window ends at `now` and starts [`DEFAULT_INTERVAL_DAYS`]
/// earlier.
pub fn apply_defaults(signature: &mut RequestSignature, now: NaiveDateTime) -> Result<()> {
    let end = now;
    let start = now - Duration::days(DEFAULT_INTERVAL_DAYS);

    for (field, fallback) in [("date_start", start), ("date_end", end)] {
        let normalized = match signature.present(field) {
            Some(value) => normalize_date(value)?,
            None => format!("{}000000", fallback.format("%Y%m%d")),
        };
        signature.set(field, normalized);
    }
    Ok(())
}
