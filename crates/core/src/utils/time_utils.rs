//! Timestamp helpers shared by models and storage.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::errors::{Error, Result};

/// Fixed-width RFC3339 rendering (microseconds, `Z`).
///
/// Every persisted timestamp uses this format so that lexical ordering of the
/// stored text equals chronological ordering.
pub fn to_storage_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_storage_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::internal(format!("Invalid stored timestamp '{}': {}", value, e)))
}

pub fn parse_optional_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(parse_storage_timestamp).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn storage_timestamps_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 1, 9, 0, 0).unwrap();
        let later = earlier + chrono::Duration::milliseconds(250);
        let a = to_storage_timestamp(&earlier);
        let b = to_storage_timestamp(&later);
        assert_eq!(a.len(), b.len());
        assert!(a < b);
        assert_eq!(parse_storage_timestamp(&b).unwrap(), later);
    }
}
