//! Repetition flattening
//!
//! Converts nested [`RepRecord`]s into flat [`FeatureRow`]s:
//! - `down_<metric>` / `up_<metric>` for phase metrics (raw frame index excluded)
//! - `rom_<metric>` for range-of-motion metrics
//! - timestamps normalized to UTC, or missing when unparseable

use crate::types::{FeatureRow, FeatureTable, MetricMap, RawTimestamp, RepRecord};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use std::collections::HashMap;

/// Phase metric holding the capture frame number, never a feature
pub const FRAME_KEY: &str = "frame";

/// Column prefix for range-of-motion metrics
pub const ROM_PREFIX: &str = "rom_";

/// Naive date/time layouts accepted after RFC 3339; interpreted as UTC
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Flattener for converting repetition records into feature rows
pub struct Flattener;

impl Flattener {
    /// Flatten a batch of records into a table, one row per record
    pub fn flatten(records: &[RepRecord]) -> FeatureTable {
        let mut table = FeatureTable::new();

        for record in records {
            let (row, columns) = flatten_record(record);
            for column in &columns {
                table.register_column(column);
            }
            table.rows.push(row);
        }

        table
    }

    /// Flatten a single record
    pub fn flatten_one(record: &RepRecord) -> FeatureRow {
        flatten_record(record).0
    }
}

/// Build the row and the ordered list of numeric columns it introduced
fn flatten_record(record: &RepRecord) -> (FeatureRow, Vec<String>) {
    let mut values = HashMap::new();
    let mut columns = Vec::new();

    let mut add = |name: String, value: f64| {
        columns.push(name.clone());
        values.insert(name, value);
    };

    for (phase, metrics) in [("down", &record.down), ("up", &record.up)] {
        for (key, value) in phase_metrics(metrics) {
            add(format!("{}_{}", phase, key), value);
        }
    }

    for (key, value) in &record.range_of_motion {
        add(format!("{}{}", ROM_PREFIX, key), *value);
    }

    let row = FeatureRow {
        source_file: record.source_file.clone(),
        rep_number: record.rep_number,
        duration_sec: record.duration_sec,
        valid_rep: record.valid_rep,
        values,
        timestamp_start: normalize_timestamp(record.timestamp_start.as_ref()),
        timestamp_end: normalize_timestamp(record.timestamp_end.as_ref()),
    };

    (row, columns)
}

fn phase_metrics(metrics: &MetricMap) -> impl Iterator<Item = (&String, f64)> {
    metrics
        .iter()
        .filter(|(key, _)| key.as_str() != FRAME_KEY)
        .map(|(key, value)| (key, *value))
}

/// Normalize a raw timestamp to UTC.
///
/// Numbers are epoch milliseconds; strings are RFC 3339 or a naive date/time
/// taken as UTC. Anything else, or anything out of range, is `None`.
pub fn normalize_timestamp(raw: Option<&RawTimestamp>) -> Option<DateTime<Utc>> {
    match raw? {
        RawTimestamp::EpochMillis(ms) if ms.is_finite() => {
            Utc.timestamp_millis_opt(ms.round() as i64).single()
        }
        RawTimestamp::EpochMillis(_) => None,
        RawTimestamp::Text(text) => parse_datetime(text.trim()),
        RawTimestamp::Unsupported(_) => None,
    }
}

fn parse_datetime(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn make_record() -> RepRecord {
        RepRecord {
            source_file: "session.json".to_string(),
            rep_number: Some(4),
            duration_sec: Some(2.0),
            valid_rep: None,
            down: MetricMap::from([
                ("frame".to_string(), 12.0),
                ("elbow_angle".to_string(), 70.0),
                ("trunk_slope".to_string(), 0.1),
            ]),
            up: MetricMap::from([
                ("frame".to_string(), 40.0),
                ("elbow_angle".to_string(), 160.0),
            ]),
            range_of_motion: MetricMap::from([("elbow_delta".to_string(), 90.0)]),
            timestamp_start: Some(RawTimestamp::EpochMillis(1_705_327_200_000.0)),
            timestamp_end: Some(RawTimestamp::Text("not a date".to_string())),
        }
    }

    #[test]
    fn test_flatten_columns() {
        let table = Flattener::flatten(&[make_record()]);

        assert_eq!(
            table.columns,
            vec![
                "down_elbow_angle",
                "down_trunk_slope",
                "up_elbow_angle",
                "rom_elbow_delta"
            ]
        );

        let row = &table.rows[0];
        assert_eq!(row.get("down_elbow_angle"), Some(70.0));
        assert_eq!(row.get("up_elbow_angle"), Some(160.0));
        assert_eq!(row.get("rom_elbow_delta"), Some(90.0));
        assert!(!row.has("down_frame"));
        assert!(!row.has("up_frame"));
    }

    #[test]
    fn test_flatten_passthrough() {
        let row = Flattener::flatten_one(&make_record());

        assert_eq!(row.source_file, "session.json");
        assert_eq!(row.rep_number, Some(4));
        assert_eq!(row.duration_sec, Some(2.0));
        assert_eq!(row.valid_rep, None);
    }

    #[test]
    fn test_bad_timestamp_degrades_to_missing() {
        let row = Flattener::flatten_one(&make_record());

        assert_eq!(
            row.timestamp_start.map(|t| t.to_rfc3339()),
            Some("2024-01-15T14:00:00+00:00".to_string())
        );
        assert_eq!(row.timestamp_end, None);
    }

    #[test]
    fn test_normalize_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 14, 0, 0).single();

        for text in [
            "2024-01-15T14:00:00Z",
            "2024-01-15T15:00:00+01:00",
            "2024-01-15T14:00:00.000",
            "2024-01-15 14:00:00",
        ] {
            let raw = RawTimestamp::Text(text.to_string());
            assert_eq!(normalize_timestamp(Some(&raw)), expected, "{}", text);
        }

        let date_only = RawTimestamp::Text("2024-01-15".to_string());
        assert_eq!(
            normalize_timestamp(Some(&date_only)),
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).single()
        );
    }

    #[test]
    fn test_normalize_timestamp_rejects() {
        assert_eq!(normalize_timestamp(None), None);
        assert_eq!(
            normalize_timestamp(Some(&RawTimestamp::EpochMillis(f64::INFINITY))),
            None
        );
        assert_eq!(
            normalize_timestamp(Some(&RawTimestamp::EpochMillis(1e300))),
            None
        );
        assert_eq!(
            normalize_timestamp(Some(&RawTimestamp::Unsupported("{}".to_string()))),
            None
        );
    }

    #[test]
    fn test_columns_union_across_rows() {
        let mut second = make_record();
        second.down.insert("hip_angle".to_string(), 170.0);
        let table = Flattener::flatten(&[make_record(), second]);

        assert_eq!(table.len(), 2);
        assert!(table.has_column("down_hip_angle"));
        assert!(!table.rows[0].has("down_hip_angle"));
        assert!(table.rows[1].has("down_hip_angle"));
    }
}
