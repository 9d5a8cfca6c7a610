//! Read/write region JSON files.
//!
//! A region file holds one [`RegionRecord`] or an array of them: population,
//! capacity and Rt schedules, stored parameter specs, and the daily
//! observations. Validation happens in [`RegionDataset::from_record`].

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::{RegionDataset, RegionRecord};
use crate::error::AppError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RegionFile {
    Many(Vec<RegionRecord>),
    One(Box<RegionRecord>),
}

/// Read every region record in a JSON file.
pub fn read_region_records(path: &Path) -> Result<Vec<RegionRecord>, AppError> {
    let file = File::open(path)?;
    let parsed: RegionFile = serde_json::from_reader(BufReader::new(file))?;
    Ok(match parsed {
        RegionFile::Many(records) => records,
        RegionFile::One(record) => vec![*record],
    })
}

/// Read and validate every region in a JSON file.
pub fn load_regions(path: &Path) -> Result<Vec<RegionDataset>, AppError> {
    read_region_records(path)?
        .into_iter()
        .map(RegionDataset::from_record)
        .collect()
}

/// Write region records as a JSON array.
pub fn write_region_records(path: &Path, records: &[RegionRecord]) -> Result<(), AppError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, records)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_record;
    use std::io::Write;

    #[test]
    fn records_round_trip_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regions.json");
        let records = vec![synthetic_record("a", 20, 1).unwrap(), synthetic_record("b", 20, 2).unwrap()];
        write_region_records(&path, &records).unwrap();

        let back = read_region_records(&path).unwrap();
        assert_eq!(back, records);
        let regions = load_regions(&path).unwrap();
        assert_eq!(regions[1].name(), "b");
    }

    #[test]
    fn single_object_with_defaults_is_accepted() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "name": "solo",
                "population": 500,
                "first_positive": "2020-03-02",
                "capacity": [{{"date": "2020-03-01", "capacity": 5.0}}],
                "rt": [{{"date": "2020-03-01", "init": 2.0, "min": 0.5, "max": 4.0, "stderr": null}}],
                "params": [{{"parameter": "infectious_rate", "init": 0.2, "min": 0.1, "max": 0.4}}],
                "days": [
                    {{"date": "2020-03-01", "infected": 0, "infectious": 0, "critical_cared": 0, "infectious_all": 0, "recovered": 0, "dead": 0}},
                    {{"date": "2020-03-02", "infected": 3, "infectious": 3, "critical_cared": 0, "infectious_all": 3, "recovered": 0, "dead": 0}}
                ]
            }}"#
        )
        .unwrap();
        let records = read_region_records(file.path()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].params[0].vary);
        assert_eq!(records[0].outbreak_shift, 0);

        let region = RegionDataset::from_record(records[0].clone()).unwrap();
        assert_eq!(region.seed_infections(), 3);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_region_records(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, AppError::Io(_)));
        assert_eq!(err.exit_code(), 5);
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{\"name\": 3}}").unwrap();
        let err = read_region_records(file.path()).unwrap_err();
        assert!(matches!(err, AppError::Json(_)));
        assert_eq!(err.exit_code(), 5);
    }
}
