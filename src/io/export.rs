//! Export fit and simulation results.
//!
//! - fit records as JSON, ready for persistence
//! - simulation records as JSON, or as a day-per-row CSV that is easy to
//!   consume in spreadsheets or downstream scripts

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::{FitRecord, SimulationRecord};
use crate::error::AppError;

pub fn write_fit_records(path: &Path, records: &[FitRecord]) -> Result<(), AppError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), records)?;
    Ok(())
}

pub fn write_simulation_json(path: &Path, record: &SimulationRecord) -> Result<(), AppError> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), record)?;
    Ok(())
}

/// One row per simulated day: the date, every dataset channel, then every
/// raw series.
pub fn write_simulation_csv(path: &Path, record: &SimulationRecord) -> Result<(), AppError> {
    let mut file = BufWriter::new(File::create(path)?);

    let mut header = vec!["date".to_string()];
    header.extend(record.datasets.keys().map(|d| d.as_str().to_string()));
    header.extend(record.series.keys().cloned());
    writeln!(file, "{}", header.join(","))?;

    for (i, date) in record.dates.iter().enumerate() {
        let mut row = vec![date.to_string()];
        for values in record.datasets.values().chain(record.series.values()) {
            row.push(values.get(i).map(|v| format!("{v:.6}")).unwrap_or_default());
        }
        writeln!(file, "{}", row.join(","))?;
    }
    file.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_region;
    use crate::domain::{ModelKind, SanityMode};
    use crate::models::{CompartmentalModel, IntegrationLock, ParamSet};

    fn simulation_record(shift: i64) -> SimulationRecord {
        let region = synthetic_region("csv", 15, 5).unwrap();
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let params = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();
        model
            .simulate(&params, 20, shift, SanityMode::Clamp)
            .unwrap()
            .to_record(region.name())
    }

    #[test]
    fn simulation_csv_has_one_row_per_day() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.csv");
        let record = simulation_record(2);
        write_simulation_csv(&path, &record).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 21);
        assert!(lines[0].starts_with("date,"));
        assert!(lines[0].contains("dead"));
        assert!(lines[0].contains("capacity"));
        let columns = lines[0].split(',').count();
        assert!(lines.iter().all(|l| l.split(',').count() == columns));
        // shift 2: the first simulated day is two days before the first observation
        assert!(lines[1].starts_with("2020-02-28,"));
    }

    #[test]
    fn simulation_json_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.json");
        // non-finite values are written as null, so keep capacity finite
        let record = simulation_record(0);
        write_simulation_json(&path, &record).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let back: SimulationRecord = serde_json::from_str(&text).unwrap();
        assert_eq!(back.dates, record.dates);
        assert_eq!(back.datasets.len(), 6);
    }
}
