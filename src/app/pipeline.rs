//! Shared "fit pipeline" logic used by the `fit` and `demo` commands.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! weights -> options -> parallel region fits -> summaries and records
//!
//! The commands can then focus on where the regions come from and where the
//! results go.

use std::path::{Path, PathBuf};

use log::{error, info};

use crate::cli::FitTuning;
use crate::domain::{DatasetName, DatasetWeights, FitRecord, RegionDataset};
use crate::error::AppError;
use crate::fit::{FitOptions, fit_regions};
use crate::models::IntegrationLock;
use crate::report::format_fit_summary;

/// Environment variable naming a dataset weights JSON file.
pub const WEIGHTS_ENV: &str = "EPI_WEIGHTS";

/// All computed outputs of one batch of region fits.
#[derive(Debug, Default)]
pub struct FitRun {
    /// Text summary of every successful fit, in input order.
    pub summaries: Vec<String>,
    pub records: Vec<FitRecord>,
    /// Region name and error of every failed fit.
    pub failures: Vec<(String, AppError)>,
}

/// Weights from `path`, else from `EPI_WEIGHTS`, else the defaults.
pub fn load_weights(path: Option<&Path>) -> Result<DatasetWeights, AppError> {
    let from_env = std::env::var_os(WEIGHTS_ENV).map(PathBuf::from);
    match path.map(Path::to_path_buf).or(from_env) {
        Some(path) => {
            info!("loading dataset weights from {}", path.display());
            DatasetWeights::from_json_file(&path)
        }
        None => Ok(DatasetWeights::default()),
    }
}

pub fn fit_options_from_args(tuning: &FitTuning) -> FitOptions {
    let defaults = FitOptions::default();
    FitOptions {
        datasets: if tuning.datasets.is_empty() {
            DatasetName::DEFAULT_FIT.to_vec()
        } else {
            tuning.datasets.clone()
        },
        method: tuning.method,
        test_splits: if tuning.no_test { Vec::new() } else { tuning.splits.clone() },
        unvary: tuning.unvary.clone(),
        outbreak_shift: tuning.outbreak_shift,
        sigma_conf: tuning.sigma_conf,
        sigma_pred: tuning.sigma_pred,
        first_time: tuning.first_time,
        max_nfev: tuning.max_nfev.unwrap_or(defaults.max_nfev),
        ..defaults
    }
}

/// Fit every region in parallel and collect summaries, records and failures.
pub fn run_fits(regions: &[RegionDataset], tuning: &FitTuning) -> Result<FitRun, AppError> {
    let weights = load_weights(tuning.weights.as_deref())?;
    let options = fit_options_from_args(tuning);
    let lock = IntegrationLock::new();

    let mut run = FitRun::default();
    for (region, result) in regions
        .iter()
        .zip(fit_regions(regions, tuning.model, &weights, &lock, &options))
    {
        let outcome = result.and_then(|fit| Ok((format_fit_summary(&fit)?, fit.to_record()?)));
        match outcome {
            Ok((summary, record)) => {
                run.summaries.push(summary);
                run.records.push(record);
            }
            Err(err) => {
                error!("{}: fit failed: {err}", region.name());
                run.failures.push((region.name().to_string(), err));
            }
        }
    }
    Ok(run)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;

    fn tuning(args: &[&str]) -> FitTuning {
        let mut argv = vec!["epi", "demo"];
        argv.extend_from_slice(args);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Demo(args) => args.tuning,
            _ => unreachable!(),
        }
    }

    #[test]
    fn options_follow_the_arguments() {
        let options = fit_options_from_args(&tuning(&[]));
        assert_eq!(options.datasets, DatasetName::DEFAULT_FIT.to_vec());
        assert_eq!(options.test_splits, vec![5, 3]);
        assert_eq!(options.max_nfev, FitOptions::default().max_nfev);

        let options = fit_options_from_args(&tuning(&["--no-test", "--datasets", "dead", "--max-nfev", "50"]));
        assert!(options.test_splits.is_empty());
        assert_eq!(options.datasets, vec![DatasetName::Dead]);
        assert_eq!(options.max_nfev, 50);
    }

    #[test]
    fn explicit_weights_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.json");
        std::fs::write(&path, r#"{"dead": 3.0}"#).unwrap();
        let weights = load_weights(Some(&path)).unwrap();
        assert_eq!(weights.get(DatasetName::Dead), 3.0);
        assert_eq!(weights.get(DatasetName::Recovered), 1.0);
    }

    #[test]
    fn failing_regions_are_collected() {
        let region = crate::data::synthetic_region("bad", 20, 1).unwrap();
        // an outbreak shift past the observations leaves nothing to fit
        let run = run_fits(
            std::slice::from_ref(&region),
            &tuning(&["--no-test", "--outbreak-shift", "-40"]),
        )
        .unwrap();
        assert!(run.summaries.is_empty());
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].0, "bad");
        assert_eq!(run.failures[0].1.exit_code(), 2);
    }
}
