//! Command-line parsing for the epidemic curve fitter.
//!
//! The goal of this module is to keep **argument parsing** separate from the
//! modeling/fitting code; `app` turns these structs into library calls.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::domain::{DatasetName, FitMethod, ModelKind, SanityMode};

/// Top-level CLI.
#[derive(Debug, Parser)]
#[command(name = "epi", version, about = "Capacity-aware epidemic model simulator and fitter")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Fit every region of a region JSON file, print scores and optionally export them.
    Fit(FitArgs),
    /// Simulate one region with its stored parameter values.
    Simulate(SimulateArgs),
    /// Generate synthetic regions from known parameters and fit them.
    Demo(DemoArgs),
}

/// Knobs shared by `fit` and `demo`.
#[derive(Debug, Parser, Clone)]
pub struct FitTuning {
    /// Model variant to fit.
    #[arg(short = 'm', long, value_enum, default_value_t = ModelKind::SeicrdRlc)]
    pub model: ModelKind,

    /// Datasets to fit against (comma separated). Defaults to
    /// critical_cared, infectious_all, recovered, dead.
    #[arg(short = 'd', long, value_enum, value_delimiter = ',')]
    pub datasets: Vec<DatasetName>,

    /// Walk-forward split counts (comma separated, each at least 2).
    #[arg(long, value_delimiter = ',', default_values_t = [5, 3])]
    pub splits: Vec<usize>,

    /// Skip cross-validation; only the full-data fit is scored.
    #[arg(long)]
    pub no_test: bool,

    /// Parameters to hold at their stored value (comma separated).
    #[arg(long, value_delimiter = ',')]
    pub unvary: Vec<String>,

    /// Fixed outbreak shift in days; derived from the incubation period when unset.
    #[arg(long, allow_negative_numbers = true)]
    pub outbreak_shift: Option<i64>,

    /// Optimization method.
    #[arg(long, value_enum, default_value_t = FitMethod::LevenbergMarquardt)]
    pub method: FitMethod,

    /// Sigma of the confidence band.
    #[arg(long, default_value_t = 2.0)]
    pub sigma_conf: f64,

    /// Sigma of the prediction band (defaults to --sigma-conf).
    #[arg(long)]
    pub sigma_pred: Option<f64>,

    /// Run one full-data fit first to warm-start cross-validation.
    #[arg(long)]
    pub first_time: bool,

    /// Maximum number of residual evaluations per least-squares run.
    #[arg(long)]
    pub max_nfev: Option<usize>,

    /// Dataset weights JSON (`{"dead": 2.0, ...}`); overrides EPI_WEIGHTS.
    #[arg(long, value_name = "JSON")]
    pub weights: Option<PathBuf>,

    /// Export fit records to JSON.
    #[arg(long, value_name = "JSON")]
    pub export: Option<PathBuf>,
}

/// Options for fitting a region file.
#[derive(Debug, Parser, Clone)]
pub struct FitArgs {
    /// Region JSON file (one region object or an array of them).
    #[arg(short = 'i', long, value_name = "JSON")]
    pub input: PathBuf,

    #[command(flatten)]
    pub tuning: FitTuning,
}

/// Options for simulating one region.
#[derive(Debug, Parser, Clone)]
pub struct SimulateArgs {
    /// Region JSON file (one region object or an array of them).
    #[arg(short = 'i', long, value_name = "JSON")]
    pub input: PathBuf,

    /// Region to simulate (defaults to the first one in the file).
    #[arg(short = 'r', long)]
    pub region: Option<String>,

    /// Model variant to simulate.
    #[arg(short = 'm', long, value_enum, default_value_t = ModelKind::SeicrdRlc)]
    pub model: ModelKind,

    /// Days to simulate (defaults to the observed days under the shift).
    #[arg(long)]
    pub days: Option<usize>,

    /// Outbreak shift in days (defaults to the region's stored shift).
    #[arg(long, allow_negative_numbers = true)]
    pub shift: Option<i64>,

    /// How negative values are treated.
    #[arg(long, value_enum, default_value_t = SanityMode::Clamp)]
    pub sanity: SanityMode,

    /// Export the trajectories as a day-per-row CSV.
    #[arg(long, value_name = "CSV")]
    pub export_csv: Option<PathBuf>,

    /// Export the trajectories as JSON.
    #[arg(long, value_name = "JSON")]
    pub export_json: Option<PathBuf>,
}

/// Options for the synthetic demo.
#[derive(Debug, Parser, Clone)]
pub struct DemoArgs {
    /// Number of synthetic regions.
    #[arg(short = 'n', long, default_value_t = 2)]
    pub regions: usize,

    /// Observed days per region.
    #[arg(long, default_value_t = 80)]
    pub days: usize,

    /// Random seed for the observation noise (region `k` uses seed + k).
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Log-space standard deviation of the observation noise.
    #[arg(long, default_value_t = 0.05)]
    pub noise: f64,

    /// Write the generated regions to this JSON file.
    #[arg(long, value_name = "JSON")]
    pub write_sample: Option<PathBuf>,

    #[command(flatten)]
    pub tuning: FitTuning,
}
