//! Shared domain types.
//!
//! These types are intentionally kept lightweight and serializable so they can be:
//!
//! - received from the persistence/collector layer as plain records
//! - used in-memory during simulation and fitting
//! - handed back to persistence or visualization as plain records

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::NaiveDate;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Absolute tolerance used by the sanity pass and the model's own invariant checks.
pub const SANITY_TOLERANCE: f64 = 1e-7;

/// Tolerance under which `min` and `max` are considered equal (parameter is fixed).
pub const BOUNDS_TOLERANCE: f64 = 1e-13;

/// One of the six observed / predicted daily series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum DatasetName {
    /// Cumulative confirmed infections.
    Infected,
    /// Active cases not in hospital.
    Infectious,
    /// Active cases in hospital.
    CriticalCared,
    /// All active cases.
    InfectiousAll,
    Recovered,
    Dead,
}

impl DatasetName {
    pub const ALL: [DatasetName; 6] = [
        DatasetName::Infected,
        DatasetName::Infectious,
        DatasetName::CriticalCared,
        DatasetName::InfectiousAll,
        DatasetName::Recovered,
        DatasetName::Dead,
    ];

    /// Datasets fitted against when the caller does not choose.
    pub const DEFAULT_FIT: [DatasetName; 4] = [
        DatasetName::CriticalCared,
        DatasetName::InfectiousAll,
        DatasetName::Recovered,
        DatasetName::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DatasetName::Infected => "infected",
            DatasetName::Infectious => "infectious",
            DatasetName::CriticalCared => "critical_cared",
            DatasetName::InfectiousAll => "infectious_all",
            DatasetName::Recovered => "recovered",
            DatasetName::Dead => "dead",
        }
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatasetName {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DatasetName::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| AppError::UnknownDatasetName(s.to_string()))
    }
}

/// How the simulator treats negative compartment values and flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SanityMode {
    /// Pass values through untouched.
    Ignore,
    /// Floor negative values to 0.
    #[default]
    Clamp,
    /// Fail on any negative value beyond [`SANITY_TOLERANCE`].
    Strict,
}

/// Concrete compartmental model variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum ModelKind {
    /// SEICRD with capacity-limited care, overflow exposure and test coverage.
    #[default]
    SeicrdRlc,
    /// SEICRD with time-varying Rt and unlimited care.
    SeicrdR,
    /// Plain SEIRD with time-varying Rt.
    Seird,
}

impl ModelKind {
    /// Human-readable label for terminal output.
    pub fn display_name(self) -> &'static str {
        match self {
            ModelKind::SeicrdRlc => "SEICRD-RLC",
            ModelKind::SeicrdR => "SEICRD-R",
            ModelKind::Seird => "SEIRD",
        }
    }

    /// Named (non-Rt) parameters this variant reads.
    pub fn param_names(self) -> &'static [&'static str] {
        match self {
            ModelKind::SeicrdRlc => &[
                "infectious_rate",
                "critical_chance",
                "critical_rate",
                "recovery_rate_normal",
                "recovery_rate_critical",
                "death_chance_normal",
                "death_rate_normal",
                "death_chance_over",
                "death_rate_over",
                "exposed_rate_over",
                "k",
                "capacity_multiplier",
                "test_coverage_0",
                "test_coverage_increase",
                "test_coverage_max",
            ],
            ModelKind::SeicrdR => &[
                "infectious_rate",
                "critical_chance",
                "critical_rate",
                "recovery_rate_normal",
                "recovery_rate_critical",
                "death_chance_normal",
                "death_rate_normal",
                "k",
            ],
            ModelKind::Seird => &[
                "infectious_rate",
                "recovery_rate_normal",
                "death_chance_normal",
                "death_rate_normal",
                "k",
            ],
        }
    }

    /// Whether the variant routes critical patients through hospital capacity.
    pub fn is_capacity_constrained(self) -> bool {
        matches!(self, ModelKind::SeicrdRlc)
    }
}

/// Optimization method for the least-squares fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum FitMethod {
    /// Levenberg–Marquardt with adaptive damping.
    #[default]
    LevenbergMarquardt,
    /// Undamped Gauss–Newton steps (falls back to damping only to stay finite).
    GaussNewton,
}

/// Stored bounds and flags for one fit parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub init: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub vary: bool,
    /// Name of another parameter this one is tied to.
    pub expr: Option<String>,
    pub stderr: Option<f64>,
}

impl ParamSpec {
    /// A free parameter bounded to `[min, max]`.
    pub fn bounded(init: f64, min: f64, max: f64) -> Self {
        Self {
            init,
            min: Some(min),
            max: Some(max),
            vary: true,
            expr: None,
            stderr: None,
        }
    }

    /// A parameter held at `value`.
    pub fn fixed(value: f64) -> Self {
        Self {
            init: value,
            min: Some(value),
            max: Some(value),
            vary: false,
            expr: None,
            stderr: None,
        }
    }

    /// True when `min` and `max` are both set and (numerically) equal.
    pub fn bounds_collapsed(&self) -> bool {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => is_close(lo, hi, BOUNDS_TOLERANCE, BOUNDS_TOLERANCE),
            _ => false,
        }
    }

    /// Effective free flag: stored `vary`, not tied, bounds not collapsed.
    pub fn is_free(&self) -> bool {
        self.vary && self.expr.is_none() && !self.bounds_collapsed()
    }
}

/// `math.isclose` semantics.
pub fn is_close(a: f64, b: f64, rel_tol: f64, abs_tol: f64) -> bool {
    if a == b {
        return true;
    }
    let diff = (a - b).abs();
    diff <= (rel_tol * a.abs().max(b.abs())).max(abs_tol)
}

/// One day of observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRecord {
    pub date: NaiveDate,
    pub infected: f64,
    pub infectious: f64,
    pub critical_cared: f64,
    pub infectious_all: f64,
    pub recovered: f64,
    pub dead: f64,
}

/// Hospital capacity effective from `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityRecord {
    pub date: NaiveDate,
    pub capacity: f64,
}

/// Rt breakpoint effective from `date`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtRecord {
    pub date: NaiveDate,
    pub init: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub stderr: Option<f64>,
}

/// Named model parameter as stored by persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamRecord {
    pub parameter: String,
    pub init: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    #[serde(default = "default_true")]
    pub vary: bool,
    #[serde(default)]
    pub expr: Option<String>,
    #[serde(default)]
    pub stderr: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// Frozen input record set for one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionRecord {
    pub name: String,
    pub population: u64,
    /// Infections present on the first positive day; defaults to the
    /// cumulative count observed on that day.
    #[serde(default)]
    pub seed: Option<u64>,
    pub first_positive: NaiveDate,
    #[serde(default)]
    pub outbreak_shift: i64,
    pub capacity: Vec<CapacityRecord>,
    pub rt: Vec<RtRecord>,
    pub params: Vec<ParamRecord>,
    pub days: Vec<DayRecord>,
}

/// Per-dataset residual weights, set once before any fit runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetWeights(BTreeMap<DatasetName, f64>);

impl Default for DatasetWeights {
    fn default() -> Self {
        Self(BTreeMap::from([
            (DatasetName::Infected, 1.0),
            (DatasetName::Infectious, 2.0),
            (DatasetName::CriticalCared, 1.75),
            (DatasetName::InfectiousAll, 2.125),
            (DatasetName::Recovered, 2.125),
            (DatasetName::Dead, 2.125),
        ]))
    }
}

impl DatasetWeights {
    pub fn new(weights: BTreeMap<DatasetName, f64>) -> Result<Self, AppError> {
        for (name, w) in &weights {
            if !(w.is_finite() && *w > 0.0) {
                return Err(AppError::invalid(format!("Invalid weight {w} for dataset {name}.")));
            }
        }
        Ok(Self(weights))
    }

    /// Weight for `name`; datasets missing from the table weigh 1.
    pub fn get(&self, name: DatasetName) -> f64 {
        self.0.get(&name).copied().unwrap_or(1.0)
    }

    /// Load a weights table from a JSON object `{ "dead": 2.0, ... }`.
    pub fn from_json_file(path: &Path) -> Result<Self, AppError> {
        let file = std::fs::File::open(path)?;
        let raw: BTreeMap<DatasetName, f64> = serde_json::from_reader(file)?;
        Self::new(raw)
    }
}

/// Fitted value of one named parameter, for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamUpdate {
    pub name: String,
    pub value: f64,
    pub stderr: f64,
}

/// Fitted value of one Rt breakpoint, for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtUpdate {
    pub date: NaiveDate,
    pub value: f64,
    pub stderr: f64,
}

/// Fixed-schema goodness-of-fit record for one dataset row (or the flattened row).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub dataset: String,
    pub n_free_params: usize,
    pub residual_mean: f64,
    pub residual_median: f64,
    pub max_error: f64,
    pub mae: f64,
    pub mse: f64,
    pub rmse: f64,
    pub rmsle: f64,
    pub explained_variance: f64,
    pub r2: f64,
    pub r2_adj: f64,
    pub smape: f64,
    pub mase: f64,
    pub chisqr: f64,
    pub redchi: f64,
    pub aic: f64,
    pub aicc: f64,
    pub bic: f64,
    pub durbin_watson: f64,
    pub residual_normality_p: f64,
    pub residual_runs_p: f64,
    pub pearson_data_p: f64,
    pub pearson_residual_p: f64,
    pub anova_mean_p: f64,
    pub anova_data_p: f64,
    pub anova_residual_p: f64,
    pub ks_data_p: f64,
    pub ks_residual_p: f64,
    pub prediction_interval: f64,
}

/// Everything persistence needs from one completed fit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitRecord {
    pub region: String,
    pub model: ModelKind,
    pub outbreak_shift: i64,
    pub n_free_params: usize,
    pub params: Vec<ParamUpdate>,
    pub rt: Vec<RtUpdate>,
    pub fit_scores: Vec<ScoreRecord>,
    pub fit_scores_flat: ScoreRecord,
    pub test_scores: Option<Vec<ScoreRecord>>,
    pub test_scores_flat: Option<ScoreRecord>,
}

/// Simulated trajectories exported for visualization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationRecord {
    pub region: String,
    pub model: ModelKind,
    pub outbreak_shift: i64,
    pub dates: Vec<NaiveDate>,
    /// Test-coverage scaled channels, comparable with observations.
    pub datasets: BTreeMap<DatasetName, Vec<f64>>,
    /// Raw compartments and diagnostics keyed by name.
    pub series: BTreeMap<String, Vec<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataset_names_round_trip_through_strings() {
        for d in DatasetName::ALL {
            assert_eq!(d.as_str().parse::<DatasetName>().unwrap(), d);
        }
        let err = "hospitalized".parse::<DatasetName>().unwrap_err();
        assert!(matches!(err, AppError::UnknownDatasetName(ref s) if s == "hospitalized"));
    }

    #[test]
    fn collapsed_bounds_force_parameter_fixed() {
        let mut p = ParamSpec::bounded(0.5, 0.3, 0.3 + 1e-15);
        assert!(p.vary);
        assert!(!p.is_free());

        p.max = Some(0.9);
        assert!(p.is_free());

        p.expr = Some("other".into());
        assert!(!p.is_free());
    }

    #[test]
    fn missing_weights_default_to_one() {
        let weights = DatasetWeights::new(BTreeMap::from([(DatasetName::Dead, 3.0)])).unwrap();
        assert_eq!(weights.get(DatasetName::Dead), 3.0);
        assert_eq!(weights.get(DatasetName::Recovered), 1.0);
        assert_eq!(DatasetWeights::default().get(DatasetName::CriticalCared), 1.75);
    }
}
