//! Outcome of one calibration run.

use crate::domain::{DatasetName, FitRecord, ParamUpdate, RegionDataset, RtUpdate, SanityMode};
use crate::error::AppError;
use crate::math::LmReport;
use crate::models::{CompartmentalModel, ParamSet, SimulationResult};
use crate::report::Scorer;

/// Label of the aggregated (flattened) score rows.
pub const FLAT_LABEL: &str = "all";

#[derive(Debug, Clone)]
pub struct FittingResult<'a> {
    model: CompartmentalModel<'a>,
    datasets: Vec<DatasetName>,
    params: ParamSet,
    report: LmReport,
    outbreak_shift: i64,
    days: usize,
    n_free_params: usize,
    fit_scorer: Scorer,
    test_scorer: Option<Scorer>,
}

impl<'a> FittingResult<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        model: CompartmentalModel<'a>,
        datasets: Vec<DatasetName>,
        params: ParamSet,
        report: LmReport,
        outbreak_shift: i64,
        days: usize,
        n_free_params: usize,
        fit_scorer: Scorer,
        test_scorer: Option<Scorer>,
    ) -> Self {
        Self {
            model,
            datasets,
            params,
            report,
            outbreak_shift,
            days,
            n_free_params,
            fit_scorer,
            test_scorer,
        }
    }

    pub fn region(&self) -> &'a RegionDataset {
        self.model.region()
    }

    pub fn datasets(&self) -> &[DatasetName] {
        &self.datasets
    }

    /// Fitted parameters, standard errors filled in.
    pub fn params(&self) -> &ParamSet {
        &self.params
    }

    /// Optimizer report of the final full-data fit.
    pub fn report(&self) -> &LmReport {
        &self.report
    }

    pub fn outbreak_shift(&self) -> i64 {
        self.outbreak_shift
    }

    /// Days covered by the observations under the fitted shift.
    pub fn days(&self) -> usize {
        self.days
    }

    pub fn n_free_params(&self) -> usize {
        self.n_free_params
    }

    pub fn fit_scorer(&self) -> &Scorer {
        &self.fit_scorer
    }

    /// Held-out scores; `None` when no splits were requested.
    pub fn test_scorer(&self) -> Option<&Scorer> {
        self.test_scorer.as_ref()
    }

    /// Re-simulate with the fitted values, `extra_days` past the observations.
    pub fn predict(&self, extra_days: usize) -> Result<SimulationResult, AppError> {
        self.model
            .simulate(&self.params, self.days + extra_days, self.outbreak_shift, SanityMode::default())
    }

    /// Fitted value and standard error of every free named parameter.
    pub fn param_updates(&self) -> Vec<ParamUpdate> {
        self.params
            .named()
            .iter()
            .filter(|p| p.spec.is_free())
            .map(|p| ParamUpdate {
                name: p.name.clone(),
                value: p.spec.init,
                stderr: p.spec.stderr.unwrap_or(0.0),
            })
            .collect()
    }

    /// Fitted value and standard error of every Rt breakpoint.
    pub fn rt_updates(&self) -> Vec<RtUpdate> {
        self.region()
            .rt_breakpoints()
            .iter()
            .zip(self.params.rt())
            .map(|(bp, spec)| RtUpdate {
                date: bp.date,
                value: spec.init,
                stderr: spec.stderr.unwrap_or(0.0),
            })
            .collect()
    }

    pub fn to_record(&self) -> Result<FitRecord, AppError> {
        let labels: Vec<&str> = self.datasets.iter().map(|d| d.as_str()).collect();
        let (test_scores, test_scores_flat) = match &self.test_scorer {
            Some(scorer) => (Some(scorer.records(&labels)?), Some(scorer.flat_record(FLAT_LABEL)?)),
            None => (None, None),
        };
        Ok(FitRecord {
            region: self.region().name().to_string(),
            model: self.model.kind(),
            outbreak_shift: self.outbreak_shift,
            n_free_params: self.n_free_params,
            params: self.param_updates(),
            rt: self.rt_updates(),
            fit_scores: self.fit_scorer.records(&labels)?,
            fit_scores_flat: self.fit_scorer.flat_record(FLAT_LABEL)?,
            test_scores,
            test_scores_flat,
        })
    }
}
