//! Walk-forward cross-validated calibration of one region.
//!
//! Given:
//! - a region with observed series and stored parameter specs
//! - the datasets to fit against and their residual weights
//! - a list of split counts
//!
//! we:
//! - fit on the training window of every walk-forward fold and score the
//!   held-out window (warm-starting each fit from the previous one)
//! - run one final fit over every observed day
//! - derive confidence/prediction bands from the final covariance
//!
//! The least-squares objective is the weighted difference between observed and
//! simulated channels, flattened row by row.

use std::ops::Range;

use log::{debug, info, warn};
use rayon::prelude::*;

use crate::domain::{DatasetName, DatasetWeights, FitMethod, ModelKind, RegionDataset, SanityMode};
use crate::error::AppError;
use crate::fit::result::FittingResult;
use crate::fit::splits::{Fold, check_splits, time_series_split};
use crate::fit::uncertainty::{Bands, FitSummary, eval_uncertainty};
use crate::math::stats;
use crate::math::{LmOptions, LmReport, least_squares};
use crate::models::{CompartmentalModel, IntegrationLock, ParamSet};
use crate::report::Scorer;

/// Options that shape one calibration run.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOptions {
    /// Datasets the residuals are computed over, in row order.
    pub datasets: Vec<DatasetName>,
    pub method: FitMethod,
    /// Walk-forward split counts; each must be at least 2.
    pub test_splits: Vec<usize>,
    /// Parameters held at their stored value even when marked to vary.
    pub unvary: Vec<String>,
    /// Fixed outbreak shift; derived from the incubation period when unset.
    pub outbreak_shift: Option<i64>,
    pub sigma_conf: f64,
    /// Defaults to `sigma_conf`.
    pub sigma_pred: Option<f64>,
    /// Run one extra full-data fit before cross-validation to warm-start it.
    pub first_time: bool,
    pub max_nfev: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        let lm = LmOptions::default();
        Self {
            datasets: DatasetName::DEFAULT_FIT.to_vec(),
            method: FitMethod::default(),
            test_splits: vec![5, 3],
            unvary: Vec::new(),
            outbreak_shift: None,
            sigma_conf: 2.0,
            sigma_pred: None,
            first_time: false,
            max_nfev: lm.max_nfev,
            ftol: lm.ftol,
            xtol: lm.xtol,
            gtol: lm.gtol,
        }
    }
}

impl FitOptions {
    pub fn lm_options(&self) -> LmOptions {
        LmOptions {
            method: self.method,
            max_nfev: self.max_nfev,
            ftol: self.ftol,
            xtol: self.xtol,
            gtol: self.gtol,
            ..LmOptions::default()
        }
    }

    pub fn sigma_pred(&self) -> f64 {
        self.sigma_pred.unwrap_or(self.sigma_conf)
    }
}

/// A finished least-squares run and the parameters it produced.
struct Calibrated {
    params: ParamSet,
    report: LmReport,
}

#[derive(Debug, Clone)]
pub struct Fitter<'a> {
    model: CompartmentalModel<'a>,
    weights: &'a DatasetWeights,
    options: FitOptions,
}

impl<'a> Fitter<'a> {
    pub fn new(model: CompartmentalModel<'a>, weights: &'a DatasetWeights, options: FitOptions) -> Self {
        Self {
            model,
            weights,
            options,
        }
    }

    pub fn options(&self) -> &FitOptions {
        &self.options
    }

    fn region(&self) -> &'a RegionDataset {
        self.model.region()
    }

    /// Outbreak shift from the options, or from the stored incubation period.
    pub fn outbreak_shift(&self) -> Result<i64, AppError> {
        match self.options.outbreak_shift {
            Some(shift) => Ok(shift),
            None => {
                let rate = self.region().param("infectious_rate")?.init;
                if rate.is_nan() || rate <= 0.0 {
                    return Err(AppError::invalid("infectious_rate must be > 0 to derive the outbreak shift"));
                }
                Ok(self.region().outbreak_shift(1.0 / rate, 0, None))
            }
        }
    }

    /// Simulated channels for `datasets`, first `days` days.
    fn predict_rows(&self, params: &ParamSet, days: usize, shift: i64, mode: SanityMode) -> Result<Vec<Vec<f64>>, AppError> {
        let sim = self.model.simulate(params, days, shift, mode)?;
        Ok(sim.get_datasets(&self.options.datasets))
    }

    /// Least squares over the `range` columns of `observed`.
    fn calibrate(
        &self,
        params: &ParamSet,
        observed: &[Vec<f64>],
        range: Range<usize>,
        shift: i64,
    ) -> Result<Calibrated, AppError> {
        let weights: Vec<f64> = self.options.datasets.iter().map(|d| self.weights.get(*d)).collect();
        let objective = |values: &[f64]| -> Result<Vec<f64>, AppError> {
            let trial = params.with_free_values(values);
            let pred = self.predict_rows(&trial, range.end, shift, SanityMode::Ignore)?;
            let mut residual = Vec::with_capacity(observed.len() * range.len());
            for ((obs, p), w) in observed.iter().zip(&pred).zip(&weights) {
                residual.extend(obs[range.clone()].iter().zip(&p[range.clone()]).map(|(o, p)| (o - p) * w));
            }
            Ok(residual)
        };
        let report = least_squares(
            objective,
            &params.free_values(),
            &params.free_bounds(),
            &self.options.lm_options(),
        )?;
        // Errors carried over from a warm start belong to another fit.
        let mut fitted = params.with_free_values(&report.x);
        fitted.clear_stderr();
        if let Some(stderr) = report.stderr() {
            fitted = fitted.with_free_stderr(&stderr);
        }
        debug!(
            "{}: fitted days {}..{} in {} evaluations, chisqr {:.6e}",
            self.region().name(),
            range.start,
            range.end,
            report.nfev,
            report.chisqr
        );
        Ok(Calibrated { params: fitted, report })
    }

    /// Confidence and prediction bands over `range`, zero when the fit has no
    /// covariance.
    fn bands(&self, fit: &Calibrated, range: Range<usize>, shift: i64) -> Bands {
        let rows = self.options.datasets.len();
        let (Some(covariance), Some(stderr)) = (fit.report.covariance.as_ref(), fit.report.stderr()) else {
            warn!(
                "{}: no covariance for days {}..{}; using zero-width bands",
                self.region().name(),
                range.start,
                range.end
            );
            return Bands::zeros(rows, range.len());
        };
        let model = |values: &[f64]| -> Result<Vec<f64>, AppError> {
            let trial = fit.params.with_free_values(values);
            let pred = self.predict_rows(&trial, range.end, shift, SanityMode::default())?;
            Ok(pred.iter().flat_map(|p| p[range.clone()].iter().copied()).collect())
        };
        let summary = FitSummary {
            values: &fit.report.x,
            stderr: &stderr,
            covariance,
            redchi: fit.report.redchi,
            ndata: fit.report.residual.len(),
        };
        match eval_uncertainty(
            model,
            summary,
            rows,
            range.len(),
            self.options.sigma_conf,
            self.options.sigma_pred(),
        ) {
            Ok(bands) => bands,
            Err(err) => {
                warn!("{}: uncertainty bands failed ({err}); using zero-width bands", self.region().name());
                Bands::zeros(rows, range.len())
            }
        }
    }

    /// Score the model with fitted `fit` on `test`, with training means taken
    /// over `train`.
    fn score(
        &self,
        fit: &Calibrated,
        observed: &[Vec<f64>],
        train: Range<usize>,
        test: Range<usize>,
        shift: i64,
        n_free: usize,
    ) -> Result<Scorer, AppError> {
        let pred = self.predict_rows(&fit.params, test.end, shift, SanityMode::default())?;
        let bands = self.bands(fit, test.clone(), shift);
        Scorer::new(
            observed.iter().map(|o| o[test.clone()].to_vec()).collect(),
            pred.iter().map(|p| p[test.clone()].to_vec()).collect(),
            bands.confidence,
            bands.prediction,
            n_free,
            observed.iter().map(|o| stats::mean(&o[train.clone()])).collect(),
            test.map(|i| i as f64).collect(),
        )
    }

    /// Run the full calibration.
    pub fn fit(&self) -> Result<FittingResult<'a>, AppError> {
        check_splits(&self.options.test_splits)?;
        if self.options.datasets.is_empty() {
            return Err(AppError::invalid("at least one dataset is required to fit"));
        }

        let shift = self.outbreak_shift()?;
        let days = self.region().data_days(shift);
        if days <= 0 {
            return Err(AppError::invalid(format!(
                "outbreak shift {shift} leaves no observed days to fit"
            )));
        }
        let days = days as usize;
        let folds: Vec<Vec<Fold>> = self
            .options
            .test_splits
            .iter()
            .map(|k| time_series_split(days, *k))
            .collect::<Result<_, _>>()?;

        let mut params = ParamSet::for_fit(self.model.kind(), self.region(), &self.options.unvary)?;
        let n_free = params.n_free();
        let observed = self.region().observed_rows(&self.options.datasets, shift);
        debug!(
            "{}: fitting {} days (shift {shift}) with {n_free} free parameters",
            self.region().name(),
            days
        );

        if self.options.first_time && !self.options.test_splits.is_empty() {
            params = self.calibrate(&params, &observed, 0..days, shift)?.params;
        }

        let mut per_split = Vec::with_capacity(folds.len());
        for (k, split) in self.options.test_splits.iter().zip(&folds) {
            let mut fold_scores = Vec::with_capacity(split.len());
            for fold in split {
                let fit = self.calibrate(&params, &observed, fold.train.clone(), shift)?;
                fold_scores.push(self.score(&fit, &observed, fold.train.clone(), fold.test.clone(), shift, n_free)?);
                params = fit.params;
            }
            debug!("{}: {k}-fold cross-validation done", self.region().name());
            per_split.push(Scorer::concatenate(&fold_scores)?);
        }
        let test_scorer = if per_split.is_empty() {
            None
        } else {
            Some(Scorer::concatenate(&per_split)?)
        };

        let mut fit = self.calibrate(&params, &observed, 0..days, shift)?;
        let filled = fit.params.backfill_stderr();
        if filled > 0 {
            warn!(
                "{}: {filled} parameters had no standard error; backfilled",
                self.region().name()
            );
        }
        let fit_scorer = self.score(&fit, &observed, 0..days, 0..days, shift, n_free)?;

        info!(
            "{}: {} fit done, shift {shift}, chisqr {:.6e}, {} evaluations",
            self.region().name(),
            self.model.kind().display_name(),
            fit.report.chisqr,
            fit.report.nfev
        );

        Ok(FittingResult::new(
            self.model.clone(),
            self.options.datasets.clone(),
            fit.params,
            fit.report,
            shift,
            days,
            n_free,
            fit_scorer,
            test_scorer,
        ))
    }
}

/// Fit several regions in parallel; results keep the input order.
///
/// Integrations still serialize on `lock`.
pub fn fit_regions<'a>(
    regions: &'a [RegionDataset],
    kind: ModelKind,
    weights: &'a DatasetWeights,
    lock: &IntegrationLock,
    options: &FitOptions,
) -> Vec<Result<FittingResult<'a>, AppError>> {
    regions
        .par_iter()
        .map(|region| {
            let model = CompartmentalModel::new(kind, region, lock.clone());
            Fitter::new(model, weights, options.clone()).fit()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{SyntheticSpec, synthetic_record_with, synthetic_region};
    use approx::assert_relative_eq;

    fn quick_options() -> FitOptions {
        FitOptions {
            datasets: vec![DatasetName::InfectiousAll, DatasetName::Dead],
            test_splits: vec![2],
            unvary: vec![
                "critical_chance".into(),
                "critical_rate".into(),
                "recovery_rate_normal".into(),
                "recovery_rate_critical".into(),
                "death_chance_normal".into(),
                "death_rate_normal".into(),
                "death_rate_over".into(),
                "exposed_rate_over".into(),
                "k".into(),
                "test_coverage_0".into(),
                "test_coverage_increase".into(),
                "test_coverage_max".into(),
            ],
            outbreak_shift: Some(0),
            max_nfev: 600,
            ftol: 1e-8,
            xtol: 1e-8,
            ..FitOptions::default()
        }
    }

    #[test]
    fn split_of_one_is_rejected_before_any_simulation() {
        let region = synthetic_region("split", 60, 7).unwrap();
        let weights = DatasetWeights::default();
        let options = FitOptions {
            test_splits: vec![1],
            ..quick_options()
        };
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let err = Fitter::new(model, &weights, options).fit().unwrap_err();
        assert!(matches!(err, AppError::SplitTooSmall(1)));
    }

    #[test]
    fn fit_produces_scores_and_updates() {
        let region = synthetic_region("fit", 60, 11).unwrap();
        let weights = DatasetWeights::default();
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let result = Fitter::new(model, &weights, quick_options()).fit().unwrap();

        assert_eq!(result.outbreak_shift(), 0);
        assert_eq!(result.days(), 60);
        assert_eq!(result.fit_scorer().row_count(), 2);
        assert_eq!(result.fit_scorer().data_count(), 60);
        // two folds of 20 test days each
        let test = result.test_scorer().unwrap();
        assert_eq!(test.data_count(), 40);
        assert_eq!(test.segments(), &[(0, 20), (20, 40)]);
        for r2 in result.fit_scorer().r2() {
            assert!(r2 > 0.5, "r2 = {r2}");
        }

        let record = result.to_record().unwrap();
        assert_eq!(record.n_free_params, result.n_free_params());
        assert!(record.params.iter().any(|p| p.name == "infectious_rate"));
        assert!(record.params.iter().all(|p| p.stderr >= 0.0));
        assert_eq!(record.rt.len(), region.rt_breakpoints().len());
        assert_eq!(record.fit_scores.len(), 2);
        assert!(record.test_scores_flat.is_some());

        let longer = result.predict(10).unwrap();
        assert_eq!(longer.days(), 70);
    }

    #[test]
    fn regions_fit_in_parallel_and_keep_order() {
        let regions = vec![
            synthetic_region("a", 45, 1).unwrap(),
            synthetic_region("b", 45, 2).unwrap(),
        ];
        let weights = DatasetWeights::default();
        let options = FitOptions {
            test_splits: vec![],
            ..quick_options()
        };
        let results = fit_regions(&regions, ModelKind::SeicrdRlc, &weights, &IntegrationLock::new(), &options);
        assert_eq!(results.len(), 2);
        let first = results[0].as_ref().unwrap();
        assert_eq!(first.region().name(), "a");
        assert!(first.test_scorer().is_none());
        assert_eq!(results[1].as_ref().unwrap().region().name(), "b");
    }

    /// Capacity far above any occupancy leaves the overflow rates without
    /// effect, so a free `death_rate_over` makes JᵀJ singular. Stored errors
    /// are deliberately stale.
    fn singular_region() -> RegionDataset {
        let spec = SyntheticSpec {
            capacity: 1e9,
            ..SyntheticSpec::default()
        };
        let mut record = synthetic_record_with("flat", 60, 5, &spec).unwrap();
        for p in &mut record.params {
            match p.parameter.as_str() {
                "infectious_rate" => p.stderr = Some(42.0),
                "death_chance_over" => p.stderr = Some(7.0),
                _ => {}
            }
        }
        let rt = &mut record.rt[1];
        rt.init = 0.9;
        rt.min = Some(0.9);
        rt.max = Some(0.9);
        rt.stderr = Some(5.0);
        RegionDataset::from_record(record).unwrap()
    }

    #[test]
    fn missing_covariance_backfills_stderr_and_zeroes_bands() {
        let region = singular_region();
        let weights = DatasetWeights::default();
        let mut options = FitOptions {
            max_nfev: 2000,
            ..quick_options()
        };
        options.unvary.retain(|name| name != "death_rate_over");
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let result = Fitter::new(model, &weights, options).fit().unwrap();
        assert!(result.report().covariance.is_none());

        let named = result.params().named();
        let rate = named.iter().find(|p| p.name == "infectious_rate").unwrap();
        assert_relative_eq!(rate.spec.stderr.unwrap(), rate.spec.init.abs() * 0.1, max_relative = 1e-12);
        let fixed = named.iter().find(|p| p.name == "death_chance_over").unwrap();
        assert_eq!(fixed.spec.stderr, Some(0.0));

        let rt = result.rt_updates();
        assert_relative_eq!(rt[0].stderr, rt[0].value.abs() * 0.1, max_relative = 1e-12);
        assert_eq!(rt[1].value, 0.9);
        assert_eq!(rt[1].stderr, 0.0);

        let record = result.to_record().unwrap();
        let update = record.params.iter().find(|p| p.name == "infectious_rate").unwrap();
        assert_relative_eq!(update.stderr, update.value.abs() * 0.1, max_relative = 1e-12);

        let test = result.test_scorer().unwrap();
        for scorer in [result.fit_scorer(), test] {
            for band in scorer.confidence_band().iter().chain(scorer.prediction_band()) {
                assert!(band.iter().all(|v| *v == 0.0));
            }
        }
    }

    #[test]
    fn default_options_fit_the_four_default_datasets() {
        let options = FitOptions::default();
        assert_eq!(options.datasets.len(), 4);
        assert_eq!(options.test_splits, vec![5, 3]);
        assert_eq!(options.sigma_pred(), 2.0);
    }
}
