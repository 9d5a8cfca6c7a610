//! Goodness-of-fit statistics over observed/predicted rows.
//!
//! A [`Scorer`] holds one row per fitted dataset. Every statistic is computed
//! row-wise and returned as one value per row; [`Scorer::flatten`] collapses
//! the rows into one when an aggregate score is wanted.
//!
//! `segments` records where independently fitted pieces (cross-validation
//! folds) start and end along the sample axis; MASE is averaged over them so
//! the naive forecast never straddles two folds.

use std::fmt::Write as _;

use crate::domain::ScoreRecord;
use crate::error::AppError;
use crate::math::stats;

#[derive(Debug, Clone, PartialEq)]
pub struct Scorer {
    data: Vec<Vec<f64>>,
    pred: Vec<Vec<f64>>,
    conf_band: Vec<Vec<f64>>,
    pred_band: Vec<Vec<f64>>,
    n_free_params: usize,
    train_mean: Vec<f64>,
    segments: Vec<(usize, usize)>,
    x: Vec<f64>,
}

fn check_shape(label: &str, rows: &[Vec<f64>], row_count: usize, len: usize) -> Result<(), AppError> {
    if rows.len() != row_count || rows.iter().any(|r| r.len() != len) {
        return Err(AppError::invalid(format!(
            "Scorer: {label} must be {row_count} rows of {len} samples."
        )));
    }
    Ok(())
}

fn concat_rows(parts: &[&[Vec<f64>]], row: usize) -> Vec<f64> {
    parts.iter().flat_map(|p| p[row].iter().copied()).collect()
}

fn mae(data: &[f64], pred: &[f64]) -> f64 {
    stats::mean(&data.iter().zip(pred).map(|(d, p)| (d - p).abs()).collect::<Vec<_>>())
}

fn mse(data: &[f64], pred: &[f64]) -> f64 {
    stats::mean(&data.iter().zip(pred).map(|(d, p)| (d - p).powi(2)).collect::<Vec<_>>())
}

fn r2(data: &[f64], pred: &[f64]) -> f64 {
    let m = stats::mean(data);
    let ss_res: f64 = data.iter().zip(pred).map(|(d, p)| (d - p).powi(2)).sum();
    let ss_tot: f64 = data.iter().map(|d| (d - m).powi(2)).sum();
    if ss_tot == 0.0 {
        return if ss_res == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - ss_res / ss_tot
}

fn explained_variance(data: &[f64], pred: &[f64]) -> f64 {
    let residual: Vec<f64> = data.iter().zip(pred).map(|(d, p)| d - p).collect();
    let num = stats::variance(&residual);
    let den = stats::variance(data);
    if den == 0.0 {
        return if num == 0.0 { 1.0 } else { 0.0 };
    }
    1.0 - num / den
}

fn smape(data: &[f64], pred: &[f64]) -> f64 {
    let total: f64 = data
        .iter()
        .zip(pred)
        .filter_map(|(d, p)| {
            let den = d.abs() + p.abs();
            (den != 0.0).then(|| (p - d).abs() / den)
        })
        .sum();
    total / data.len() as f64
}

/// MAE of the fit over MAE of the naive forecast lagged by `seasonality`.
fn mase(data: &[f64], pred: &[f64], seasonality: usize) -> f64 {
    if seasonality >= data.len() {
        return f64::NAN;
    }
    let naive = mae(&data[seasonality..], &pred[..pred.len() - seasonality]);
    mae(data, pred) / naive
}

impl Scorer {
    /// Build a scorer over `data`/`pred` rows with matching uncertainty bands.
    ///
    /// `train_mean` holds one training-data mean per row; `x` the day index of
    /// every sample.
    pub fn new(
        data: Vec<Vec<f64>>,
        pred: Vec<Vec<f64>>,
        conf_band: Vec<Vec<f64>>,
        pred_band: Vec<Vec<f64>>,
        n_free_params: usize,
        train_mean: Vec<f64>,
        x: Vec<f64>,
    ) -> Result<Self, AppError> {
        let len = x.len();
        Self::with_segments(data, pred, conf_band, pred_band, n_free_params, train_mean, vec![(0, len)], x)
    }

    #[allow(clippy::too_many_arguments)]
    fn with_segments(
        data: Vec<Vec<f64>>,
        pred: Vec<Vec<f64>>,
        conf_band: Vec<Vec<f64>>,
        pred_band: Vec<Vec<f64>>,
        n_free_params: usize,
        train_mean: Vec<f64>,
        segments: Vec<(usize, usize)>,
        x: Vec<f64>,
    ) -> Result<Self, AppError> {
        let rows = data.len();
        let len = x.len();
        if rows == 0 || len == 0 {
            return Err(AppError::invalid("Scorer: at least one row with one sample is required."));
        }
        check_shape("data", &data, rows, len)?;
        check_shape("pred", &pred, rows, len)?;
        check_shape("confidence band", &conf_band, rows, len)?;
        check_shape("prediction band", &pred_band, rows, len)?;
        if train_mean.len() != rows {
            return Err(AppError::invalid(format!(
                "Scorer: expected {rows} training means, got {}.",
                train_mean.len()
            )));
        }
        if segments.iter().any(|&(a, b)| a >= b || b > len) {
            return Err(AppError::invalid("Scorer: segment boundaries out of range."));
        }
        Ok(Self {
            data,
            pred,
            conf_band,
            pred_band,
            n_free_params,
            train_mean,
            segments,
            x,
        })
    }

    pub fn row_count(&self) -> usize {
        self.data.len()
    }

    /// Samples per row.
    pub fn data_count(&self) -> usize {
        self.x.len()
    }

    pub fn n_free_params(&self) -> usize {
        self.n_free_params
    }

    pub fn data(&self) -> &[Vec<f64>] {
        &self.data
    }

    pub fn pred(&self) -> &[Vec<f64>] {
        &self.pred
    }

    pub fn confidence_band(&self) -> &[Vec<f64>] {
        &self.conf_band
    }

    pub fn prediction_band(&self) -> &[Vec<f64>] {
        &self.pred_band
    }

    pub fn train_mean(&self) -> &[f64] {
        &self.train_mean
    }

    pub fn segments(&self) -> &[(usize, usize)] {
        &self.segments
    }

    pub fn x(&self) -> &[f64] {
        &self.x
    }

    pub fn residual(&self) -> Vec<Vec<f64>> {
        self.data
            .iter()
            .zip(&self.pred)
            .map(|(d, p)| d.iter().zip(p).map(|(d, p)| d - p).collect())
            .collect()
    }

    fn map_data_pred(&self, f: impl Fn(&[f64], &[f64]) -> f64) -> Vec<f64> {
        self.data.iter().zip(&self.pred).map(|(d, p)| f(d, p)).collect()
    }

    fn map_residual(&self, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
        self.residual().iter().map(|r| f(r)).collect()
    }

    /// All rows joined into one, segments offset by row.
    pub fn flatten(&self) -> Self {
        let join = |rows: &[Vec<f64>]| vec![rows.iter().flatten().copied().collect::<Vec<f64>>()];
        let n = self.data_count();
        let segments = (0..self.row_count())
            .flat_map(|r| self.segments.iter().map(move |&(a, b)| (r * n + a, r * n + b)))
            .collect();
        let x = (0..self.row_count()).flat_map(|_| self.x.iter().copied()).collect();
        Self {
            data: join(&self.data),
            pred: join(&self.pred),
            conf_band: join(&self.conf_band),
            pred_band: join(&self.pred_band),
            n_free_params: self.n_free_params,
            train_mean: vec![stats::mean(&self.train_mean)],
            segments,
            x,
        }
    }

    /// Join same-shaped scorers along the sample axis.
    pub fn concatenate(scorers: &[Scorer]) -> Result<Self, AppError> {
        let Some(first) = scorers.first() else {
            return Err(AppError::invalid("Scorer: nothing to concatenate."));
        };
        let rows = first.row_count();
        if scorers.iter().any(|s| s.row_count() != rows) {
            return Err(AppError::invalid("Scorer: concatenated scorers must have the same rows."));
        }
        let join = |pick: fn(&Scorer) -> &[Vec<f64>]| -> Vec<Vec<f64>> {
            let parts: Vec<&[Vec<f64>]> = scorers.iter().map(pick).collect();
            (0..rows).map(|r| concat_rows(&parts, r)).collect()
        };
        let train_mean = (0..rows)
            .map(|r| stats::mean(&scorers.iter().map(|s| s.train_mean[r]).collect::<Vec<_>>()))
            .collect();
        let mut segments = Vec::new();
        let mut offset = 0;
        for s in scorers {
            segments.extend(s.segments.iter().map(|&(a, b)| (offset + a, offset + b)));
            offset += s.data_count();
        }
        let x = scorers.iter().flat_map(|s| s.x.iter().copied()).collect();
        Self::with_segments(
            join(|s| s.data.as_slice()),
            join(|s| s.pred.as_slice()),
            join(|s| s.conf_band.as_slice()),
            join(|s| s.pred_band.as_slice()),
            scorers.iter().map(|s| s.n_free_params).max().unwrap_or(0),
            train_mean,
            segments,
            x,
        )
    }

    /// Divide every row (and its bands and training mean) by `div[row]`.
    pub fn normalize(&self, div: &[f64]) -> Result<Self, AppError> {
        if div.len() != self.row_count() {
            return Err(AppError::invalid(format!(
                "Scorer: expected {} divisors, got {}.",
                self.row_count(),
                div.len()
            )));
        }
        let scale = |rows: &[Vec<f64>]| -> Vec<Vec<f64>> {
            rows.iter()
                .zip(div)
                .map(|(r, d)| r.iter().map(|v| v / d).collect())
                .collect()
        };
        Ok(Self {
            data: scale(&self.data),
            pred: scale(&self.pred),
            conf_band: scale(&self.conf_band),
            pred_band: scale(&self.pred_band),
            train_mean: self.train_mean.iter().zip(div).map(|(m, d)| m / d).collect(),
            ..self.clone()
        })
    }

    /// Mean of the observed data, per row.
    pub fn data_mean(&self) -> Vec<f64> {
        self.data.iter().map(|d| stats::mean(d)).collect()
    }

    pub fn residual_mean(&self) -> Vec<f64> {
        self.map_residual(stats::mean)
    }

    pub fn residual_median(&self) -> Vec<f64> {
        self.map_residual(stats::median)
    }

    pub fn max_error(&self) -> Vec<f64> {
        self.map_residual(|r| r.iter().fold(0.0, |acc: f64, v| acc.max(v.abs())))
    }

    pub fn mae(&self) -> Vec<f64> {
        self.map_data_pred(mae)
    }

    pub fn mse(&self) -> Vec<f64> {
        self.map_data_pred(mse)
    }

    pub fn rmse(&self) -> Vec<f64> {
        self.mse().into_iter().map(f64::sqrt).collect()
    }

    pub fn rmsle(&self) -> Vec<f64> {
        self.map_data_pred(|d, p| {
            let sq: Vec<f64> = d.iter().zip(p).map(|(d, p)| (d.ln_1p() - p.ln_1p()).powi(2)).collect();
            stats::mean(&sq).sqrt()
        })
    }

    pub fn explained_variance(&self) -> Vec<f64> {
        self.map_data_pred(explained_variance)
    }

    pub fn r2(&self) -> Vec<f64> {
        self.map_data_pred(r2)
    }

    pub fn r2_adj(&self) -> Vec<f64> {
        let n = self.data_count() as f64;
        let p = self.n_free_params as f64;
        self.r2()
            .into_iter()
            .map(|r2| 1.0 - (1.0 - r2) * (n - 1.0) / (n - p - 1.0))
            .collect()
    }

    /// Symmetric MAPE without the factor 2; bounded by `[0, 1]`.
    pub fn smape(&self) -> Vec<f64> {
        self.map_data_pred(smape)
    }

    /// MASE with lag `seasonality`, averaged over segments.
    pub fn mase(&self, seasonality: usize) -> Vec<f64> {
        self.map_data_pred(|d, p| {
            let per_segment: Vec<f64> = self
                .segments
                .iter()
                .map(|&(a, b)| mase(&d[a..b], &p[a..b], seasonality))
                .collect();
            stats::mean(&per_segment)
        })
    }

    fn raw_chisqr(&self) -> Vec<f64> {
        self.map_residual(|r| r.iter().map(|v| v * v).sum())
    }

    /// Sum of squared residuals, floored at `1e-250 * n`.
    pub fn chisqr(&self) -> Vec<f64> {
        let floor = 1e-250 * self.data_count() as f64;
        self.raw_chisqr().into_iter().map(|c| c.max(floor)).collect()
    }

    pub fn redchi(&self) -> Vec<f64> {
        let nfree = self.data_count().saturating_sub(self.n_free_params).max(1) as f64;
        self.raw_chisqr().into_iter().map(|c| c / nfree).collect()
    }

    /// `-2 log L` under Gaussian errors.
    fn neg2_log_likelihood(&self) -> Vec<f64> {
        let n = self.data_count() as f64;
        self.chisqr().into_iter().map(|c| n * (c / n).ln()).collect()
    }

    pub fn aic(&self) -> Vec<f64> {
        let p = self.n_free_params as f64;
        self.neg2_log_likelihood().into_iter().map(|l| l + 2.0 * p).collect()
    }

    pub fn aicc(&self) -> Vec<f64> {
        let n = self.data_count() as f64;
        let p = self.n_free_params as f64;
        self.aic()
            .into_iter()
            .map(|aic| aic + (2.0 * p * p + 2.0 * p) / (n - p - 1.0))
            .collect()
    }

    pub fn bic(&self) -> Vec<f64> {
        let n = self.data_count() as f64;
        let p = self.n_free_params as f64;
        self.neg2_log_likelihood()
            .into_iter()
            .map(|l| l + n.ln() * p)
            .collect()
    }

    pub fn durbin_watson(&self) -> Vec<f64> {
        self.map_residual(stats::durbin_watson)
    }

    /// Shapiro–Wilk p-value of the residuals.
    pub fn residual_normality_p(&self) -> Vec<f64> {
        self.map_residual(stats::shapiro_wilk)
    }

    /// Runs test p-value of the residuals around 0.
    pub fn residual_runs_p(&self) -> Vec<f64> {
        self.map_residual(|r| stats::runs_test(r, 0.0))
    }

    pub fn pearson_data_p(&self) -> Vec<f64> {
        self.map_data_pred(|d, p| stats::pearson_p(p, d))
    }

    /// Pearson p-value between day index and residual.
    pub fn pearson_residual_p(&self) -> Vec<f64> {
        self.map_residual(|r| stats::pearson_p(&self.x, r))
    }

    /// ANOVA of predictions against the training mean; `mean` overrides the
    /// stored training means.
    pub fn anova_mean_p(&self, mean: Option<&[f64]>) -> Vec<f64> {
        let means = mean.unwrap_or(&self.train_mean);
        self.pred
            .iter()
            .zip(means)
            .map(|(p, m)| {
                let flat = vec![*m; p.len()];
                stats::anova_p(&[p.as_slice(), flat.as_slice()])
            })
            .collect()
    }

    pub fn anova_data_p(&self) -> Vec<f64> {
        self.map_data_pred(|d, p| stats::anova_p(&[p, d]))
    }

    pub fn anova_residual_p(&self) -> Vec<f64> {
        let zeros = vec![0.0; self.data_count()];
        self.map_residual(|r| stats::anova_p(&[r, zeros.as_slice()]))
    }

    pub fn ks_data_p(&self) -> Vec<f64> {
        self.map_data_pred(|d, p| stats::ks_two_sample_p(p, d))
    }

    /// One-sample KS of the residuals against the standard normal.
    pub fn ks_residual_p(&self) -> Vec<f64> {
        self.map_residual(stats::ks_normal_p)
    }

    /// Fraction of samples inside `pred ± prediction band`.
    pub fn prediction_interval(&self) -> Vec<f64> {
        let n = self.data_count() as f64;
        self.data
            .iter()
            .zip(&self.pred)
            .zip(&self.pred_band)
            .map(|((d, p), band)| {
                let inside = d
                    .iter()
                    .zip(p)
                    .zip(band)
                    .filter(|((d, p), b)| *p - *b <= **d && **d <= *p + *b)
                    .count();
                inside as f64 / n
            })
            .collect()
    }

    /// One fixed-schema record per row, labelled by `labels`.
    pub fn records<S: AsRef<str>>(&self, labels: &[S]) -> Result<Vec<ScoreRecord>, AppError> {
        if labels.len() != self.row_count() {
            return Err(AppError::invalid(format!(
                "Scorer: expected {} labels, got {}.",
                self.row_count(),
                labels.len()
            )));
        }
        let residual_mean = self.residual_mean();
        let residual_median = self.residual_median();
        let max_error = self.max_error();
        let mae = self.mae();
        let mse = self.mse();
        let rmse = self.rmse();
        let rmsle = self.rmsle();
        let explained_variance = self.explained_variance();
        let r2 = self.r2();
        let r2_adj = self.r2_adj();
        let smape = self.smape();
        let mase = self.mase(1);
        let chisqr = self.chisqr();
        let redchi = self.redchi();
        let aic = self.aic();
        let aicc = self.aicc();
        let bic = self.bic();
        let durbin_watson = self.durbin_watson();
        let normality = self.residual_normality_p();
        let runs = self.residual_runs_p();
        let pearson_data = self.pearson_data_p();
        let pearson_residual = self.pearson_residual_p();
        let anova_mean = self.anova_mean_p(None);
        let anova_data = self.anova_data_p();
        let anova_residual = self.anova_residual_p();
        let ks_data = self.ks_data_p();
        let ks_residual = self.ks_residual_p();
        let interval = self.prediction_interval();

        Ok(labels
            .iter()
            .enumerate()
            .map(|(i, label)| ScoreRecord {
                dataset: label.as_ref().to_string(),
                n_free_params: self.n_free_params,
                residual_mean: residual_mean[i],
                residual_median: residual_median[i],
                max_error: max_error[i],
                mae: mae[i],
                mse: mse[i],
                rmse: rmse[i],
                rmsle: rmsle[i],
                explained_variance: explained_variance[i],
                r2: r2[i],
                r2_adj: r2_adj[i],
                smape: smape[i],
                mase: mase[i],
                chisqr: chisqr[i],
                redchi: redchi[i],
                aic: aic[i],
                aicc: aicc[i],
                bic: bic[i],
                durbin_watson: durbin_watson[i],
                residual_normality_p: normality[i],
                residual_runs_p: runs[i],
                pearson_data_p: pearson_data[i],
                pearson_residual_p: pearson_residual[i],
                anova_mean_p: anova_mean[i],
                anova_data_p: anova_data[i],
                anova_residual_p: anova_residual[i],
                ks_data_p: ks_data[i],
                ks_residual_p: ks_residual[i],
                prediction_interval: interval[i],
            })
            .collect())
    }

    /// The aggregate record of [`flatten`](Self::flatten).
    pub fn flat_record(&self, label: &str) -> Result<ScoreRecord, AppError> {
        let mut records = self.flatten().records(&[label])?;
        records
            .pop()
            .ok_or_else(|| AppError::invalid("Scorer: flattened scorer has no row."))
    }

    /// Plain-text score listing, one line per statistic.
    pub fn report(&self) -> String {
        let fmt = |v: Vec<f64>| {
            let parts: Vec<String> = v.iter().map(|x| format!("{x:.6}")).collect();
            format!("[{}]", parts.join(", "))
        };
        let lines = [
            ("Residual Mean (~0)", fmt(self.residual_mean())),
            ("Residual Median (~0)", fmt(self.residual_median())),
            ("Max Error (~0)", fmt(self.max_error())),
            ("MAE (~0)", fmt(self.mae())),
            ("MSE (~0)", fmt(self.mse())),
            ("RMSE (~0)", fmt(self.rmse())),
            ("RMSLE (~0)", fmt(self.rmsle())),
            ("Explained Variance", fmt(self.explained_variance())),
            ("R2 (~1)", fmt(self.r2())),
            ("Adjusted R2 (~1)", fmt(self.r2_adj())),
            ("SMAPE (~0)", fmt(self.smape())),
            ("MASE (~0)", fmt(self.mase(1))),
            ("Chi Square", fmt(self.chisqr())),
            ("Reduced Chi Square", fmt(self.redchi())),
            ("AIC", fmt(self.aic())),
            ("AICc", fmt(self.aicc())),
            ("BIC", fmt(self.bic())),
            ("Durbin-Watson", fmt(self.durbin_watson())),
            ("Residual Normal Test Shapiro p (p>a)", fmt(self.residual_normality_p())),
            ("Residual Runs Test p (p>0.5)", fmt(self.residual_runs_p())),
            ("F-Test Overall Significance p (p<a)", fmt(self.anova_mean_p(None))),
            ("F-Test pred-data p (p>a)", fmt(self.anova_data_p())),
            ("F-Test residual-zero p (p>a)", fmt(self.anova_residual_p())),
            ("KS-Test pred-data p (p>a)", fmt(self.ks_data_p())),
            ("KS-Test residual-normal p (p>a)", fmt(self.ks_residual_p())),
            ("Prediction Interval coverage", fmt(self.prediction_interval())),
        ];
        let mut out = String::new();
        let _ = writeln!(out, "Varying Parameters: {}", self.n_free_params);
        for (label, value) in lines {
            let _ = writeln!(out, "{label}: {value}");
        }
        out
    }
}
