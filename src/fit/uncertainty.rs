//! Confidence and prediction bands from a fit covariance.
//!
//! The model output is differentiated numerically with respect to every free
//! parameter (central difference, step `stderr / 3`) and the variance is
//! propagated through the covariance matrix. The prediction band adds the
//! reduced chi-square of the fit to that variance.

use nalgebra::DMatrix;

use crate::error::AppError;
use crate::math::stats::t_scale_for_sigma;

/// Half-widths of the bands, one row per dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Bands {
    pub confidence: Vec<Vec<f64>>,
    pub prediction: Vec<Vec<f64>>,
}

impl Bands {
    pub fn zeros(rows: usize, len: usize) -> Self {
        Self {
            confidence: vec![vec![0.0; len]; rows],
            prediction: vec![vec![0.0; len]; rows],
        }
    }
}

/// What the band computation needs from a finished fit.
#[derive(Debug, Clone, Copy)]
pub struct FitSummary<'a> {
    pub values: &'a [f64],
    pub stderr: &'a [f64],
    pub covariance: &'a DMatrix<f64>,
    pub redchi: f64,
    /// Residuals the fit was computed from.
    pub ndata: usize,
}

/// Evaluate bands for `model`, which maps free values to `rows` rows of
/// `len` samples (flattened row-major).
pub fn eval_uncertainty<F>(
    mut model: F,
    fit: FitSummary<'_>,
    rows: usize,
    len: usize,
    sigma_conf: f64,
    sigma_pred: f64,
) -> Result<Bands, AppError>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, AppError>,
{
    let nvarys = fit.values.len();
    if fit.stderr.len() != nvarys || fit.covariance.nrows() != nvarys || fit.covariance.ncols() != nvarys {
        return Err(AppError::invalid("covariance does not match the free parameters"));
    }
    let size = rows * len;

    let mut df = Vec::with_capacity(nvarys);
    for i in 0..nvarys {
        let dval = fit.stderr[i] / 3.0;
        if !(dval.is_finite() && dval > 0.0) {
            df.push(vec![0.0; size]);
            continue;
        }
        let mut up = fit.values.to_vec();
        up[i] += dval;
        let mut down = fit.values.to_vec();
        down[i] -= dval;
        let hi = model(&up)?;
        let lo = model(&down)?;
        if hi.len() != size || lo.len() != size {
            return Err(AppError::invalid(format!(
                "model returned {} samples, expected {size}",
                hi.len().min(lo.len())
            )));
        }
        df.push(hi.iter().zip(&lo).map(|(h, l)| (h - l) / (2.0 * dval)).collect::<Vec<f64>>());
    }

    let mut df2 = vec![0.0; size];
    for i in 0..nvarys {
        for j in 0..nvarys {
            let c = fit.covariance[(i, j)];
            if c == 0.0 {
                continue;
            }
            for (k, slot) in df2.iter_mut().enumerate() {
                *slot += df[i][k] * df[j][k] * c;
            }
        }
    }

    let dof = fit.ndata.saturating_sub(nvarys);
    let scale_conf = t_scale_for_sigma(sigma_conf, dof);
    let scale_pred = t_scale_for_sigma(sigma_pred, dof);
    let split = |values: Vec<f64>| -> Vec<Vec<f64>> { values.chunks(len.max(1)).map(|c| c.to_vec()).collect() };

    let confidence = df2.iter().map(|v| scale_conf * v.max(0.0).sqrt()).collect();
    let prediction = df2
        .iter()
        .map(|v| scale_pred * (v.max(0.0) + fit.redchi).sqrt())
        .collect();
    Ok(Bands {
        confidence: split(confidence),
        prediction: split(prediction),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_model_band_matches_closed_form() {
        // y = a * x over x = 0..4, one row
        let xs = [0.0, 1.0, 2.0, 3.0];
        let model = |p: &[f64]| -> Result<Vec<f64>, AppError> { Ok(xs.iter().map(|x| p[0] * x).collect()) };
        let cov = DMatrix::from_element(1, 1, 0.04);
        let fit = FitSummary {
            values: &[2.0],
            stderr: &[0.2],
            covariance: &cov,
            redchi: 0.5,
            ndata: 1_000_000,
        };
        let bands = eval_uncertainty(model, fit, 1, 4, 1.0, 1.0).unwrap();
        // dof is large so the t scale is ~1
        for (i, x) in xs.iter().enumerate() {
            assert_relative_eq!(bands.confidence[0][i], 0.2 * x, max_relative = 1e-4);
            let pred = (0.04 * x * x + 0.5f64).sqrt();
            assert_relative_eq!(bands.prediction[0][i], pred, max_relative = 1e-4);
        }
    }

    #[test]
    fn rows_are_split_back_out() {
        let model = |p: &[f64]| -> Result<Vec<f64>, AppError> { Ok(vec![p[0], 2.0 * p[0], 0.0, p[1]]) };
        let cov = DMatrix::identity(2, 2);
        let fit = FitSummary {
            values: &[1.0, 1.0],
            stderr: &[1.0, 0.0],
            covariance: &cov,
            redchi: 0.0,
            ndata: 10,
        };
        let bands = eval_uncertainty(model, fit, 2, 2, 2.0, 2.0).unwrap();
        assert_eq!(bands.confidence.len(), 2);
        assert!(bands.confidence[0][1] > bands.confidence[0][0]);
        // zero stderr contributes no variance
        assert_eq!(bands.confidence[1][1], 0.0);
    }

    #[test]
    fn mismatched_covariance_is_an_error() {
        let cov = DMatrix::identity(2, 2);
        let fit = FitSummary {
            values: &[1.0],
            stderr: &[1.0],
            covariance: &cov,
            redchi: 0.0,
            ndata: 10,
        };
        assert!(eval_uncertainty(|_| Ok(vec![0.0]), fit, 1, 1, 1.0, 1.0).is_err());
    }
}
