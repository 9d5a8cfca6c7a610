//! Bounded nonlinear least squares.
//!
//! Minimizes `Σ r_i(x)²` over the free parameters `x`, each optionally bounded.
//!
//! - Bounds are removed by the MINUIT-style change of variables
//!   (`sin` for two-sided bounds, `sqrt` for one-sided), so the inner loop is
//!   unconstrained.
//! - The Jacobian is a forward finite difference in internal coordinates.
//! - Steps come from the damped augmented system solved by
//!   [`solve_least_squares`](crate::math::ols::solve_least_squares).
//! - The covariance is `(JᵀJ)⁻¹ · redchi`, mapped back to external
//!   coordinates through the transform's derivative.

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::domain::FitMethod;
use crate::error::AppError;
use crate::math::ols::{invert_spd, solve_least_squares};

/// Optional box bounds for one parameter.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Bound {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Bound {
    pub fn new(min: Option<f64>, max: Option<f64>) -> Self {
        Self { min, max }
    }

    fn clamp(&self, x: f64) -> f64 {
        let x = self.min.map_or(x, |lo| x.max(lo));
        self.max.map_or(x, |hi| x.min(hi))
    }

    fn to_internal(&self, x: f64) -> f64 {
        let x = self.clamp(x);
        match (self.min, self.max) {
            (Some(lo), Some(hi)) if hi > lo => (2.0 * (x - lo) / (hi - lo) - 1.0).clamp(-1.0, 1.0).asin(),
            (Some(_), Some(_)) => 0.0,
            (Some(lo), None) => ((x - lo + 1.0).powi(2) - 1.0).sqrt(),
            (None, Some(hi)) => ((hi - x + 1.0).powi(2) - 1.0).sqrt(),
            (None, None) => x,
        }
    }

    fn to_external(&self, p: f64) -> f64 {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => lo + (p.sin() + 1.0) * (hi - lo) / 2.0,
            (Some(lo), None) => lo - 1.0 + (p * p + 1.0).sqrt(),
            (None, Some(hi)) => hi + 1.0 - (p * p + 1.0).sqrt(),
            (None, None) => p,
        }
    }

    /// `d external / d internal` at internal value `p`.
    fn gradient(&self, p: f64) -> f64 {
        match (self.min, self.max) {
            (Some(lo), Some(hi)) => p.cos() * (hi - lo) / 2.0,
            (Some(_), None) => p / (p * p + 1.0).sqrt(),
            (None, Some(_)) => -p / (p * p + 1.0).sqrt(),
            (None, None) => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LmOptions {
    pub method: FitMethod,
    pub max_nfev: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    /// Relative finite-difference step in internal coordinates.
    pub diff_step: f64,
}

impl Default for LmOptions {
    fn default() -> Self {
        Self {
            method: FitMethod::LevenbergMarquardt,
            max_nfev: 2000,
            ftol: 1e-10,
            xtol: 1e-10,
            gtol: 1e-10,
            diff_step: 1e-6,
        }
    }
}

/// Outcome of a converged least squares run.
#[derive(Debug, Clone)]
pub struct LmReport {
    /// Best external parameter values.
    pub x: Vec<f64>,
    pub residual: Vec<f64>,
    pub chisqr: f64,
    pub redchi: f64,
    pub nfev: usize,
    pub iterations: usize,
    /// External-coordinate covariance, scaled by `redchi`.
    pub covariance: Option<DMatrix<f64>>,
    pub message: &'static str,
}

impl LmReport {
    /// Standard errors from the covariance diagonal.
    pub fn stderr(&self) -> Option<Vec<f64>> {
        self.covariance
            .as_ref()
            .map(|c| c.diagonal().iter().map(|v| v.sqrt()).collect())
    }
}

fn sum_sq(r: &[f64]) -> f64 {
    r.iter().map(|v| v * v).sum()
}

struct Problem<'a, F> {
    f: F,
    bounds: &'a [Bound],
    nfev: usize,
    max_nfev: usize,
}

impl<F> Problem<'_, F>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, AppError>,
{
    fn external(&self, p: &DVector<f64>) -> Vec<f64> {
        p.iter().zip(self.bounds).map(|(v, b)| b.to_external(*v)).collect()
    }

    fn eval(&mut self, p: &DVector<f64>) -> Result<Vec<f64>, AppError> {
        if self.nfev >= self.max_nfev {
            return Err(AppError::NonConvergence(format!(
                "maximum number of function evaluations ({}) exceeded",
                self.max_nfev
            )));
        }
        self.nfev += 1;
        let x = self.external(p);
        (self.f)(&x)
    }

    fn jacobian(&mut self, p: &DVector<f64>, r: &[f64], diff_step: f64) -> Result<DMatrix<f64>, AppError> {
        let m = r.len();
        let n = p.len();
        let mut jac = DMatrix::zeros(m, n);
        for j in 0..n {
            let h = diff_step * p[j].abs().max(1.0);
            let mut q = p.clone();
            q[j] += h;
            let rj = self.eval(&q)?;
            if rj.len() != m {
                return Err(AppError::IntegrationFailed("residual length changed between evaluations".into()));
            }
            for i in 0..m {
                jac[(i, j)] = (rj[i] - r[i]) / h;
            }
        }
        Ok(jac)
    }
}

/// Minimize the sum of squared residuals returned by `f` (called with
/// external parameter values), starting from `x0` within `bounds`.
///
/// A stalled search (no damping level yields a reduction) counts as
/// converged. Running out of function evaluations or a non-finite residual at
/// the start is [`AppError::NonConvergence`].
pub fn least_squares<F>(f: F, x0: &[f64], bounds: &[Bound], options: &LmOptions) -> Result<LmReport, AppError>
where
    F: FnMut(&[f64]) -> Result<Vec<f64>, AppError>,
{
    if x0.len() != bounds.len() {
        return Err(AppError::invalid("one bound per parameter is required"));
    }
    let mut problem = Problem {
        f,
        bounds,
        nfev: 0,
        max_nfev: options.max_nfev.max(1),
    };

    let mut p = DVector::from_iterator(x0.len(), x0.iter().zip(bounds).map(|(x, b)| b.to_internal(*x)));
    let mut r = problem.eval(&p)?;
    if r.iter().any(|v| !v.is_finite()) {
        return Err(AppError::NonConvergence("residuals are not finite at the initial point".into()));
    }
    let mut cost = sum_sq(&r);
    let n = p.len();
    let m = r.len();

    if n == 0 {
        return Ok(LmReport {
            x: Vec::new(),
            residual: r,
            chisqr: cost,
            redchi: cost / m.max(1) as f64,
            nfev: problem.nfev,
            iterations: 0,
            covariance: None,
            message: "no free parameters",
        });
    }

    let gauss_newton = options.method == FitMethod::GaussNewton;
    let mut lambda: f64 = if gauss_newton { 0.0 } else { 1e-3 };
    let mut iterations = 0usize;
    let mut jac = problem.jacobian(&p, &r, options.diff_step)?;
    let mut jac_stale = false;
    let message;

    'outer: loop {
        iterations += 1;
        let rv = DVector::from_column_slice(&r);
        let grad = jac.transpose() * &rv;
        let jtj = jac.transpose() * &jac;
        let col_norms: Vec<f64> = (0..n).map(|j| jtj[(j, j)].sqrt().max(f64::MIN_POSITIVE)).collect();

        let gnorm = (0..n)
            .map(|j| grad[j].abs() / (col_norms[j] * cost.sqrt().max(f64::MIN_POSITIVE)))
            .fold(0.0, f64::max);
        if gnorm <= options.gtol {
            message = "gradient is orthogonal to the residuals";
            break;
        }

        loop {
            let damping: Vec<f64> = col_norms.iter().map(|c| lambda.sqrt() * c).collect();
            let mut aug = DMatrix::zeros(m + n, n);
            aug.view_mut((0, 0), (m, n)).copy_from(&jac);
            for j in 0..n {
                aug[(m + j, j)] = damping[j];
            }
            let mut rhs = DVector::zeros(m + n);
            for i in 0..m {
                rhs[i] = -r[i];
            }

            let step = solve_least_squares(&aug, &rhs);
            let accepted = match step {
                Some(delta) => {
                    let trial = &p + &delta;
                    let r_trial = problem.eval(&trial)?;
                    let cost_trial = sum_sq(&r_trial);
                    if cost_trial.is_finite() && cost_trial < cost {
                        let reduction = (cost - cost_trial) / cost.max(f64::MIN_POSITIVE);
                        let small_step = delta.norm() <= options.xtol * (p.norm() + options.xtol);
                        debug!(
                            "lm iter {iterations}: cost {cost:.6e} -> {cost_trial:.6e}, lambda {lambda:.2e}, nfev {}",
                            problem.nfev
                        );
                        p = trial;
                        r = r_trial;
                        cost = cost_trial;
                        lambda = if gauss_newton { 0.0 } else { (lambda / 10.0).max(1e-12) };
                        jac_stale = true;
                        if reduction <= options.ftol {
                            message = "relative reduction in the sum of squares is at most ftol";
                            break 'outer;
                        }
                        if small_step {
                            message = "relative step is at most xtol";
                            break 'outer;
                        }
                        true
                    } else {
                        false
                    }
                }
                None => false,
            };
            if accepted {
                break;
            }
            lambda = if lambda == 0.0 { 1e-3 } else { lambda * 10.0 };
            if lambda > 1e16 {
                message = "no further reduction possible";
                break 'outer;
            }
        }
        jac = problem.jacobian(&p, &r, options.diff_step)?;
        jac_stale = false;
    }

    // Covariance from the Jacobian at the solution.
    if jac_stale {
        jac = problem.jacobian(&p, &r, options.diff_step)?;
    }
    let chisqr = cost;
    let redchi = chisqr / (m.saturating_sub(n)).max(1) as f64;
    let covariance = invert_spd(&(jac.transpose() * &jac)).map(|cov_int| {
        let grads: Vec<f64> = p.iter().zip(bounds).map(|(v, b)| b.gradient(*v)).collect();
        DMatrix::from_fn(n, n, |i, j| cov_int[(i, j)] * grads[i] * grads[j] * redchi)
    });

    debug!(
        "lm finished after {iterations} iterations, {} evaluations: {message}",
        problem.nfev
    );

    Ok(LmReport {
        x: problem.external(&p),
        residual: r,
        chisqr,
        redchi,
        nfev: problem.nfev,
        iterations,
        covariance,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn exp_data() -> (Vec<f64>, Vec<f64>) {
        let t: Vec<f64> = (0..20).map(|i| i as f64 * 0.25).collect();
        let y = t.iter().map(|t| 3.0 * (-0.7 * t).exp()).collect();
        (t, y)
    }

    #[test]
    fn bound_transforms_round_trip() {
        let bounds = [
            Bound::new(Some(0.0), Some(2.0)),
            Bound::new(Some(1.0), None),
            Bound::new(None, Some(-1.0)),
            Bound::default(),
        ];
        for (b, x) in bounds.iter().zip([0.3, 4.0, -7.5, 12.0]) {
            assert_relative_eq!(b.to_external(b.to_internal(x)), x, max_relative = 1e-12);
        }
    }

    #[test]
    fn fits_exponential_decay_within_bounds() {
        let (t, y) = exp_data();
        let residual = |x: &[f64]| -> Result<Vec<f64>, AppError> {
            Ok(t.iter().zip(&y).map(|(t, y)| y - x[0] * (-x[1] * t).exp()).collect())
        };
        let bounds = [Bound::new(Some(0.0), Some(10.0)), Bound::new(Some(0.0), Some(5.0))];
        let report = least_squares(residual, &[1.0, 0.2], &bounds, &LmOptions::default()).unwrap();

        assert_relative_eq!(report.x[0], 3.0, max_relative = 1e-5);
        assert_relative_eq!(report.x[1], 0.7, max_relative = 1e-5);
        assert!(report.chisqr < 1e-10);
    }

    #[test]
    fn gauss_newton_reaches_the_same_optimum() {
        let (t, y) = exp_data();
        let noisy: Vec<f64> = y.iter().enumerate().map(|(i, v)| v + if i % 2 == 0 { 0.01 } else { -0.01 }).collect();
        let residual = |x: &[f64]| -> Result<Vec<f64>, AppError> {
            Ok(t.iter().zip(&noisy).map(|(t, y)| y - x[0] * (-x[1] * t).exp()).collect())
        };
        let bounds = [Bound::default(), Bound::new(Some(0.0), None)];
        let options = LmOptions {
            method: FitMethod::GaussNewton,
            ..LmOptions::default()
        };
        let report = least_squares(residual, &[2.5, 0.5], &bounds, &options).unwrap();

        assert_relative_eq!(report.x[0], 3.0, max_relative = 1e-2);
        assert_relative_eq!(report.x[1], 0.7, max_relative = 1e-2);
        let stderr = report.stderr().unwrap();
        assert!(stderr.iter().all(|s| s.is_finite() && *s > 0.0));
    }

    #[test]
    fn evaluation_budget_is_enforced() {
        let residual = |x: &[f64]| -> Result<Vec<f64>, AppError> { Ok(vec![x[0] - 1.0, (x[0] - 1.0) * 2.0]) };
        let options = LmOptions {
            max_nfev: 1,
            ..LmOptions::default()
        };
        let err = least_squares(residual, &[5.0], &[Bound::default()], &options).unwrap_err();
        assert!(matches!(err, AppError::NonConvergence(_)));
    }

    #[test]
    fn non_finite_start_is_rejected() {
        let residual = |_: &[f64]| -> Result<Vec<f64>, AppError> { Ok(vec![f64::NAN]) };
        let err = least_squares(residual, &[0.0], &[Bound::default()], &LmOptions::default()).unwrap_err();
        assert!(matches!(err, AppError::NonConvergence(_)));
    }
}
