//! Adaptive Dormand–Prince 5(4) integrator.
//!
//! # Step policy
//! - Integrates forward one day at a time, landing exactly on every integer
//!   day, so the output is already on the daily grid and piecewise-constant
//!   inputs only change at interval boundaries.
//! - The step size carries over between days.
//! - The right-hand side is fallible; its first error aborts the solve.

use nalgebra::DVector;

use crate::error::AppError;

/// Tolerances and step guards for [`integrate_daily`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverOptions {
    pub rtol: f64,
    pub atol: f64,
    pub first_step: f64,
    pub min_step: f64,
    pub max_steps_per_day: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            rtol: 1e-8,
            atol: 1e-6,
            first_step: 0.1,
            min_step: 1e-10,
            max_steps_per_day: 10_000,
        }
    }
}

// Butcher tableau.
const C: [f64; 5] = [0.2, 0.3, 0.8, 8.0 / 9.0, 1.0];
const A2: [f64; 1] = [0.2];
const A3: [f64; 2] = [3.0 / 40.0, 9.0 / 40.0];
const A4: [f64; 3] = [44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0];
const A5: [f64; 4] = [19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0];
const A6: [f64; 5] = [
    9017.0 / 3168.0,
    -355.0 / 33.0,
    46732.0 / 5247.0,
    49.0 / 176.0,
    -5103.0 / 18656.0,
];
const B: [f64; 6] = [
    35.0 / 384.0,
    0.0,
    500.0 / 1113.0,
    125.0 / 192.0,
    -2187.0 / 6784.0,
    11.0 / 84.0,
];
// 5th minus 4th order weights.
const E: [f64; 7] = [
    71.0 / 57600.0,
    0.0,
    -71.0 / 16695.0,
    71.0 / 1920.0,
    -17253.0 / 339200.0,
    22.0 / 525.0,
    -1.0 / 40.0,
];

fn combine(y: &DVector<f64>, h: f64, coeffs: &[f64], ks: &[DVector<f64>]) -> DVector<f64> {
    let mut out = y.clone();
    for (c, k) in coeffs.iter().zip(ks) {
        if *c != 0.0 {
            out.axpy(h * c, k, 1.0);
        }
    }
    out
}

/// Integrate `dy/dt = f(t, y)` from `t = 0` and return the state at
/// `t = 0, 1, ..., days - 1`.
pub fn integrate_daily<F>(
    mut f: F,
    y0: &DVector<f64>,
    days: usize,
    options: &SolverOptions,
) -> Result<Vec<DVector<f64>>, AppError>
where
    F: FnMut(f64, &DVector<f64>) -> Result<DVector<f64>, AppError>,
{
    if y0.iter().any(|v| !v.is_finite()) {
        return Err(AppError::IntegrationFailed("initial state must be finite".into()));
    }
    if !(options.rtol > 0.0 && options.atol > 0.0) {
        return Err(AppError::invalid("solver tolerances must be > 0"));
    }

    let mut out = Vec::with_capacity(days);
    if days == 0 {
        return Ok(out);
    }
    let mut y = y0.clone();
    out.push(y.clone());

    let mut h = options.first_step.clamp(options.min_step, 1.0);
    let mut k1 = f(0.0, &y)?;

    for day in 1..days {
        let t_end = day as f64;
        let mut t = t_end - 1.0;
        let mut steps = 0usize;

        while t < t_end {
            steps += 1;
            if steps > options.max_steps_per_day {
                return Err(AppError::IntegrationFailed(format!(
                    "exceeded {} steps within day {}",
                    options.max_steps_per_day,
                    day - 1
                )));
            }
            let last = t + h >= t_end;
            let step = if last { t_end - t } else { h };

            let mut ks: Vec<DVector<f64>> = Vec::with_capacity(6);
            ks.push(k1.clone());
            for (stage, coeffs) in [&A2[..], &A3[..], &A4[..], &A5[..], &A6[..]].into_iter().enumerate() {
                let y_stage = combine(&y, step, coeffs, &ks);
                ks.push(f(t + C[stage] * step, &y_stage)?);
            }
            let y_new = combine(&y, step, &B, &ks);
            if y_new.iter().any(|v| !v.is_finite()) {
                return Err(AppError::IntegrationFailed(format!(
                    "non-finite state near t={t:.4}"
                )));
            }
            let t_new = if last { t_end } else { t + step };
            let k7 = f(t_new, &y_new)?;

            let mut err_sq = 0.0;
            for i in 0..y.len() {
                let mut e = E[6] * k7[i];
                for (j, k) in ks.iter().enumerate() {
                    e += E[j] * k[i];
                }
                let scale = options.atol + options.rtol * y[i].abs().max(y_new[i].abs());
                err_sq += (step * e / scale).powi(2);
            }
            let err = (err_sq / y.len().max(1) as f64).sqrt();

            if err <= 1.0 {
                t = t_new;
                y = y_new;
                k1 = k7;
                let factor = if err == 0.0 { 5.0 } else { (0.9 * err.powf(-0.2)).clamp(0.2, 5.0) };
                // Do not let a shortened final step shrink the carried step size.
                h = (h.max(step) * factor).min(1.0);
            } else {
                h = step * (0.9 * err.powf(-0.2)).clamp(0.2, 1.0);
                if h < options.min_step {
                    return Err(AppError::IntegrationFailed(format!(
                        "step size underflow near t={t:.4}"
                    )));
                }
            }
        }
        out.push(y.clone());
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn exponential_decay_matches_analytic_on_daily_grid() {
        let k = 0.3;
        let y0 = DVector::from_vec(vec![5.0]);
        let out = integrate_daily(|_, y| Ok(y * -k), &y0, 11, &SolverOptions::default()).unwrap();

        assert_eq!(out.len(), 11);
        for (day, y) in out.iter().enumerate() {
            assert_relative_eq!(y[0], 5.0 * (-k * day as f64).exp(), max_relative = 1e-5);
        }
    }

    #[test]
    fn right_hand_side_errors_abort_the_solve() {
        let y0 = DVector::from_vec(vec![1.0]);
        let err = integrate_daily(
            |t, y| {
                if t > 2.5 {
                    Err(AppError::IntegrationFailed("boom".into()))
                } else {
                    Ok(y.clone())
                }
            },
            &y0,
            5,
            &SolverOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, AppError::IntegrationFailed(ref m) if m == "boom"));
    }

    #[test]
    fn zero_days_yields_empty_output() {
        let y0 = DVector::from_vec(vec![1.0, 2.0]);
        let out = integrate_daily(|_, y| Ok(y.clone()), &y0, 0, &SolverOptions::default()).unwrap();
        assert!(out.is_empty());
    }
}
