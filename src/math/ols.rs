//! Linear least squares solver.
//!
//! The optimizer repeatedly solves small damped normal systems written as an
//! augmented least squares problem:
//!
//! ```text
//! minimize ‖J δ + r‖² + λ ‖D δ‖²   ⇔   [J; √λ D] δ ≈ [-r; 0]
//! ```
//!
//! Implementation choices:
//! - SVD handles tall systems (more residuals than parameters) and rank loss
//!   when a parameter barely moves the residuals.
//! - The column count is the number of free parameters, so SVD cost is
//!   negligible next to the model evaluations.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    // Try progressively looser tolerances if strict solve fails.
    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Inverse of a symmetric positive definite matrix, or `None` when it is
/// singular or the result has a non-positive diagonal.
pub fn invert_spd(a: &DMatrix<f64>) -> Option<DMatrix<f64>> {
    let inv = a.clone().cholesky()?.inverse();
    let ok = inv.iter().all(|v| v.is_finite()) && inv.diagonal().iter().all(|d| *d > 0.0);
    ok.then_some(inv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_solves_simple_system() {
        // Fit y = 2 + 3x on x = [0,1,2]
        let x = DMatrix::from_row_slice(3, 2, &[1.0, 0.0, 1.0, 1.0, 1.0, 2.0]);
        let y = DVector::from_row_slice(&[2.0, 5.0, 8.0]);

        let beta = solve_least_squares(&x, &y).unwrap();
        assert!((beta[0] - 2.0).abs() < 1e-10);
        assert!((beta[1] - 3.0).abs() < 1e-10);
    }

    #[test]
    fn damped_rows_shrink_the_step() {
        let j = DMatrix::from_row_slice(2, 1, &[1.0, 1.0]);
        let r = DVector::from_row_slice(&[-2.0, -2.0]);
        let plain = solve_least_squares(&j, &(-&r)).unwrap();

        let mut aug = DMatrix::zeros(3, 1);
        aug.view_mut((0, 0), (2, 1)).copy_from(&j);
        aug[(2, 0)] = 2.0;
        let rhs = DVector::from_row_slice(&[2.0, 2.0, 0.0]);
        let damped = solve_least_squares(&aug, &rhs).unwrap();

        assert!((plain[0] - 2.0).abs() < 1e-10);
        assert!(damped[0] < plain[0] && damped[0] > 0.0);
    }

    #[test]
    fn singular_matrix_has_no_inverse() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 1.0, 1.0]);
        assert!(invert_spd(&a).is_none());
        let b = DMatrix::from_row_slice(2, 2, &[2.0, 0.0, 0.0, 4.0]);
        let inv = invert_spd(&b).unwrap();
        assert!((inv[(1, 1)] - 0.25).abs() < 1e-12);
    }
}
