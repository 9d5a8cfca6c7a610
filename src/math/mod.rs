//! Numerical building blocks: ODE integration, least squares and statistics.

pub mod lm;
pub mod ode;
pub mod ols;
pub mod stats;

pub use lm::{Bound, LmOptions, LmReport, least_squares};
pub use ode::{SolverOptions, integrate_daily};
pub use ols::*;
