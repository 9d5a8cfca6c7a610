//! Model calibration.
//!
//! Responsibilities:
//!
//! - build walk-forward cross-validation folds
//! - fit model parameters by bounded least squares on each fold and on the
//!   full series
//! - derive uncertainty bands from the fit covariance

pub mod fitter;
pub mod result;
pub mod splits;
pub mod uncertainty;

pub use fitter::*;
pub use result::*;
pub use splits::*;
pub use uncertainty::*;
