//! Crate-wide error type.
//!
//! Failures fall into four families, each with its own process exit code:
//!
//! - input validation (2): raised before any computation starts
//! - invariant violations (3): raised while integrating the model
//! - numerical / optimizer failures (4)
//! - I/O and serialization (5)
//!
//! Recoverable estimation gaps (missing covariance, missing standard errors)
//! never surface here; they are handled where they occur.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Unknown dataset name: '{0}'")]
    UnknownDatasetName(String),

    #[error("{schedule} schedule must have strictly increasing day indices (day {day} follows day {previous})")]
    NonIncreasingSchedule {
        schedule: &'static str,
        previous: i64,
        day: i64,
    },

    #[error("A cross-validation split must be at least 2, got {0}")]
    SplitTooSmall(usize),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing model parameter '{0}'")]
    MissingParameter(String),

    #[error("Capacity invariant violated at stage {stage} (t={t:.4}): available capacity {available}")]
    CapacityViolation {
        stage: &'static str,
        t: f64,
        available: f64,
    },

    #[error("Population not conserved at t={t:.4}: derivative sums to {residual}")]
    PopulationNotConserved { t: f64, residual: f64 },

    #[error("{name} can't be negative at t={t:.4} ({value})")]
    NegativeValue { name: &'static str, t: f64, value: f64 },

    #[error("{name} can't flow more than its source at t={t:.4} ({value} + {delta})")]
    FlowExceedsSource {
        name: &'static str,
        t: f64,
        value: f64,
        delta: f64,
    },

    #[error("Integration failed: {0}")]
    IntegrationFailed(String),

    #[error("Optimizer did not converge: {0}")]
    NonConvergence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AppError {
    pub fn invalid(message: impl Into<String>) -> Self {
        AppError::InvalidInput(message.into())
    }

    pub fn exit_code(&self) -> u8 {
        match self {
            AppError::UnknownDatasetName(_)
            | AppError::NonIncreasingSchedule { .. }
            | AppError::SplitTooSmall(_)
            | AppError::InvalidInput(_)
            | AppError::MissingParameter(_) => 2,
            AppError::CapacityViolation { .. }
            | AppError::PopulationNotConserved { .. }
            | AppError::NegativeValue { .. }
            | AppError::FlowExceedsSource { .. } => 3,
            AppError::IntegrationFailed(_) | AppError::NonConvergence(_) => 4,
            AppError::Io(_) | AppError::Json(_) => 5,
        }
    }

    /// True for failures raised by the model's own consistency checks.
    pub fn is_invariant_violation(&self) -> bool {
        self.exit_code() == 3
    }
}
