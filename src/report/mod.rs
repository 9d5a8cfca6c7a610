//! Reporting utilities: goodness-of-fit scoring and formatted terminal output.

pub mod format;
pub mod scorer;

pub use format::*;
pub use scorer::Scorer;
