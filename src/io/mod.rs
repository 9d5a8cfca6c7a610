//! Input/output helpers.
//!
//! - region JSON read/write (`region`)
//! - fit and simulation exports (JSON/CSV) (`export`)

pub mod export;
pub mod region;

pub use export::*;
pub use region::*;
