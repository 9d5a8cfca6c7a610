//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - dataset names, model variants and sanity/fit modes (`types`)
//! - plain input/output records exchanged with persistence (`types`)
//! - the validated per-region dataset and its schedules (`region`)

pub mod region;
pub mod types;

pub use region::*;
pub use types::*;
