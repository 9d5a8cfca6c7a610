//! `epi-curves` library crate.
//!
//! The binary (`epi`) is a thin wrapper around this library so that:
//!
//! - the model, fitter and scorer are testable without spawning processes
//! - regions can be simulated and fitted from other front-ends
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
