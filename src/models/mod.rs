//! Compartmental epidemic models.
//!
//! - [`params`]: parameter sets and resolved rates
//! - [`flows`]: the ODE right-hand side with capacity-aware routing
//! - [`model`]: binding a variant to a region and integrating it
//! - [`simulation`]: trajectories and the observable channels derived from them

pub mod flows;
pub mod model;
pub mod params;
pub mod simulation;

pub use flows::{COMPARTMENTS, Drivers, Flows, N_COMPARTMENTS};
pub use model::{CompartmentalModel, IntegrationLock};
pub use params::{NamedParam, ParamSet, Rates};
pub use simulation::{DailyInputs, SimulationResult, Trajectories, delta};
