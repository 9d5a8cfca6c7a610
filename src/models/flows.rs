//! Right-hand side of the compartmental ODE.
//!
//! One call computes every flow between compartments at time `t`:
//!
//! 1. base flows (exposure from infectious, onset, normal recovery, new
//!    critical cases)
//! 2. capacity allocation in three ordered stages (release, overflow return,
//!    admission), each checking that available capacity stays non-negative
//! 3. exposure from untreated overflow patients
//! 4. cared and overflow outcomes
//!
//! The sanity pass is applied once to the incoming state and once to the
//! computed flows; the conservation check runs last.

use nalgebra::DVector;

use crate::domain::{ModelKind, SANITY_TOLERANCE, SanityMode};
use crate::error::AppError;
use crate::models::params::Rates;

pub const N_COMPARTMENTS: usize = 10;

/// Compartment order of the state vector.
pub const COMPARTMENTS: [&str; N_COMPARTMENTS] = [
    "population",
    "susceptible",
    "exposed_normal",
    "exposed_over",
    "infectious",
    "critical",
    "recovered_normal",
    "recovered_critical",
    "dead_normal",
    "dead_over",
];

pub(crate) const POPULATION: usize = 0;
pub(crate) const SUSCEPTIBLE: usize = 1;
pub(crate) const EXPOSED_NORMAL: usize = 2;
pub(crate) const EXPOSED_OVER: usize = 3;
pub(crate) const INFECTIOUS: usize = 4;
pub(crate) const CRITICAL: usize = 5;
pub(crate) const RECOVERED_NORMAL: usize = 6;
pub(crate) const RECOVERED_CRITICAL: usize = 7;
pub(crate) const DEAD_NORMAL: usize = 8;
pub(crate) const DEAD_OVER: usize = 9;

/// Exogenous inputs at one instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Drivers {
    pub t: f64,
    pub population: f64,
    pub capacity: f64,
    /// Exposure rate from the infectious compartment (Rt times leave rate).
    pub exposure_rate: f64,
}

/// Every flow of one derivative evaluation, per day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Flows {
    pub exposed_normal: f64,
    pub exposed_over: f64,
    pub infectious_normal: f64,
    pub infectious_over: f64,
    pub recovery_normal: f64,
    pub critical: f64,
    pub recovery_critical: f64,
    pub death_normal: f64,
    pub death_over: f64,
    pub overflow_return: f64,
    pub critical_cared: f64,
    pub critical_over: f64,
}

impl Flows {
    fn named(&self) -> [(&'static str, f64); 12] {
        [
            ("exposed_flow_normal", self.exposed_normal),
            ("exposed_flow_over", self.exposed_over),
            ("infectious_flow_normal", self.infectious_normal),
            ("infectious_flow_over", self.infectious_over),
            ("recovery_flow_normal", self.recovery_normal),
            ("critical_flow", self.critical),
            ("recovery_flow_critical", self.recovery_critical),
            ("death_flow_normal", self.death_normal),
            ("death_flow_over", self.death_over),
            ("critical_over_return", self.overflow_return),
            ("critical_flow_cared", self.critical_cared),
            ("critical_flow_over", self.critical_over),
        ]
    }

    fn from_named(v: [f64; 12]) -> Self {
        Self {
            exposed_normal: v[0],
            exposed_over: v[1],
            infectious_normal: v[2],
            infectious_over: v[3],
            recovery_normal: v[4],
            critical: v[5],
            recovery_critical: v[6],
            death_normal: v[7],
            death_over: v[8],
            overflow_return: v[9],
            critical_cared: v[10],
            critical_over: v[11],
        }
    }
}

/// Apply the sanity mode to one value.
pub fn sanitize(mode: SanityMode, name: &'static str, value: f64, t: f64) -> Result<f64, AppError> {
    match mode {
        SanityMode::Ignore => Ok(value),
        SanityMode::Clamp => Ok(value.max(0.0)),
        SanityMode::Strict if value < -SANITY_TOLERANCE => Err(AppError::NegativeValue { name, t, value }),
        SanityMode::Strict => Ok(value),
    }
}

fn check_available(stage: &'static str, available: f64, t: f64) -> Result<(), AppError> {
    if available < -SANITY_TOLERANCE || available.is_nan() {
        return Err(AppError::CapacityViolation { stage, t, available });
    }
    Ok(())
}

/// `min(capacity, critical)` and the remainder above capacity.
pub fn split_critical(critical: f64, capacity: f64) -> (f64, f64) {
    let cared = capacity.min(critical);
    (cared, (critical - cared).max(0.0))
}

/// Evaluate the derivative and the flows behind it.
pub fn derivative(
    kind: ModelKind,
    rates: &Rates,
    drivers: &Drivers,
    y: &DVector<f64>,
    mode: SanityMode,
) -> Result<(DVector<f64>, Flows), AppError> {
    let t = drivers.t;
    let mut s = [0.0; N_COMPARTMENTS];
    for (i, &name) in COMPARTMENTS.iter().enumerate() {
        s[i] = sanitize(mode, name, y[i], t)?;
    }
    let n = drivers.population;
    let susceptible = s[SUSCEPTIBLE];
    let infectious = s[INFECTIOUS];
    let critical = s[CRITICAL];

    let mut f = Flows {
        exposed_normal: drivers.exposure_rate * susceptible * infectious / n,
        infectious_normal: rates.infectious_rate * s[EXPOSED_NORMAL],
        infectious_over: rates.infectious_rate * s[EXPOSED_OVER],
        ..Flows::default()
    };

    match kind {
        ModelKind::SeicrdRlc => {
            f.recovery_normal = rates.recovery_rate_normal * infectious * (1.0 - rates.critical_chance);
            f.critical = rates.critical_rate * infectious * rates.critical_chance;

            let capacity = drivers.capacity;
            if mode == SanityMode::Strict && capacity <= 0.0 && critical > SANITY_TOLERANCE {
                return Err(AppError::CapacityViolation {
                    stage: "admission",
                    t,
                    available: capacity - critical,
                });
            }
            let (cared, over) = split_critical(critical, capacity);
            if over > 0.0 && cared < capacity {
                return Err(AppError::CapacityViolation {
                    stage: "occupancy",
                    t,
                    available: capacity - cared,
                });
            }

            f.recovery_critical = rates.recovery_rate_critical * cared * (1.0 - rates.death_chance_normal);
            f.death_normal = rates.death_rate_normal * cared * rates.death_chance_normal;
            f.death_over = rates.death_rate_over * over * rates.death_chance_over;
            if f.death_over > 0.0 && cared < capacity {
                return Err(AppError::CapacityViolation {
                    stage: "overflow death",
                    t,
                    available: capacity - cared,
                });
            }

            // Beds freed this instant by cared patients leaving.
            let available = capacity - cared + f.recovery_critical + f.death_normal;
            check_available("release", available, t)?;
            f.overflow_return = available.min(over);
            let available = available - f.overflow_return;
            check_available("overflow return", available, t)?;
            f.critical_cared = available.min(f.critical);
            let available = available - f.critical_cared;
            check_available("admission", available, t)?;
            f.critical_over = f.critical - f.critical_cared;

            f.exposed_over = rates.exposed_rate_over * susceptible * over / n;
        }
        ModelKind::SeicrdR => {
            f.recovery_normal = rates.recovery_rate_normal * infectious * (1.0 - rates.critical_chance);
            f.critical = rates.critical_rate * infectious * rates.critical_chance;
            f.recovery_critical = rates.recovery_rate_critical * critical * (1.0 - rates.death_chance_normal);
            f.death_normal = rates.death_rate_normal * critical * rates.death_chance_normal;
            f.critical_cared = f.critical;
        }
        ModelKind::Seird => {
            f.recovery_normal = rates.recovery_rate_normal * infectious * (1.0 - rates.death_chance_normal);
            f.death_normal = rates.death_rate_normal * infectious * rates.death_chance_normal;
        }
    }

    let named = f.named();
    let mut clean = [0.0; 12];
    for (slot, (name, value)) in clean.iter_mut().zip(named) {
        *slot = sanitize(mode, name, value, t)?;
    }
    let f = Flows::from_named(clean);

    let mut d = DVector::zeros(N_COMPARTMENTS);
    d[SUSCEPTIBLE] = -f.exposed_normal - f.exposed_over;
    d[EXPOSED_NORMAL] = f.exposed_normal - f.infectious_normal;
    d[EXPOSED_OVER] = f.exposed_over - f.infectious_over;
    d[INFECTIOUS] = f.infectious_normal + f.infectious_over - f.recovery_normal - f.critical;
    match kind {
        ModelKind::Seird => {
            d[INFECTIOUS] -= f.death_normal;
            d[RECOVERED_NORMAL] = f.recovery_normal;
            d[DEAD_NORMAL] = f.death_normal;
        }
        _ => {
            d[CRITICAL] = f.critical - f.recovery_critical - f.death_normal - f.death_over;
            d[RECOVERED_NORMAL] = f.recovery_normal;
            d[RECOVERED_CRITICAL] = f.recovery_critical;
            d[DEAD_NORMAL] = f.death_normal;
            d[DEAD_OVER] = f.death_over;
        }
    }

    let residual: f64 = d.iter().skip(1).sum();
    let scale: f64 = 1.0 + d.iter().skip(1).map(|v| v.abs()).sum::<f64>();
    if residual.abs() > SANITY_TOLERANCE * scale || residual.is_nan() {
        return Err(AppError::PopulationNotConserved { t, residual });
    }
    d[POPULATION] = 0.0;

    if mode == SanityMode::Strict {
        for (i, &name) in COMPARTMENTS.iter().enumerate() {
            if s[i] + d[i] < -SANITY_TOLERANCE {
                return Err(AppError::FlowExceedsSource {
                    name,
                    t,
                    value: s[i],
                    delta: d[i],
                });
            }
        }
    }

    Ok((d, f))
}
