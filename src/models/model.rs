//! Compartmental model evaluation.
//!
//! [`CompartmentalModel`] binds a model variant to one region and integrates
//! the ODE on the daily grid. Simulation day `t` is dataset day
//! `t - outbreak_shift`; capacity and Rt schedules are looked up on the
//! dataset axis.

use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use nalgebra::DVector;

use crate::domain::{ModelKind, RegionDataset, SanityMode};
use crate::error::AppError;
use crate::math::{SolverOptions, integrate_daily};
use crate::models::flows::{self, Drivers, N_COMPARTMENTS};
use crate::models::params::{ParamSet, Rates};
use crate::models::simulation::{DailyInputs, Diagnostics, SimulationResult, Trajectories};

/// Shared handle serializing ODE integrations.
///
/// Clones share the same lock; every [`CompartmentalModel::simulate`] holds it
/// for the whole solve.
#[derive(Debug, Clone, Default)]
pub struct IntegrationLock(Arc<Mutex<()>>);

impl IntegrationLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hold(&self) -> MutexGuard<'_, ()> {
        // The guarded unit carries no state, so a poisoned lock is still usable.
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-run inputs resolved from a parameter set.
struct Schedule<'a> {
    kind: ModelKind,
    region: &'a RegionDataset,
    rates: Rates,
    rt_deltas: Vec<(i64, f64)>,
    leave_rate: f64,
    shift: f64,
}

impl Schedule<'_> {
    fn capacity(&self, t: f64) -> f64 {
        if !self.kind.is_capacity_constrained() {
            return f64::INFINITY;
        }
        let capacity = self.region.capacity_at(t - self.shift);
        if capacity.is_infinite() {
            capacity
        } else {
            capacity * self.rates.capacity_multiplier
        }
    }

    fn rt(&self, t: f64) -> f64 {
        self.region
            .transmission_at(self.rates.rt[0], &self.rt_deltas, t - self.shift, self.rates.k)
    }

    fn drivers(&self, t: f64) -> Drivers {
        Drivers {
            t,
            population: self.region.population() as f64,
            capacity: self.capacity(t),
            exposure_rate: self.rt(t) * self.leave_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompartmentalModel<'a> {
    kind: ModelKind,
    region: &'a RegionDataset,
    lock: IntegrationLock,
    solver: SolverOptions,
}

impl<'a> CompartmentalModel<'a> {
    pub fn new(kind: ModelKind, region: &'a RegionDataset, lock: IntegrationLock) -> Self {
        Self {
            kind,
            region,
            lock,
            solver: SolverOptions::default(),
        }
    }

    pub fn with_solver(mut self, solver: SolverOptions) -> Self {
        self.solver = solver;
        self
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn region(&self) -> &'a RegionDataset {
        self.region
    }

    pub fn lock(&self) -> &IntegrationLock {
        &self.lock
    }

    fn schedule(&self, params: &ParamSet, shift: i64) -> Result<Schedule<'a>, AppError> {
        if params.kind() != self.kind {
            return Err(AppError::invalid(format!(
                "Parameters built for {} used with {}.",
                params.kind().display_name(),
                self.kind.display_name()
            )));
        }
        let rates = Rates::from_params(params)?;
        if rates.rt.len() != self.region.rt_breakpoints().len() {
            return Err(AppError::invalid(format!(
                "Expected {} Rt values, got {}.",
                self.region.rt_breakpoints().len(),
                rates.rt.len()
            )));
        }
        let rt_deltas = self.region.rt_deltas(&rates.rt);
        let leave_rate = rates.leave_rate(self.kind);
        Ok(Schedule {
            kind: self.kind,
            region: self.region,
            rates,
            rt_deltas,
            leave_rate,
            shift: shift as f64,
        })
    }

    /// Integrate `days` days starting `shift` days before the oldest
    /// observation.
    pub fn simulate(
        &self,
        params: &ParamSet,
        days: usize,
        shift: i64,
        mode: SanityMode,
    ) -> Result<SimulationResult, AppError> {
        if days == 0 {
            return Err(AppError::invalid("a simulation needs at least one day"));
        }
        let schedule = self.schedule(params, shift)?;
        let population = self.region.population() as f64;
        let seed = self.region.seed_infections() as f64;

        let mut y0 = DVector::zeros(N_COMPARTMENTS);
        y0[flows::POPULATION] = population;
        y0[flows::SUSCEPTIBLE] = population - seed;
        y0[flows::EXPOSED_NORMAL] = seed;

        let states = {
            let _guard = self.lock.hold();
            integrate_daily(
                |t, y| flows::derivative(self.kind, &schedule.rates, &schedule.drivers(t), y, mode).map(|(d, _)| d),
                &y0,
                days,
                &self.solver,
            )?
        };
        debug!(
            "simulated {} for {days} days (shift {shift})",
            self.region.name()
        );

        let column = |i: usize| -> Vec<f64> { states.iter().map(|s| s[i]).collect() };
        let compartments = Trajectories {
            population: column(flows::POPULATION),
            susceptible: column(flows::SUSCEPTIBLE),
            exposed_normal: column(flows::EXPOSED_NORMAL),
            exposed_over: column(flows::EXPOSED_OVER),
            infectious: column(flows::INFECTIOUS),
            critical: column(flows::CRITICAL),
            recovered_normal: column(flows::RECOVERED_NORMAL),
            recovered_critical: column(flows::RECOVERED_CRITICAL),
            dead_normal: column(flows::DEAD_NORMAL),
            dead_over: column(flows::DEAD_OVER),
        };

        let grid: Vec<f64> = (0..days).map(|i| i as f64).collect();
        let inputs = DailyInputs {
            capacity: grid.iter().map(|t| schedule.capacity(*t)).collect(),
            rt: grid.iter().map(|t| schedule.rt(*t)).collect(),
            transmission_rate: grid.iter().map(|t| schedule.rt(*t) * schedule.leave_rate).collect(),
            test_coverage: grid.iter().map(|t| schedule.rates.test_coverage(*t)).collect(),
        };
        let diagnostics = Diagnostics {
            infectious_rate: schedule.rates.infectious_rate,
            r0_over: schedule.rates.r0_over(),
        };

        SimulationResult::new(
            self.kind,
            self.region.oldest_date(),
            shift,
            compartments,
            inputs,
            diagnostics,
            mode,
        )
    }

    /// Flows at the start of every simulated day, for inspection.
    pub fn flows(
        &self,
        params: &ParamSet,
        result: &SimulationResult,
        mode: SanityMode,
    ) -> Result<Vec<flows::Flows>, AppError> {
        let schedule = self.schedule(params, result.outbreak_shift())?;
        let c = result.compartments();
        (0..result.days())
            .map(|i| {
                let y = DVector::from_vec(vec![
                    c.population[i],
                    c.susceptible[i],
                    c.exposed_normal[i],
                    c.exposed_over[i],
                    c.infectious[i],
                    c.critical[i],
                    c.recovered_normal[i],
                    c.recovered_critical[i],
                    c.dead_normal[i],
                    c.dead_over[i],
                ]);
                flows::derivative(self.kind, &schedule.rates, &schedule.drivers(i as f64), &y, mode).map(|(_, f)| f)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::region::tests::{date, tiny_record};
    use crate::domain::types::{CapacityRecord, RtRecord};
    use crate::domain::RegionRecord;
    use crate::models::params::tests::full_params;
    use approx::assert_relative_eq;

    fn region(capacity: Vec<CapacityRecord>, rt: Vec<RtRecord>, seed: u64) -> RegionDataset {
        let record = RegionRecord {
            population: 1000,
            seed: Some(seed),
            capacity,
            rt,
            params: full_params(),
            ..tiny_record(30)
        };
        RegionDataset::from_record(record).unwrap()
    }

    fn rt(day: i64, value: f64) -> RtRecord {
        RtRecord {
            date: date(day),
            init: value,
            min: Some(0.0),
            max: Some(5.0),
            stderr: None,
        }
    }

    #[test]
    fn unconstrained_capacity_never_overflows_and_conserves_population() {
        let region = region(vec![], vec![rt(0, 3.0), rt(20, 1.0)], 1);
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let params = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();
        let sim = model.simulate(&params, 120, 0, SanityMode::Clamp).unwrap();

        assert_eq!(sim.days(), 120);
        assert!(sim.critical_over().iter().all(|v| *v == 0.0));
        for i in 0..sim.days() {
            assert_relative_eq!(sim.compartments().total(i), 1000.0, max_relative = 1e-6);
        }
        assert!(sim.dead().last().copied().unwrap() > 0.0);
    }

    #[test]
    fn zero_transmission_keeps_everyone_susceptible() {
        let record = RegionRecord {
            population: 1000,
            seed: Some(0),
            capacity: vec![],
            rt: vec![rt(0, 0.0)],
            params: full_params(),
            ..tiny_record(30)
        };
        let region = RegionDataset::from_record(record).unwrap();
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let params = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();
        let sim = model.simulate(&params, 40, 0, SanityMode::Clamp).unwrap();

        let c = sim.compartments();
        for i in 1..sim.days() {
            assert_eq!(sim.exposed()[i], 0.0);
            assert_eq!(c.infectious[i], 0.0);
            assert_eq!(c.critical[i], 0.0);
            assert_eq!(sim.dead()[i], 0.0);
            assert_eq!(sim.recovered()[i], 0.0);
            assert_eq!(c.susceptible[i], 1000.0);
        }
    }

    #[test]
    fn capacity_invariant_holds_under_tight_capacity() {
        let region = region(
            vec![CapacityRecord {
                date: date(0),
                capacity: 2.0,
            }],
            vec![rt(0, 4.0)],
            5,
        );
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let params = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();
        let sim = model.simulate(&params, 80, 0, SanityMode::Clamp).unwrap();

        let cared = sim.critical_cared();
        let over = sim.critical_over();
        assert!(over.iter().any(|v| *v > 0.0));
        for i in 0..sim.days() {
            if sim.compartments().critical[i] <= sim.inputs().capacity[i] {
                assert_eq!(over[i], 0.0);
            }
            if over[i] > 0.0 {
                assert_eq!(cared[i], sim.inputs().capacity[i]);
            }
            assert_relative_eq!(sim.compartments().total(i), 1000.0, max_relative = 1e-6);
        }
        assert!(sim.compartments().dead_over.last().copied().unwrap() > 0.0);
    }

    #[test]
    fn capacity_dropping_to_zero_is_fatal_only_in_strict_mode() {
        let region = region(
            vec![
                CapacityRecord {
                    date: date(0),
                    capacity: 50.0,
                },
                CapacityRecord {
                    date: date(25),
                    capacity: 0.0,
                },
            ],
            vec![rt(0, 3.0)],
            5,
        );
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let params = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();

        let err = model.simulate(&params, 40, 0, SanityMode::Strict).unwrap_err();
        match err {
            AppError::CapacityViolation { stage, t, .. } => {
                assert_eq!(stage, "admission");
                assert!(t >= 25.0 && t < 26.0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(model.simulate(&params, 40, 0, SanityMode::Clamp).is_ok());
    }

    #[test]
    fn repeated_runs_are_bit_identical() {
        let region = region(vec![], vec![rt(0, 2.5), rt(15, 0.8)], 3);
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let params = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();
        let a = model.simulate(&params, 60, 4, SanityMode::Clamp).unwrap();
        let b = model.simulate(&params, 60, 4, SanityMode::Clamp).unwrap();
        assert_eq!(a.compartments(), b.compartments());
        assert_eq!(a.mortality_rate(), b.mortality_rate());
    }

    #[test]
    fn every_variant_conserves_population() {
        let region = region(vec![], vec![rt(0, 2.5)], 2);
        for kind in [ModelKind::SeicrdR, ModelKind::Seird] {
            let model = CompartmentalModel::new(kind, &region, IntegrationLock::new());
            let params = ParamSet::initial(kind, &region).unwrap();
            let sim = model.simulate(&params, 90, 0, SanityMode::Clamp).unwrap();
            for i in 0..sim.days() {
                assert_relative_eq!(sim.compartments().total(i), 1000.0, max_relative = 1e-6);
            }
            if kind == ModelKind::Seird {
                assert!(sim.compartments().critical.iter().all(|v| *v == 0.0));
            }
        }
    }

    #[test]
    fn flows_can_be_inspected_after_a_run() {
        let region = region(vec![], vec![rt(0, 2.5)], 2);
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let params = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();
        let sim = model.simulate(&params, 10, 0, SanityMode::Clamp).unwrap();
        let flows = model.flows(&params, &sim, SanityMode::Clamp).unwrap();
        assert_eq!(flows.len(), 10);
        assert!(flows[0].infectious_normal > 0.0);
    }
}
