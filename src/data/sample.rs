//! Synthetic regions simulated from known parameters.
//!
//! The observations are the model's own channels with multiplicative
//! log-normal noise, so a fit against them has a known answer. Generation is
//! deterministic for a given seed.

use chrono::{Duration, NaiveDate};
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::LogNormal;

use crate::domain::{
    CapacityRecord, DatasetName, DayRecord, ModelKind, ParamRecord, RegionDataset, RegionRecord, RtRecord,
    SanityMode,
};
use crate::error::AppError;
use crate::models::{CompartmentalModel, IntegrationLock, ParamSet};

/// Knobs for [`synthetic_record_with`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSpec {
    pub population: u64,
    pub seed_infections: u64,
    pub start: NaiveDate,
    pub capacity: f64,
    /// True Rt before and after the midpoint of the series.
    pub rt: (f64, f64),
    /// Log-space standard deviation of the observation noise.
    pub noise_sigma: f64,
}

impl Default for SyntheticSpec {
    fn default() -> Self {
        Self {
            population: 100_000,
            seed_infections: 10,
            start: NaiveDate::from_ymd_opt(2020, 3, 1).unwrap_or_default(),
            capacity: 40.0,
            rt: (2.8, 0.9),
            noise_sigma: 0.05,
        }
    }
}

fn param(name: &str, init: f64, min: f64, max: f64) -> ParamRecord {
    ParamRecord {
        parameter: name.to_string(),
        init,
        min: Some(min),
        max: Some(max),
        vary: true,
        expr: None,
        stderr: None,
    }
}

/// Parameters the synthetic data is generated from.
pub fn synthetic_params() -> Vec<ParamRecord> {
    vec![
        param("infectious_rate", 0.25, 0.1, 0.5),
        param("critical_chance", 0.1, 0.02, 0.3),
        param("critical_rate", 0.2, 0.05, 0.5),
        param("recovery_rate_normal", 0.1, 0.05, 0.3),
        param("recovery_rate_critical", 0.07, 0.03, 0.2),
        param("death_chance_normal", 0.25, 0.05, 0.6),
        param("death_rate_normal", 0.1, 0.03, 0.3),
        param("death_chance_over", 0.8, 0.8, 0.8),
        param("death_rate_over", 0.3, 0.1, 0.6),
        param("exposed_rate_over", 0.5, 0.1, 1.0),
        param("k", 0.5, 0.1, 2.0),
        param("capacity_multiplier", 1.0, 1.0, 1.0),
        param("test_coverage_0", 0.6, 0.1, 1.0),
        param("test_coverage_increase", 0.005, 0.0, 0.05),
        param("test_coverage_max", 0.9, 0.5, 1.0),
    ]
}

/// A region of `days` noisy observations with default settings.
pub fn synthetic_record(name: &str, days: usize, seed: u64) -> Result<RegionRecord, AppError> {
    synthetic_record_with(name, days, seed, &SyntheticSpec::default())
}

pub fn synthetic_region(name: &str, days: usize, seed: u64) -> Result<RegionDataset, AppError> {
    RegionDataset::from_record(synthetic_record(name, days, seed)?)
}

pub fn synthetic_record_with(name: &str, days: usize, seed: u64, spec: &SyntheticSpec) -> Result<RegionRecord, AppError> {
    if days < 2 {
        return Err(AppError::invalid("a synthetic region needs at least two days"));
    }
    if !(spec.noise_sigma.is_finite() && spec.noise_sigma >= 0.0) {
        return Err(AppError::invalid("noise sigma must be finite and >= 0"));
    }
    let date = |day: usize| spec.start + Duration::days(day as i64);
    let midpoint = days / 2;
    let rt_record = |day: usize, value: f64| RtRecord {
        date: date(day),
        init: value,
        min: Some(0.3),
        max: Some(5.0),
        stderr: None,
    };

    let mut record = RegionRecord {
        name: name.to_string(),
        population: spec.population,
        seed: Some(spec.seed_infections),
        first_positive: spec.start,
        outbreak_shift: 0,
        capacity: vec![CapacityRecord {
            date: spec.start,
            capacity: spec.capacity,
        }],
        rt: vec![rt_record(0, spec.rt.0), rt_record(midpoint, spec.rt.1)],
        params: synthetic_params(),
        days: (0..days)
            .map(|i| DayRecord {
                date: date(i),
                infected: 0.0,
                infectious: 0.0,
                critical_cared: 0.0,
                infectious_all: 0.0,
                recovered: 0.0,
                dead: 0.0,
            })
            .collect(),
    };

    let truth = RegionDataset::from_record(record.clone())?;
    let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &truth, IntegrationLock::new());
    let params = ParamSet::initial(ModelKind::SeicrdRlc, &truth)?;
    let sim = model.simulate(&params, days, 0, SanityMode::Clamp)?;

    let mut rng = StdRng::seed_from_u64(seed);
    let noise = LogNormal::new(-spec.noise_sigma * spec.noise_sigma / 2.0, spec.noise_sigma)
        .map_err(|e| AppError::invalid(format!("noise distribution error: {e}")))?;
    let mut noisy = |name: DatasetName| -> Vec<f64> {
        sim.get_dataset(name)
            .into_iter()
            .map(|v| v.max(0.0) * noise.sample(&mut rng))
            .collect()
    };
    let infected = noisy(DatasetName::Infected);
    let infectious = noisy(DatasetName::Infectious);
    let critical_cared = noisy(DatasetName::CriticalCared);
    let infectious_all = noisy(DatasetName::InfectiousAll);
    let recovered = noisy(DatasetName::Recovered);
    let dead = noisy(DatasetName::Dead);

    for (i, day) in record.days.iter_mut().enumerate() {
        day.infected = infected[i];
        day.infectious = infectious[i];
        day.critical_cared = critical_cared[i];
        day.infectious_all = infectious_all[i];
        day.recovered = recovered[i];
        day.dead = dead[i];
    }
    if let Some(first) = infected.iter().position(|v| *v >= 1.0) {
        record.first_positive = date(first);
    }

    // Start the fit away from the truth.
    for rt in &mut record.rt {
        rt.init = (rt.init * 0.9).max(0.3);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_gives_same_observations() {
        let a = synthetic_record("x", 40, 3).unwrap();
        let b = synthetic_record("x", 40, 3).unwrap();
        let c = synthetic_record("x", 40, 4).unwrap();
        assert_eq!(a, b);
        assert_ne!(a.days, c.days);
    }

    #[test]
    fn observations_are_valid_and_growing() {
        let region = synthetic_region("grow", 50, 9).unwrap();
        assert_eq!(region.data_count(), 50);
        let dead = &region.observed().dead;
        assert!(dead.iter().all(|v| v.is_finite() && *v >= 0.0));
        assert!(dead[49] > dead[10]);
        assert_eq!(region.rt_breakpoints().len(), 2);
        assert_eq!(region.rt_breakpoints()[1].day, 25);
    }

    #[test]
    fn too_short_series_is_rejected() {
        assert!(synthetic_record("short", 1, 0).is_err());
    }
}
