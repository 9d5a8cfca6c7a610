//! Simulation output and the channels derived from it.
//!
//! Stored: the ten compartment trajectories on the daily grid plus the
//! per-day inputs (capacity, Rt, test coverage) and diagnostics.
//! Everything else (cared/overflow split, scaled channels, daily deltas) is
//! computed on demand from the stored trajectories.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};

use crate::domain::{DatasetName, ModelKind, SANITY_TOLERANCE, SanityMode, SimulationRecord};
use crate::error::AppError;

/// Daily trajectories of the ten compartments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Trajectories {
    pub population: Vec<f64>,
    pub susceptible: Vec<f64>,
    pub exposed_normal: Vec<f64>,
    pub exposed_over: Vec<f64>,
    pub infectious: Vec<f64>,
    pub critical: Vec<f64>,
    pub recovered_normal: Vec<f64>,
    pub recovered_critical: Vec<f64>,
    pub dead_normal: Vec<f64>,
    pub dead_over: Vec<f64>,
}

impl Trajectories {
    /// Sum of all ten compartments at day `i`.
    pub fn total(&self, i: usize) -> f64 {
        self.susceptible[i]
            + self.exposed_normal[i]
            + self.exposed_over[i]
            + self.infectious[i]
            + self.critical[i]
            + self.recovered_normal[i]
            + self.recovered_critical[i]
            + self.dead_normal[i]
            + self.dead_over[i]
    }

    fn named(&self) -> [(&'static str, &Vec<f64>); 10] {
        [
            ("population", &self.population),
            ("susceptible", &self.susceptible),
            ("exposed_normal", &self.exposed_normal),
            ("exposed_over", &self.exposed_over),
            ("infectious", &self.infectious),
            ("critical", &self.critical),
            ("recovered_normal", &self.recovered_normal),
            ("recovered_critical", &self.recovered_critical),
            ("dead_normal", &self.dead_normal),
            ("dead_over", &self.dead_over),
        ]
    }

    /// Apply the sanity mode to every compartment except population and
    /// susceptible.
    fn sanitized(mut self, mode: SanityMode) -> Result<Self, AppError> {
        let targets: [(&'static str, &mut Vec<f64>); 8] = [
            ("exposed_normal", &mut self.exposed_normal),
            ("exposed_over", &mut self.exposed_over),
            ("infectious", &mut self.infectious),
            ("critical", &mut self.critical),
            ("recovered_normal", &mut self.recovered_normal),
            ("recovered_critical", &mut self.recovered_critical),
            ("dead_normal", &mut self.dead_normal),
            ("dead_over", &mut self.dead_over),
        ];
        for (name, series) in targets {
            sanitize_series(mode, name, series)?;
        }
        Ok(self)
    }
}

fn sanitize_series(mode: SanityMode, name: &'static str, series: &mut [f64]) -> Result<(), AppError> {
    match mode {
        SanityMode::Ignore => {}
        SanityMode::Clamp => series.iter_mut().for_each(|v| *v = v.max(0.0)),
        SanityMode::Strict => {
            if let Some((t, value)) = series.iter().enumerate().find(|(_, v)| **v < -SANITY_TOLERANCE) {
                return Err(AppError::NegativeValue {
                    name,
                    t: t as f64,
                    value: *value,
                });
            }
        }
    }
    Ok(())
}

/// Daily deltas; the first value is the raw first sample.
pub fn delta(series: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(series.len());
    if let Some(first) = series.first() {
        out.push(*first);
    }
    out.extend(series.windows(2).map(|w| w[1] - w[0]));
    out
}

fn add(a: &[f64], b: &[f64]) -> Vec<f64> {
    a.iter().zip(b).map(|(x, y)| x + y).collect()
}

/// Per-day inputs recorded alongside the trajectories.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DailyInputs {
    pub capacity: Vec<f64>,
    /// Effective reproduction number from the logistic Rt blend.
    pub rt: Vec<f64>,
    /// Exposure rate from the infectious compartment.
    pub transmission_rate: Vec<f64>,
    pub test_coverage: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct SimulationResult {
    kind: ModelKind,
    oldest_date: NaiveDate,
    outbreak_shift: i64,
    t: Vec<f64>,
    compartments: Trajectories,
    inputs: DailyInputs,
    mortality_rate: Vec<f64>,
    r0_normal: Vec<f64>,
    r0_over: Vec<f64>,
    r0_overall: Vec<f64>,
}

/// Scalars the diagnostics need besides the trajectories.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Diagnostics {
    pub infectious_rate: f64,
    pub r0_over: f64,
}

impl SimulationResult {
    pub(crate) fn new(
        kind: ModelKind,
        oldest_date: NaiveDate,
        outbreak_shift: i64,
        compartments: Trajectories,
        inputs: DailyInputs,
        diagnostics: Diagnostics,
        mode: SanityMode,
    ) -> Result<Self, AppError> {
        let compartments = compartments.sanitized(mode)?;
        let days = compartments.population.len();
        let t: Vec<f64> = (0..days).map(|i| i as f64).collect();

        let exposed = add(&compartments.exposed_normal, &compartments.exposed_over);
        let dead = add(&compartments.dead_normal, &compartments.dead_over);
        let mut mortality_rate = Vec::with_capacity(days);
        let mut onset_total = 0.0;
        for i in 0..days {
            // Onsets strictly before day i.
            let value = if onset_total > 0.0 { 100.0 * dead[i] / onset_total } else { 0.0 };
            mortality_rate.push(if i == 0 { 0.0 } else { value });
            onset_total += diagnostics.infectious_rate * exposed[i];
        }
        sanitize_series(mode, "mortality_rate", &mut mortality_rate)?;

        let mut r0_normal = Vec::with_capacity(days);
        let mut r0_over = Vec::with_capacity(days);
        let mut r0_overall = Vec::with_capacity(days);
        for i in 0..days {
            let infectious = compartments.infectious[i];
            let over = (compartments.critical[i] - inputs.capacity[i]).max(0.0);
            let normal = if infectious > 0.0 { inputs.rt[i] } else { 0.0 };
            let overflow = if over > 0.0 { diagnostics.r0_over } else { 0.0 };
            let total = infectious + over;
            let overall = if total == 0.0 {
                0.0
            } else if infectious == 0.0 {
                overflow
            } else if over == 0.0 {
                normal
            } else {
                inputs.rt[i] * infectious / total + diagnostics.r0_over * over / total
            };
            r0_normal.push(normal);
            r0_over.push(overflow);
            r0_overall.push(overall);
        }

        Ok(Self {
            kind,
            oldest_date,
            outbreak_shift,
            t,
            compartments,
            inputs,
            mortality_rate,
            r0_normal,
            r0_over,
            r0_overall,
        })
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn days(&self) -> usize {
        self.t.len()
    }

    pub fn t(&self) -> &[f64] {
        &self.t
    }

    pub fn outbreak_shift(&self) -> i64 {
        self.outbreak_shift
    }

    pub fn compartments(&self) -> &Trajectories {
        &self.compartments
    }

    pub fn inputs(&self) -> &DailyInputs {
        &self.inputs
    }

    pub fn mortality_rate(&self) -> &[f64] {
        &self.mortality_rate
    }

    pub fn r0_normal(&self) -> &[f64] {
        &self.r0_normal
    }

    pub fn r0_over(&self) -> &[f64] {
        &self.r0_over
    }

    pub fn r0_overall(&self) -> &[f64] {
        &self.r0_overall
    }

    /// Calendar date of simulation day `i`.
    pub fn date_at(&self, i: usize) -> NaiveDate {
        self.oldest_date + Duration::days(i as i64 - self.outbreak_shift)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        (0..self.days()).map(|i| self.date_at(i)).collect()
    }

    pub fn exposed(&self) -> Vec<f64> {
        add(&self.compartments.exposed_normal, &self.compartments.exposed_over)
    }

    pub fn recovered(&self) -> Vec<f64> {
        add(&self.compartments.recovered_normal, &self.compartments.recovered_critical)
    }

    pub fn dead(&self) -> Vec<f64> {
        add(&self.compartments.dead_normal, &self.compartments.dead_over)
    }

    /// Critical patients in care: `min(critical, capacity)`.
    pub fn critical_cared(&self) -> Vec<f64> {
        self.compartments
            .critical
            .iter()
            .zip(&self.inputs.capacity)
            .map(|(c, cap)| c.min(*cap))
            .collect()
    }

    /// Critical patients above capacity: `max(0, critical - capacity)`.
    pub fn critical_over(&self) -> Vec<f64> {
        self.compartments
            .critical
            .iter()
            .zip(&self.inputs.capacity)
            .map(|(c, cap)| (c - cap).max(0.0))
            .collect()
    }

    pub fn infectious_all(&self) -> Vec<f64> {
        add(&self.compartments.infectious, &self.compartments.critical)
    }

    /// Everyone who went untreated: overflow critical plus overflow deaths.
    pub fn over(&self) -> Vec<f64> {
        add(&self.critical_over(), &self.compartments.dead_over)
    }

    fn scaled(&self, a: &[f64], b: &[f64]) -> Vec<f64> {
        self.inputs
            .test_coverage
            .iter()
            .zip(a)
            .zip(b)
            .map(|((cov, a), b)| cov * a + b)
            .collect()
    }

    pub fn infectious_scaled(&self) -> Vec<f64> {
        let zeros = vec![0.0; self.days()];
        let untreated = add(&self.compartments.infectious, &self.critical_over());
        self.scaled(&untreated, &zeros)
    }

    pub fn critical_cared_scaled(&self) -> Vec<f64> {
        self.critical_cared()
    }

    pub fn infectious_all_scaled(&self) -> Vec<f64> {
        add(&self.infectious_scaled(), &self.critical_cared_scaled())
    }

    pub fn recovered_scaled(&self) -> Vec<f64> {
        self.scaled(&self.compartments.recovered_normal, &self.compartments.recovered_critical)
    }

    pub fn dead_scaled(&self) -> Vec<f64> {
        self.scaled(&self.compartments.dead_over, &self.compartments.dead_normal)
    }

    pub fn infected_scaled(&self) -> Vec<f64> {
        let active = self.infectious_all_scaled();
        let closed = add(&self.recovered_scaled(), &self.dead_scaled());
        add(&active, &closed)
    }

    /// The channel comparable with observed series `name`.
    pub fn get_dataset(&self, name: DatasetName) -> Vec<f64> {
        match name {
            DatasetName::Infected => self.infected_scaled(),
            DatasetName::Infectious => self.infectious_scaled(),
            DatasetName::CriticalCared => self.critical_cared_scaled(),
            DatasetName::InfectiousAll => self.infectious_all_scaled(),
            DatasetName::Recovered => self.recovered_scaled(),
            DatasetName::Dead => self.dead_scaled(),
        }
    }

    pub fn get_dataset_by_name(&self, name: &str) -> Result<Vec<f64>, AppError> {
        Ok(self.get_dataset(name.parse()?))
    }

    pub fn get_datasets(&self, names: &[DatasetName]) -> Vec<Vec<f64>> {
        names.iter().map(|n| self.get_dataset(*n)).collect()
    }

    /// Daily new values of a channel.
    pub fn daily_dataset(&self, name: DatasetName) -> Vec<f64> {
        delta(&self.get_dataset(name))
    }

    pub fn to_record(&self, region: &str) -> SimulationRecord {
        let datasets: BTreeMap<DatasetName, Vec<f64>> =
            DatasetName::ALL.into_iter().map(|d| (d, self.get_dataset(d))).collect();
        let mut series: BTreeMap<String, Vec<f64>> = self
            .compartments
            .named()
            .into_iter()
            .map(|(name, v)| (name.to_string(), v.clone()))
            .collect();
        series.insert("critical_cared".into(), self.critical_cared());
        series.insert("critical_over".into(), self.critical_over());
        series.insert("capacity".into(), self.inputs.capacity.clone());
        series.insert("rt".into(), self.inputs.rt.clone());
        series.insert("transmission_rate".into(), self.inputs.transmission_rate.clone());
        series.insert("test_coverage".into(), self.inputs.test_coverage.clone());
        series.insert("mortality_rate".into(), self.mortality_rate.clone());
        series.insert("r0_normal".into(), self.r0_normal.clone());
        series.insert("r0_over".into(), self.r0_over.clone());
        series.insert("r0_overall".into(), self.r0_overall.clone());
        SimulationRecord {
            region: region.to_string(),
            model: self.kind,
            outbreak_shift: self.outbreak_shift,
            dates: self.dates(),
            datasets,
            series,
        }
    }
}
