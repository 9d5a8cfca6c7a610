//! Per-region dataset: population, observed series, parameter bounds and the
//! two time-varying input schedules (hospital capacity and Rt breakpoints).
//!
//! A `RegionDataset` is built once from a [`RegionRecord`] and is read-only
//! afterwards. All day indices are relative to the oldest observed date.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};

use crate::domain::types::{DatasetName, ParamSpec, RegionRecord};
use crate::error::AppError;

/// Rt breakpoint: effective from `day`, with fit bounds.
#[derive(Debug, Clone, PartialEq)]
pub struct RtBreakpoint {
    pub date: NaiveDate,
    pub day: i64,
    pub spec: ParamSpec,
}

/// The six observed daily series, all the same length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservedSeries {
    pub infected: Vec<f64>,
    pub infectious: Vec<f64>,
    pub critical_cared: Vec<f64>,
    pub infectious_all: Vec<f64>,
    pub recovered: Vec<f64>,
    pub dead: Vec<f64>,
}

impl ObservedSeries {
    pub fn get(&self, name: DatasetName) -> &[f64] {
        match name {
            DatasetName::Infected => &self.infected,
            DatasetName::Infectious => &self.infectious,
            DatasetName::CriticalCared => &self.critical_cared,
            DatasetName::InfectiousAll => &self.infectious_all,
            DatasetName::Recovered => &self.recovered,
            DatasetName::Dead => &self.dead,
        }
    }

    pub fn len(&self) -> usize {
        self.infected.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infected.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct RegionDataset {
    name: String,
    population: u64,
    seed_infections: u64,
    oldest_date: NaiveDate,
    first_positive_index: i64,
    outbreak_shift: i64,
    params: BTreeMap<String, ParamSpec>,
    rt: Vec<RtBreakpoint>,
    capacity: Vec<(i64, f64)>,
    series: ObservedSeries,
}

impl RegionDataset {
    /// Validate and freeze a region's input records.
    pub fn from_record(record: RegionRecord) -> Result<Self, AppError> {
        if record.population == 0 {
            return Err(AppError::invalid(format!(
                "Region '{}': population must be > 0.",
                record.name
            )));
        }
        let Some(first_day) = record.days.first() else {
            return Err(AppError::invalid(format!(
                "Region '{}': no observed days.",
                record.name
            )));
        };
        let oldest_date = first_day.date;

        let mut series = ObservedSeries::default();
        for (i, day) in record.days.iter().enumerate() {
            let index = (day.date - oldest_date).num_days();
            if index != i as i64 {
                return Err(AppError::invalid(format!(
                    "Region '{}': observations must be consecutive daily records (got {} at position {i}).",
                    record.name, day.date
                )));
            }
            let values = [
                day.infected,
                day.infectious,
                day.critical_cared,
                day.infectious_all,
                day.recovered,
                day.dead,
            ];
            if values.iter().any(|v| !(v.is_finite() && *v >= 0.0)) {
                return Err(AppError::invalid(format!(
                    "Region '{}': observed counts on {} must be finite and non-negative.",
                    record.name, day.date
                )));
            }
            series.infected.push(day.infected);
            series.infectious.push(day.infectious);
            series.critical_cared.push(day.critical_cared);
            series.infectious_all.push(day.infectious_all);
            series.recovered.push(day.recovered);
            series.dead.push(day.dead);
        }

        let day_of = |date: NaiveDate| (date - oldest_date).num_days();

        let capacity: Vec<(i64, f64)> = record
            .capacity
            .iter()
            .map(|c| (day_of(c.date), c.capacity))
            .collect();
        check_increasing("capacity", capacity.iter().map(|(d, _)| *d))?;
        if let Some((day, cap)) = capacity.iter().find(|(_, c)| c.is_nan() || *c < 0.0) {
            return Err(AppError::invalid(format!(
                "Region '{}': capacity on day {day} must be non-negative, got {cap}.",
                record.name
            )));
        }

        if record.rt.is_empty() {
            return Err(AppError::invalid(format!(
                "Region '{}': at least one Rt breakpoint is required.",
                record.name
            )));
        }
        let rt: Vec<RtBreakpoint> = record
            .rt
            .iter()
            .map(|r| RtBreakpoint {
                date: r.date,
                day: day_of(r.date),
                spec: ParamSpec {
                    init: r.init,
                    min: r.min,
                    max: r.max,
                    vary: true,
                    expr: None,
                    stderr: r.stderr,
                },
            })
            .collect();
        check_increasing("Rt", rt.iter().map(|r| r.day))?;

        let mut params = BTreeMap::new();
        for p in record.params {
            if !p.init.is_finite() {
                return Err(AppError::invalid(format!(
                    "Region '{}': parameter '{}' has a non-finite initial value.",
                    record.name, p.parameter
                )));
            }
            if let (Some(lo), Some(hi)) = (p.min, p.max) {
                if lo > hi {
                    return Err(AppError::invalid(format!(
                        "Region '{}': parameter '{}' has min > max.",
                        record.name, p.parameter
                    )));
                }
            }
            params.insert(
                p.parameter,
                ParamSpec {
                    init: p.init,
                    min: p.min,
                    max: p.max,
                    vary: p.vary,
                    expr: p.expr,
                    stderr: p.stderr,
                },
            );
        }

        let first_positive_index = day_of(record.first_positive).max(0);
        let seed_infections = match record.seed {
            Some(seed) => seed,
            None => series
                .infected
                .get(first_positive_index as usize)
                .map(|v| v.round() as u64)
                .unwrap_or(1)
                .max(1),
        };
        if seed_infections > record.population {
            return Err(AppError::invalid(format!(
                "Region '{}': seed infections exceed population.",
                record.name
            )));
        }

        Ok(Self {
            name: record.name,
            population: record.population,
            seed_infections,
            oldest_date,
            first_positive_index,
            outbreak_shift: record.outbreak_shift,
            params,
            rt,
            capacity,
            series,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn population(&self) -> u64 {
        self.population
    }

    pub fn seed_infections(&self) -> u64 {
        self.seed_infections
    }

    pub fn oldest_date(&self) -> NaiveDate {
        self.oldest_date
    }

    pub fn first_positive_index(&self) -> i64 {
        self.first_positive_index
    }

    /// Outbreak shift stored with the region (from the last fit).
    pub fn stored_outbreak_shift(&self) -> i64 {
        self.outbreak_shift
    }

    pub fn params(&self) -> &BTreeMap<String, ParamSpec> {
        &self.params
    }

    pub fn param(&self, name: &str) -> Result<&ParamSpec, AppError> {
        self.params
            .get(name)
            .ok_or_else(|| AppError::MissingParameter(name.to_string()))
    }

    pub fn rt_breakpoints(&self) -> &[RtBreakpoint] {
        &self.rt
    }

    pub fn capacity_schedule(&self) -> &[(i64, f64)] {
        &self.capacity
    }

    pub fn observed(&self) -> &ObservedSeries {
        &self.series
    }

    /// Number of observed days.
    pub fn data_count(&self) -> usize {
        self.series.len()
    }

    /// Days since the oldest observation.
    pub fn day_index(&self, date: NaiveDate) -> i64 {
        (date - self.oldest_date).num_days()
    }

    /// Calendar date of a dataset day index.
    pub fn date_at(&self, day: i64) -> NaiveDate {
        self.oldest_date + Duration::days(day)
    }

    /// Calendar dates of a simulation grid of `length` days starting `shift`
    /// days before the oldest observation.
    pub fn dates(&self, shift: i64, length: usize) -> Vec<NaiveDate> {
        (0..length as i64).map(|i| self.date_at(i - shift)).collect()
    }

    /// Step-function capacity lookup: the capacity of the latest breakpoint
    /// whose day is `<= t`, or `+inf` before the first breakpoint.
    pub fn capacity_at(&self, t: f64) -> f64 {
        let mut ret = f64::INFINITY;
        for &(day, capacity) in &self.capacity {
            if (day as f64) <= t {
                ret = capacity;
            } else {
                break;
            }
        }
        ret
    }

    /// Rt breakpoint deltas `(day_i, value_i - value_{i-1})` for `i >= 1`.
    pub fn rt_deltas(&self, values: &[f64]) -> Vec<(i64, f64)> {
        values
            .windows(2)
            .zip(self.rt.iter().skip(1))
            .map(|(pair, bp)| (bp.day, pair[1] - pair[0]))
            .collect()
    }

    /// Logistic blend of the Rt schedule at dataset day `t`:
    /// `r0 + Σ delta_i / (1 + exp(k (day_i - t)))`.
    pub fn transmission_at(&self, r0: f64, rt_deltas: &[(i64, f64)], t: f64, k: f64) -> f64 {
        r0 + rt_deltas
            .iter()
            .map(|&(day, delta)| delta / (1.0 + (k * (day as f64 - t)).exp()))
            .sum::<f64>()
    }

    /// One observed series aligned to simulation day 0.
    ///
    /// `shift > 0` prepends `shift` zeros; `shift < 0` drops the first `-shift`
    /// samples.
    pub fn observed_series(&self, name: DatasetName, shift: i64) -> Vec<f64> {
        shift_series(self.series.get(name), shift)
    }

    /// Like [`observed_series`](Self::observed_series) but by dataset name.
    pub fn observed_series_by_name(&self, name: &str, shift: i64) -> Result<Vec<f64>, AppError> {
        Ok(self.observed_series(name.parse()?, shift))
    }

    /// Rows of observed series, one per dataset, aligned to simulation day 0.
    pub fn observed_rows(&self, names: &[DatasetName], shift: i64) -> Vec<Vec<f64>> {
        names.iter().map(|&n| self.observed_series(n, shift)).collect()
    }

    /// Days the epidemic is assumed to precede the oldest observation.
    ///
    /// `trunc(extra - (first_positive_index - incubation_period))`, floored at
    /// `minimum` when given.
    pub fn outbreak_shift(&self, incubation_period: f64, extra: i64, minimum: Option<i64>) -> i64 {
        let shift = (extra as f64 - (self.first_positive_index as f64 - incubation_period)).trunc() as i64;
        match minimum {
            Some(m) => shift.max(m),
            None => shift,
        }
    }

    /// Simulated days needed to cover the observations under `shift`.
    pub fn data_days(&self, shift: i64) -> i64 {
        self.data_count() as i64 + shift
    }
}

pub(crate) fn shift_series(data: &[f64], shift: i64) -> Vec<f64> {
    if shift >= 0 {
        let mut out = vec![0.0; shift as usize];
        out.extend_from_slice(data);
        out
    } else {
        let skip = (-shift) as usize;
        data.iter().skip(skip).copied().collect()
    }
}

fn check_increasing(schedule: &'static str, days: impl Iterator<Item = i64>) -> Result<(), AppError> {
    let mut previous: Option<i64> = None;
    for day in days {
        if let Some(prev) = previous {
            if day <= prev {
                return Err(AppError::NonIncreasingSchedule {
                    schedule,
                    previous: prev,
                    day,
                });
            }
        }
        previous = Some(day);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::types::{CapacityRecord, DayRecord, ParamRecord, RtRecord};

    pub(crate) fn date(day: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, 20).unwrap() + Duration::days(day)
    }

    pub(crate) fn tiny_record(days: usize) -> RegionRecord {
        RegionRecord {
            name: "test".into(),
            population: 1000,
            seed: Some(1),
            first_positive: date(2),
            outbreak_shift: 0,
            capacity: vec![
                CapacityRecord { date: date(0), capacity: 10.0 },
                CapacityRecord { date: date(5), capacity: 20.0 },
            ],
            rt: vec![
                RtRecord { date: date(0), init: 3.0, min: Some(0.5), max: Some(5.0), stderr: None },
                RtRecord { date: date(10), init: 1.0, min: Some(0.5), max: Some(5.0), stderr: None },
            ],
            params: vec![ParamRecord {
                parameter: "infectious_rate".into(),
                init: 0.25,
                min: Some(0.1),
                max: Some(0.5),
                vary: true,
                expr: None,
                stderr: None,
            }],
            days: (0..days)
                .map(|i| DayRecord {
                    date: date(i as i64),
                    infected: i as f64,
                    infectious: 1.0,
                    critical_cared: 2.0,
                    infectious_all: 3.0,
                    recovered: 4.0,
                    dead: 5.0,
                })
                .collect(),
        }
    }

    #[test]
    fn capacity_is_a_step_function_with_infinite_prefix() {
        let mut record = tiny_record(8);
        record.capacity[0].date = date(2);
        let region = RegionDataset::from_record(record).unwrap();

        assert!(region.capacity_at(0.0).is_infinite());
        assert!(region.capacity_at(1.999).is_infinite());
        assert_eq!(region.capacity_at(2.0), 10.0);
        assert_eq!(region.capacity_at(4.9), 10.0);
        assert_eq!(region.capacity_at(5.0), 20.0);
        assert_eq!(region.capacity_at(100.0), 20.0);
    }

    #[test]
    fn non_increasing_schedules_are_rejected() {
        let mut record = tiny_record(8);
        record.capacity[1].date = date(0);
        let err = RegionDataset::from_record(record).unwrap_err();
        assert!(matches!(err, AppError::NonIncreasingSchedule { schedule: "capacity", .. }));

        let mut record = tiny_record(8);
        record.rt[1].date = date(0);
        let err = RegionDataset::from_record(record).unwrap_err();
        assert!(matches!(err, AppError::NonIncreasingSchedule { schedule: "Rt", .. }));
    }

    #[test]
    fn logistic_rt_blends_smoothly_between_breakpoints() {
        let region = RegionDataset::from_record(tiny_record(8)).unwrap();
        let deltas = region.rt_deltas(&[3.0, 1.0]);
        assert_eq!(deltas, vec![(10, -2.0)]);

        let k = 0.5;
        let early = region.transmission_at(3.0, &deltas, 0.0, k);
        let mid = region.transmission_at(3.0, &deltas, 10.0, k);
        let late = region.transmission_at(3.0, &deltas, 40.0, k);
        assert!((early - 3.0).abs() < 0.02);
        assert!((mid - 2.0).abs() < 1e-12);
        assert!((late - 1.0).abs() < 1e-6);
    }

    #[test]
    fn observed_series_shift_prepends_or_drops() {
        let region = RegionDataset::from_record(tiny_record(4)).unwrap();
        assert_eq!(region.observed_series(DatasetName::Infected, 0), vec![0.0, 1.0, 2.0, 3.0]);
        assert_eq!(
            region.observed_series(DatasetName::Infected, 2),
            vec![0.0, 0.0, 0.0, 1.0, 2.0, 3.0]
        );
        assert_eq!(region.observed_series(DatasetName::Infected, -1), vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            region.observed_series_by_name("icu", 0),
            Err(AppError::UnknownDatasetName(_))
        ));
    }

    #[test]
    fn outbreak_shift_and_dates() {
        let region = RegionDataset::from_record(tiny_record(6)).unwrap();
        // first positive on day 2, incubation 4 days -> starts 2 days before day 0
        assert_eq!(region.outbreak_shift(4.0, 0, None), 2);
        assert_eq!(region.outbreak_shift(1.0, 0, Some(0)), 0);
        assert_eq!(region.data_days(2), 8);
        assert_eq!(region.dates(2, 3), vec![date(-2), date(-1), date(0)]);
        assert_eq!(region.day_index(date(3)), 3);
    }

    #[test]
    fn gaps_in_observations_are_rejected() {
        let mut record = tiny_record(4);
        record.days.remove(1);
        assert!(matches!(
            RegionDataset::from_record(record),
            Err(AppError::InvalidInput(_))
        ));
    }
}
