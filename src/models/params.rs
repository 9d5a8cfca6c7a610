//! Model parameter sets.
//!
//! A [`ParamSet`] holds the named parameters a [`ModelKind`] reads plus one
//! value per Rt breakpoint. It is built from a region in one of two ways:
//!
//! - [`ParamSet::for_fit`]: bounds and vary flags as stored, with caller
//!   overrides, ready to hand to the optimizer
//! - [`ParamSet::initial`]: every value fixed at its stored initial value
//!
//! Both share [`region_specs`], so the two never disagree on which
//! parameters exist.

use crate::domain::{ModelKind, ParamSpec, RegionDataset};
use crate::error::AppError;
use crate::math::Bound;

#[derive(Debug, Clone, PartialEq)]
pub struct NamedParam {
    pub name: String,
    pub spec: ParamSpec,
}

/// Named parameters plus the Rt breakpoint vector.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSet {
    kind: ModelKind,
    named: Vec<NamedParam>,
    rt: Vec<ParamSpec>,
}

/// Stored specs for `kind`'s parameters and the region's Rt breakpoints.
fn region_specs(kind: ModelKind, region: &RegionDataset) -> Result<(Vec<NamedParam>, Vec<ParamSpec>), AppError> {
    let named = kind
        .param_names()
        .iter()
        .map(|name| {
            Ok(NamedParam {
                name: (*name).to_string(),
                spec: region.param(name)?.clone(),
            })
        })
        .collect::<Result<Vec<_>, AppError>>()?;
    let rt = region.rt_breakpoints().iter().map(|bp| bp.spec.clone()).collect();
    Ok((named, rt))
}

impl ParamSet {
    /// Parameters as stored, with each name in `unvary` held fixed.
    ///
    /// Stored standard errors are dropped; a fit fills them in again.
    pub fn for_fit(kind: ModelKind, region: &RegionDataset, unvary: &[String]) -> Result<Self, AppError> {
        let (mut named, rt) = region_specs(kind, region)?;
        for p in &mut named {
            if unvary.iter().any(|u| u == &p.name) {
                p.spec.vary = false;
            }
        }
        let mut set = Self { kind, named, rt };
        set.clear_stderr();
        set.check_ties()?;
        Ok(set.with_ties_resolved())
    }

    /// Plain initial values; nothing varies.
    pub fn initial(kind: ModelKind, region: &RegionDataset) -> Result<Self, AppError> {
        let (mut named, mut rt) = region_specs(kind, region)?;
        for spec in named.iter_mut().map(|p| &mut p.spec).chain(rt.iter_mut()) {
            spec.vary = false;
        }
        let set = Self { kind, named, rt };
        set.check_ties()?;
        Ok(set.with_ties_resolved())
    }

    pub fn kind(&self) -> ModelKind {
        self.kind
    }

    pub fn named(&self) -> &[NamedParam] {
        &self.named
    }

    pub fn rt(&self) -> &[ParamSpec] {
        &self.rt
    }

    pub fn rt_values(&self) -> Vec<f64> {
        self.rt.iter().map(|s| s.init).collect()
    }

    pub fn value(&self, name: &str) -> Result<f64, AppError> {
        self.named
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.spec.init)
            .ok_or_else(|| AppError::MissingParameter(name.to_string()))
    }

    /// Override one named value (the parameter must exist).
    pub fn set_value(&mut self, name: &str, value: f64) -> Result<(), AppError> {
        let p = self
            .named
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| AppError::MissingParameter(name.to_string()))?;
        p.spec.init = value;
        *self = self.with_ties_resolved();
        Ok(())
    }

    fn specs(&self) -> impl Iterator<Item = &ParamSpec> {
        self.named.iter().map(|p| &p.spec).chain(self.rt.iter())
    }

    fn specs_mut(&mut self) -> impl Iterator<Item = &mut ParamSpec> {
        self.named.iter_mut().map(|p| &mut p.spec).chain(self.rt.iter_mut())
    }

    /// Number of parameters the optimizer moves.
    pub fn n_free(&self) -> usize {
        self.specs().filter(|s| s.is_free()).count()
    }

    /// Labels of the free parameters, Rt breakpoints as `r_<i>`.
    pub fn free_names(&self) -> Vec<String> {
        let named = self.named.iter().filter(|p| p.spec.is_free()).map(|p| p.name.clone());
        let rt = self
            .rt
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_free())
            .map(|(i, _)| format!("r_{i}"));
        named.chain(rt).collect()
    }

    pub fn free_values(&self) -> Vec<f64> {
        self.specs().filter(|s| s.is_free()).map(|s| s.init).collect()
    }

    pub fn free_bounds(&self) -> Vec<Bound> {
        self.specs()
            .filter(|s| s.is_free())
            .map(|s| Bound::new(s.min, s.max))
            .collect()
    }

    /// Copy with the free values replaced by `values` (in [`free_values`]
    /// order) and ties re-resolved.
    ///
    /// [`free_values`]: Self::free_values
    pub fn with_free_values(&self, values: &[f64]) -> Self {
        let mut out = self.clone();
        let mut it = values.iter();
        for spec in out.specs_mut().filter(|s| s.is_free()) {
            if let Some(v) = it.next() {
                spec.init = *v;
            }
        }
        out.with_ties_resolved()
    }

    /// Copy with fitted standard errors stored on the free parameters.
    pub fn with_free_stderr(&self, stderr: &[f64]) -> Self {
        let mut out = self.clone();
        let mut it = stderr.iter();
        for spec in out.specs_mut().filter(|s| s.is_free()) {
            spec.stderr = it.next().copied();
        }
        out
    }

    pub fn clear_stderr(&mut self) {
        for spec in self.specs_mut() {
            spec.stderr = None;
        }
    }

    /// Fixed parameters get a standard error of 0; free ones missing one get
    /// 10% of their value. Returns how many free parameters were filled.
    pub fn backfill_stderr(&mut self) -> usize {
        let mut filled = 0;
        for spec in self.specs_mut() {
            if !spec.is_free() {
                spec.stderr = Some(0.0);
            } else if spec.stderr.is_none_or(|s| !s.is_finite()) {
                spec.stderr = Some((spec.init * 0.1).abs());
                filled += 1;
            }
        }
        filled
    }

    fn check_ties(&self) -> Result<(), AppError> {
        for p in &self.named {
            if let Some(target) = &p.spec.expr {
                let found = self.named.iter().find(|q| &q.name == target);
                match found {
                    None => return Err(AppError::MissingParameter(target.clone())),
                    Some(q) if q.spec.expr.is_some() => {
                        return Err(AppError::invalid(format!(
                            "Parameter '{}' is tied to '{}', which is itself tied.",
                            p.name, target
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(())
    }

    fn with_ties_resolved(&self) -> Self {
        let mut out = self.clone();
        for i in 0..out.named.len() {
            if let Some(target) = out.named[i].spec.expr.clone() {
                if let Some(v) = self.named.iter().find(|q| q.name == target).map(|q| q.spec.init) {
                    out.named[i].spec.init = v;
                }
            }
        }
        out
    }
}

/// Resolved numeric rates for one simulation run.
///
/// Parameters a variant does not declare take neutral defaults: no critical
/// path, unlimited care, full test coverage.
#[derive(Debug, Clone, PartialEq)]
pub struct Rates {
    pub infectious_rate: f64,
    pub critical_chance: f64,
    pub critical_rate: f64,
    pub recovery_rate_normal: f64,
    pub recovery_rate_critical: f64,
    pub death_chance_normal: f64,
    pub death_rate_normal: f64,
    pub death_chance_over: f64,
    pub death_rate_over: f64,
    pub exposed_rate_over: f64,
    pub k: f64,
    pub capacity_multiplier: f64,
    pub test_coverage_0: f64,
    pub test_coverage_increase: f64,
    pub test_coverage_max: f64,
    pub rt: Vec<f64>,
}

impl Rates {
    pub fn from_params(params: &ParamSet) -> Result<Self, AppError> {
        let declared = params.kind().param_names();
        let get = |name: &str, default: f64| -> Result<f64, AppError> {
            if declared.contains(&name) {
                params.value(name)
            } else {
                Ok(default)
            }
        };
        let rates = Self {
            infectious_rate: get("infectious_rate", 0.0)?,
            critical_chance: get("critical_chance", 0.0)?,
            critical_rate: get("critical_rate", 0.0)?,
            recovery_rate_normal: get("recovery_rate_normal", 0.0)?,
            recovery_rate_critical: get("recovery_rate_critical", 0.0)?,
            death_chance_normal: get("death_chance_normal", 0.0)?,
            death_rate_normal: get("death_rate_normal", 0.0)?,
            death_chance_over: get("death_chance_over", 0.0)?,
            death_rate_over: get("death_rate_over", 0.0)?,
            exposed_rate_over: get("exposed_rate_over", 0.0)?,
            k: get("k", 1.0)?,
            capacity_multiplier: get("capacity_multiplier", 1.0)?,
            test_coverage_0: get("test_coverage_0", 1.0)?,
            test_coverage_increase: get("test_coverage_increase", 0.0)?,
            test_coverage_max: get("test_coverage_max", 1.0)?,
            rt: params.rt_values(),
        };
        if rates.rt.is_empty() {
            return Err(AppError::invalid("at least one Rt value is required"));
        }
        Ok(rates)
    }

    /// Rate at which the infectious compartment empties; scales Rt into the
    /// exposure rate.
    pub fn leave_rate(&self, kind: ModelKind) -> f64 {
        match kind {
            ModelKind::SeicrdRlc | ModelKind::SeicrdR => {
                self.recovery_rate_normal * (1.0 - self.critical_chance) + self.critical_rate * self.critical_chance
            }
            ModelKind::Seird => {
                self.recovery_rate_normal * (1.0 - self.death_chance_normal)
                    + self.death_rate_normal * self.death_chance_normal
            }
        }
    }

    /// Saturating test-coverage ramp.
    pub fn test_coverage(&self, t: f64) -> f64 {
        self.test_coverage_max
            .min(self.test_coverage_0 + self.test_coverage_increase * t)
    }

    /// Diagnostic reproduction number of overflow patients.
    pub fn r0_over(&self) -> f64 {
        if self.death_rate_over > 0.0 {
            self.exposed_rate_over / self.death_rate_over
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::region::tests::tiny_record;
    use crate::domain::types::ParamRecord;
    use crate::domain::RegionRecord;

    pub(crate) fn full_params() -> Vec<ParamRecord> {
        let p = |name: &str, init: f64, min: f64, max: f64| ParamRecord {
            parameter: name.into(),
            init,
            min: Some(min),
            max: Some(max),
            vary: true,
            expr: None,
            stderr: None,
        };
        vec![
            p("infectious_rate", 0.25, 0.1, 0.5),
            p("critical_chance", 0.1, 0.01, 0.3),
            p("critical_rate", 0.2, 0.05, 0.5),
            p("recovery_rate_normal", 0.1, 0.05, 0.3),
            p("recovery_rate_critical", 0.07, 0.03, 0.2),
            p("death_chance_normal", 0.2, 0.05, 0.5),
            p("death_rate_normal", 0.1, 0.03, 0.3),
            p("death_chance_over", 0.8, 0.8, 0.8),
            p("death_rate_over", 0.3, 0.1, 0.6),
            p("exposed_rate_over", 0.5, 0.1, 1.0),
            p("k", 0.5, 0.1, 2.0),
            p("capacity_multiplier", 1.0, 1.0, 1.0),
            p("test_coverage_0", 0.5, 0.1, 1.0),
            p("test_coverage_increase", 0.01, 0.0, 0.05),
            p("test_coverage_max", 0.9, 0.5, 1.0),
        ]
    }

    fn region_with(params: Vec<ParamRecord>) -> RegionDataset {
        let record = RegionRecord {
            params,
            ..tiny_record(10)
        };
        RegionDataset::from_record(record).unwrap()
    }

    #[test]
    fn free_count_skips_collapsed_and_unvaried() {
        let region = region_with(full_params());
        let set = ParamSet::for_fit(ModelKind::SeicrdRlc, &region, &["k".to_string()]).unwrap();
        // 15 named, 2 collapsed (death_chance_over, capacity_multiplier), k unvaried, + 2 Rt
        assert_eq!(set.n_free(), 15 - 3 + 2);
        assert_eq!(set.free_values().len(), set.n_free());
        assert!(set.free_names().contains(&"r_1".to_string()));

        let initial = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();
        assert_eq!(initial.n_free(), 0);
    }

    #[test]
    fn tied_parameters_follow_their_target() {
        let mut params = full_params();
        params[6].expr = Some("recovery_rate_critical".into());
        let region = region_with(params);
        let set = ParamSet::for_fit(ModelKind::SeicrdRlc, &region, &[]).unwrap();
        assert_eq!(set.value("death_rate_normal").unwrap(), 0.07);

        let mut free = set.free_values();
        let idx = set
            .free_names()
            .iter()
            .position(|n| n == "recovery_rate_critical")
            .unwrap();
        free[idx] = 0.12;
        let moved = set.with_free_values(&free);
        assert_eq!(moved.value("death_rate_normal").unwrap(), 0.12);
    }

    #[test]
    fn missing_parameter_is_reported() {
        let mut params = full_params();
        params.retain(|p| p.parameter != "k");
        let region = region_with(params);
        let err = ParamSet::for_fit(ModelKind::SeicrdRlc, &region, &[]).unwrap_err();
        assert!(matches!(err, AppError::MissingParameter(ref n) if n == "k"));
        // SEIRD does not read the critical path, only k is missing there too
        assert!(ParamSet::initial(ModelKind::Seird, &region).is_err());
    }

    #[test]
    fn stderr_backfill_uses_ten_percent_for_free_parameters() {
        let region = region_with(full_params());
        let mut set = ParamSet::for_fit(ModelKind::SeicrdRlc, &region, &[]).unwrap();
        set.backfill_stderr();
        let rate = set.named().iter().find(|p| p.name == "infectious_rate").unwrap();
        assert!((rate.spec.stderr.unwrap() - 0.025).abs() < 1e-12);
        let fixed = set.named().iter().find(|p| p.name == "death_chance_over").unwrap();
        assert_eq!(fixed.spec.stderr, Some(0.0));
    }

    #[test]
    fn stored_stderr_is_dropped_for_fit_and_fixed_ones_become_zero() {
        let mut params = full_params();
        for p in &mut params {
            if p.parameter == "infectious_rate" || p.parameter == "death_chance_over" {
                p.stderr = Some(42.0);
            }
        }
        let region = region_with(params);
        let mut set = ParamSet::for_fit(ModelKind::SeicrdRlc, &region, &[]).unwrap();
        assert!(set.named().iter().all(|p| p.spec.stderr.is_none()));
        assert!(set.rt().iter().all(|s| s.stderr.is_none()));

        let mut stale = set.with_free_stderr(&vec![3.0; set.n_free()]);
        let fixed = stale.named.iter_mut().find(|p| p.name == "death_chance_over").unwrap();
        fixed.spec.stderr = Some(7.0);
        assert_eq!(stale.backfill_stderr(), 0);
        let fixed = stale.named().iter().find(|p| p.name == "death_chance_over").unwrap();
        assert_eq!(fixed.spec.stderr, Some(0.0));
        let rate = stale.named().iter().find(|p| p.name == "infectious_rate").unwrap();
        assert_eq!(rate.spec.stderr, Some(3.0));

        set.clear_stderr();
        assert_eq!(set.backfill_stderr(), set.n_free());
    }

    #[test]
    fn seird_rates_use_neutral_defaults() {
        let region = region_with(full_params());
        let set = ParamSet::initial(ModelKind::Seird, &region).unwrap();
        let rates = Rates::from_params(&set).unwrap();
        assert_eq!(rates.critical_chance, 0.0);
        assert_eq!(rates.test_coverage(50.0), 1.0);
        let leave = 0.1 * 0.8 + 0.1 * 0.2;
        assert!((rates.leave_rate(ModelKind::Seird) - leave).abs() < 1e-12);
    }
}
