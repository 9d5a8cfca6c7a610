//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the fitting and simulation code stays free of presentation concerns
//! - output changes are localized

use std::fmt::Write as _;

use crate::domain::{FitRecord, ScoreRecord};
use crate::error::AppError;
use crate::fit::FittingResult;
use crate::models::SimulationResult;

/// Header, optimizer diagnostics, then [`format_fit_record`].
pub fn format_fit_summary(result: &FittingResult<'_>) -> Result<String, AppError> {
    let record = result.to_record()?;
    let report = result.report();

    let mut out = String::new();
    let _ = writeln!(out, "=== epi - {} fit: {} ===", record.model.display_name(), record.region);
    let _ = writeln!(
        out,
        "Days: {} | outbreak shift: {} | datasets: {}",
        result.days(),
        record.outbreak_shift,
        result
            .datasets()
            .iter()
            .map(|d| d.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = writeln!(
        out,
        "Optimizer: {} (nfev={}, iterations={}, chisqr={:.4e}, redchi={:.4e})",
        report.message, report.nfev, report.iterations, report.chisqr, report.redchi
    );
    if report.covariance.is_none() {
        out.push_str("Covariance unavailable: standard errors backfilled, bands are zero.\n");
    }
    out.push('\n');
    out.push_str(&format_fit_record(&record));
    Ok(out)
}

/// Parameter and Rt tables followed by the fit and held-out score tables.
pub fn format_fit_record(record: &FitRecord) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "Free parameters: {}", record.n_free_params);
    push_row(&mut out, &format!("{:<24} {:>12} {:>12}", "parameter", "value", "stderr"));
    push_row(&mut out, &format!("{:-<24} {:-<12} {:-<12}", "", "", ""));
    for p in &record.params {
        push_row(
            &mut out,
            &format!("{:<24} {:>12} {:>12}", truncate(&p.name, 24), fmt_num(p.value), fmt_num(p.stderr)),
        );
    }

    out.push_str("\nRt:\n");
    push_row(&mut out, &format!("{:<24} {:>12} {:>12}", "date", "value", "stderr"));
    push_row(&mut out, &format!("{:-<24} {:-<12} {:-<12}", "", "", ""));
    for rt in &record.rt {
        push_row(
            &mut out,
            &format!("{:<24} {:>12} {:>12}", rt.date.to_string(), fmt_num(rt.value), fmt_num(rt.stderr)),
        );
    }

    out.push_str("\nFit scores:\n");
    out.push_str(&format_score_table(&record.fit_scores, &record.fit_scores_flat));

    if let (Some(rows), Some(flat)) = (&record.test_scores, &record.test_scores_flat) {
        out.push_str("\nTest scores (walk-forward):\n");
        out.push_str(&format_score_table(rows, flat));
    }

    out
}

/// One line per dataset plus the aggregate line.
pub fn format_score_table(rows: &[ScoreRecord], flat: &ScoreRecord) -> String {
    let mut out = String::new();
    push_row(
        &mut out,
        &format!(
            "{:<16} {:>10} {:>12} {:>10} {:>10} {:>10} {:>10}",
            "dataset", "R2", "RMSE", "SMAPE", "MASE", "DW", "coverage"
        ),
    );
    push_row(
        &mut out,
        &format!(
            "{:-<16} {:-<10} {:-<12} {:-<10} {:-<10} {:-<10} {:-<10}",
            "", "", "", "", "", "", ""
        ),
    );
    for r in rows.iter().chain(std::iter::once(flat)) {
        push_row(
            &mut out,
            &format!(
                "{:<16} {:>10.4} {:>12} {:>10.4} {:>10.4} {:>10.4} {:>10.3}",
                truncate(&r.dataset, 16),
                r.r2,
                fmt_num(r.rmse),
                r.smape,
                r.mase,
                r.durbin_watson,
                r.prediction_interval
            ),
        );
    }
    out
}

/// Peaks and final values of a simulated trajectory.
pub fn format_simulation_summary(sim: &SimulationResult, region: &str) -> String {
    let mut out = String::new();
    let days = sim.days();
    let _ = writeln!(out, "=== epi - {} simulation: {} ===", sim.kind().display_name(), region);
    if days == 0 {
        out.push_str("No simulated days.\n");
        return out;
    }
    let _ = writeln!(
        out,
        "Days: {days} ({} .. {}) | outbreak shift: {}",
        sim.date_at(0),
        sim.date_at(days - 1),
        sim.outbreak_shift()
    );

    let peak = |series: &[f64]| -> (usize, f64) {
        series
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |best, (i, v)| if v > best.1 { (i, v) } else { best })
    };
    let rows = [
        ("active cases", sim.infectious_all()),
        ("critical (cared)", sim.critical_cared()),
        ("critical (over capacity)", sim.critical_over()),
    ];
    push_row(&mut out, &format!("{:<26} {:>12} {:>12}", "series", "peak", "peak date"));
    push_row(&mut out, &format!("{:-<26} {:-<12} {:-<12}", "", "", ""));
    for (label, series) in rows {
        let (i, v) = peak(&series);
        push_row(&mut out, &format!("{label:<26} {:>12} {:>12}", fmt_num(v), sim.date_at(i).to_string()));
    }

    let last = |series: Vec<f64>| series.last().copied().unwrap_or(0.0);
    let _ = writeln!(out, "Final recovered: {}", fmt_num(last(sim.recovered())));
    let _ = writeln!(out, "Final dead: {}", fmt_num(last(sim.dead())));
    out
}

fn push_row(out: &mut String, row: &str) {
    out.push_str(row.trim_end());
    out.push('\n');
}

fn fmt_num(v: f64) -> String {
    if !v.is_finite() {
        return format!("{v}");
    }
    if v != 0.0 && (v.abs() >= 1e6 || v.abs() < 1e-3) {
        format!("{v:.3e}")
    } else {
        format!("{v:.4}")
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::synthetic_region;
    use crate::domain::{ModelKind, ParamUpdate, RtUpdate, SanityMode};
    use crate::models::{CompartmentalModel, IntegrationLock, ParamSet};
    use crate::report::Scorer;
    use chrono::NaiveDate;

    fn record(with_test: bool) -> FitRecord {
        let data = vec![vec![1.0, 2.0, 3.0, 4.0], vec![2.0, 4.0, 6.0, 8.0]];
        let pred = vec![vec![1.1, 1.9, 3.2, 3.9], vec![2.0, 4.5, 5.5, 8.0]];
        let band = vec![vec![0.5; 4]; 2];
        let scorer = Scorer::new(data, pred, band.clone(), band, 2, vec![2.5, 5.0], vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let rows = scorer.records(&["dead", "recovered"]).unwrap();
        let flat = scorer.flat_record("all").unwrap();
        FitRecord {
            region: "north".to_string(),
            model: ModelKind::SeicrdRlc,
            outbreak_shift: 4,
            n_free_params: 2,
            params: vec![ParamUpdate {
                name: "infectious_rate".to_string(),
                value: 0.25,
                stderr: 0.01,
            }],
            rt: vec![RtUpdate {
                date: NaiveDate::from_ymd_opt(2020, 3, 1).unwrap(),
                value: 2.5,
                stderr: 0.2,
            }],
            fit_scores: rows.clone(),
            fit_scores_flat: flat.clone(),
            test_scores: with_test.then(|| rows.clone()),
            test_scores_flat: with_test.then(|| flat.clone()),
        }
    }

    #[test]
    fn fit_record_lists_params_rt_and_scores() {
        let text = format_fit_record(&record(false));
        assert!(text.contains("Free parameters: 2"));
        assert!(text.contains("infectious_rate"));
        assert!(text.contains("0.2500"));
        assert!(text.contains("2020-03-01"));
        assert!(text.contains("Fit scores:"));
        assert!(!text.contains("Test scores"));
        // one line per dataset plus the aggregate
        let score_lines = text.lines().filter(|l| l.starts_with("dead") || l.starts_with("recovered") || l.starts_with("all ")).count();
        assert_eq!(score_lines, 3);
        assert!(text.lines().all(|l| l == l.trim_end()));
    }

    #[test]
    fn test_scores_are_printed_when_present() {
        let text = format_fit_record(&record(true));
        assert!(text.contains("Test scores (walk-forward):"));
    }

    #[test]
    fn simulation_summary_names_peaks() {
        let region = synthetic_region("sim", 30, 1).unwrap();
        let model = CompartmentalModel::new(ModelKind::SeicrdRlc, &region, IntegrationLock::new());
        let params = ParamSet::initial(ModelKind::SeicrdRlc, &region).unwrap();
        let sim = model.simulate(&params, 40, 0, SanityMode::Clamp).unwrap();
        let text = format_simulation_summary(&sim, "sim");
        assert!(text.starts_with("=== epi - SEICRD-RLC simulation: sim ==="));
        assert!(text.contains("Days: 40 (2020-03-01 .. 2020-04-09)"));
        assert!(text.contains("critical (over capacity)"));
        assert!(text.contains("Final dead:"));
    }

    #[test]
    fn numbers_switch_to_scientific_notation() {
        assert_eq!(fmt_num(0.25), "0.2500");
        assert_eq!(fmt_num(0.0), "0.0000");
        assert_eq!(fmt_num(2.5e7), "2.500e7");
        assert_eq!(fmt_num(f64::NAN), "NaN");
        assert_eq!(truncate("critical_cared_long", 8), "critica.");
    }
}
