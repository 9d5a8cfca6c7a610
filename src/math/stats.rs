//! Descriptive statistics and the hypothesis tests behind the score table.
//!
//! Every test returns its p-value only. Degenerate inputs (too few points,
//! zero variance) give `NaN` rather than an error so one bad row does not
//! sink a whole score table.

use std::f64::consts::PI;

use statrs::distribution::{ContinuousCDF, FisherSnedecor, Normal, StudentsT};

pub fn mean(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    x.iter().sum::<f64>() / x.len() as f64
}

pub fn median(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    let mut v = x.to_vec();
    v.sort_by(f64::total_cmp);
    let mid = v.len() / 2;
    if v.len() % 2 == 0 {
        (v[mid - 1] + v[mid]) / 2.0
    } else {
        v[mid]
    }
}

/// Population variance (`ddof = 0`).
pub fn variance(x: &[f64]) -> f64 {
    let m = mean(x);
    x.iter().map(|v| (v - m).powi(2)).sum::<f64>() / x.len() as f64
}

fn standard_normal() -> Option<Normal> {
    Normal::new(0.0, 1.0).ok()
}

pub fn normal_cdf(z: f64) -> f64 {
    standard_normal().map_or(f64::NAN, |n| n.cdf(z))
}

pub fn normal_sf(z: f64) -> f64 {
    standard_normal().map_or(f64::NAN, |n| n.sf(z))
}

pub fn normal_ppf(p: f64) -> f64 {
    standard_normal().map_or(f64::NAN, |n| n.inverse_cdf(p))
}

/// Two-sided Student-t quantile used for uncertainty bands: the `t` value
/// that covers the same probability as `sigma` standard normal deviations.
pub fn t_scale_for_sigma(sigma: f64, dof: usize) -> f64 {
    let prob = normal_cdf(sigma);
    match StudentsT::new(0.0, 1.0, dof.max(1) as f64) {
        Ok(t) => t.inverse_cdf(prob),
        Err(_) => f64::NAN,
    }
}

/// Shapiro–Wilk normality test (Royston's approximation, `3 <= n <= 5000`).
pub fn shapiro_wilk(x: &[f64]) -> f64 {
    let n = x.len();
    if n < 3 {
        return f64::NAN;
    }
    let mut sorted = x.to_vec();
    sorted.sort_by(f64::total_cmp);
    let range = sorted[n - 1] - sorted[0];
    if range <= 0.0 || !range.is_finite() {
        return 1.0;
    }

    let nf = n as f64;
    let mut a = vec![0.0; n];
    if n == 3 {
        a[0] = -0.5f64.sqrt();
        a[2] = 0.5f64.sqrt();
    } else {
        let m: Vec<f64> = (1..=n)
            .map(|i| normal_ppf((i as f64 - 0.375) / (nf + 0.25)))
            .collect();
        let mm: f64 = m.iter().map(|v| v * v).sum();
        let u = 1.0 / nf.sqrt();
        let poly = |c: [f64; 6]| c[0] + u * (c[1] + u * (c[2] + u * (c[3] + u * (c[4] + u * c[5]))));
        let an = poly([m[n - 1] / mm.sqrt(), 0.221157, -0.147981, -2.071190, 4.434685, -2.706056]);
        if n > 5 {
            let an1 = poly([m[n - 2] / mm.sqrt(), 0.042981, -0.293762, -1.752461, 5.682633, -3.582633]);
            let phi = (mm - 2.0 * m[n - 1].powi(2) - 2.0 * m[n - 2].powi(2))
                / (1.0 - 2.0 * an.powi(2) - 2.0 * an1.powi(2));
            for i in 2..n - 2 {
                a[i] = m[i] / phi.sqrt();
            }
            a[n - 2] = an1;
            a[1] = -an1;
        } else {
            let phi = (mm - 2.0 * m[n - 1].powi(2)) / (1.0 - 2.0 * an.powi(2));
            for i in 1..n - 1 {
                a[i] = m[i] / phi.sqrt();
            }
        }
        a[n - 1] = an;
        a[0] = -an;
    }

    let xm = mean(&sorted);
    let ssq: f64 = sorted.iter().map(|v| (v - xm).powi(2)).sum();
    let num: f64 = a.iter().zip(&sorted).map(|(a, v)| a * v).sum();
    let w = (num * num / ssq).min(1.0);
    if w >= 1.0 {
        return 1.0;
    }

    if n == 3 {
        let p = 6.0 / PI * (w.sqrt().asin() - 0.75f64.sqrt().asin());
        return p.clamp(0.0, 1.0);
    }

    let z = if n <= 11 {
        let gamma = -2.273 + 0.459 * nf;
        let y = -(1.0 - w).ln();
        if y >= gamma {
            return 0.0;
        }
        let mu = 0.5440 - 0.39978 * nf + 0.025054 * nf.powi(2) - 0.0006714 * nf.powi(3);
        let sigma = (1.3822 - 0.77857 * nf + 0.062767 * nf.powi(2) - 0.0020322 * nf.powi(3)).exp();
        (-(gamma - y).ln() - mu) / sigma
    } else {
        let ln_n = nf.ln();
        let mu = -1.5861 - 0.31082 * ln_n - 0.083751 * ln_n.powi(2) + 0.0038915 * ln_n.powi(3);
        let sigma = (-0.4803 - 0.082676 * ln_n + 0.0030302 * ln_n.powi(2)).exp();
        ((1.0 - w).ln() - mu) / sigma
    };
    normal_sf(z)
}

/// Wald–Wolfowitz runs test around `cutoff` (values `>= cutoff` count as
/// one group), normal approximation without continuity correction.
pub fn runs_test(x: &[f64], cutoff: f64) -> f64 {
    let above: Vec<bool> = x.iter().map(|v| *v >= cutoff).collect();
    let n1 = above.iter().filter(|b| **b).count() as f64;
    let n2 = above.len() as f64 - n1;
    let n = n1 + n2;
    if n < 2.0 {
        return f64::NAN;
    }
    let runs = 1.0 + above.windows(2).filter(|w| w[0] != w[1]).count() as f64;
    let expected = 2.0 * n1 * n2 / n + 1.0;
    let var = 2.0 * n1 * n2 * (2.0 * n1 * n2 - n) / (n * n * (n - 1.0));
    if var <= 0.0 {
        return f64::NAN;
    }
    let z = (runs - expected) / var.sqrt();
    2.0 * normal_sf(z.abs())
}

/// Two-sided p-value of Pearson's correlation between `x` and `y`.
pub fn pearson_p(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 3 {
        return f64::NAN;
    }
    let (mx, my) = (mean(&x[..n]), mean(&y[..n]));
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    let mut syy = 0.0;
    for (a, b) in x.iter().zip(y) {
        sxy += (a - mx) * (b - my);
        sxx += (a - mx).powi(2);
        syy += (b - my).powi(2);
    }
    if sxx == 0.0 || syy == 0.0 {
        return f64::NAN;
    }
    let r = (sxy / (sxx * syy).sqrt()).clamp(-1.0, 1.0);
    if r.abs() >= 1.0 {
        return 0.0;
    }
    let dof = (n - 2) as f64;
    let t = r * (dof / (1.0 - r * r)).sqrt();
    match StudentsT::new(0.0, 1.0, dof) {
        Ok(dist) => 2.0 * dist.sf(t.abs()),
        Err(_) => f64::NAN,
    }
}

/// One-way ANOVA p-value across `groups`.
pub fn anova_p(groups: &[&[f64]]) -> f64 {
    let k = groups.len();
    let total: usize = groups.iter().map(|g| g.len()).sum();
    if k < 2 || total <= k || groups.iter().any(|g| g.is_empty()) {
        return f64::NAN;
    }
    let grand = groups.iter().flat_map(|g| g.iter()).sum::<f64>() / total as f64;
    let mut ss_between = 0.0;
    let mut ss_within = 0.0;
    for g in groups {
        let gm = mean(g);
        ss_between += g.len() as f64 * (gm - grand).powi(2);
        ss_within += g.iter().map(|v| (v - gm).powi(2)).sum::<f64>();
    }
    let df_between = (k - 1) as f64;
    let df_within = (total - k) as f64;
    if ss_within == 0.0 {
        return if ss_between == 0.0 { f64::NAN } else { 0.0 };
    }
    let f = (ss_between / df_between) / (ss_within / df_within);
    match FisherSnedecor::new(df_between, df_within) {
        Ok(dist) => dist.sf(f),
        Err(_) => f64::NAN,
    }
}

/// Survival function of the Kolmogorov distribution.
pub fn kolmogorov_sf(lambda: f64) -> f64 {
    if lambda <= 0.0 {
        return 1.0;
    }
    if lambda < 1.18 {
        // Small-lambda series converges fast here.
        let c = -PI * PI / (8.0 * lambda * lambda);
        let s: f64 = (1..=8)
            .map(|j| {
                let k = (2 * j - 1) as f64;
                (c * k * k).exp()
            })
            .sum();
        (1.0 - (2.0 * PI).sqrt() / lambda * s).clamp(0.0, 1.0)
    } else {
        let s: f64 = (1..=100)
            .map(|j| {
                let j = j as f64;
                let sign = if j as i64 % 2 == 1 { 1.0 } else { -1.0 };
                sign * (-2.0 * j * j * lambda * lambda).exp()
            })
            .sum();
        (2.0 * s).clamp(0.0, 1.0)
    }
}

/// Two-sample Kolmogorov–Smirnov p-value (asymptotic).
pub fn ks_two_sample_p(a: &[f64], b: &[f64]) -> f64 {
    if a.is_empty() || b.is_empty() {
        return f64::NAN;
    }
    let mut a = a.to_vec();
    let mut b = b.to_vec();
    a.sort_by(f64::total_cmp);
    b.sort_by(f64::total_cmp);
    let (n1, n2) = (a.len() as f64, b.len() as f64);

    let (mut i, mut j) = (0usize, 0usize);
    let mut d: f64 = 0.0;
    while i < a.len() && j < b.len() {
        let v = a[i].min(b[j]);
        while i < a.len() && a[i] <= v {
            i += 1;
        }
        while j < b.len() && b[j] <= v {
            j += 1;
        }
        d = d.max((i as f64 / n1 - j as f64 / n2).abs());
    }
    let en = (n1 * n2 / (n1 + n2)).sqrt();
    kolmogorov_sf((en + 0.12 + 0.11 / en) * d)
}

/// One-sample Kolmogorov–Smirnov p-value against the standard normal.
pub fn ks_normal_p(x: &[f64]) -> f64 {
    if x.is_empty() {
        return f64::NAN;
    }
    let mut v = x.to_vec();
    v.sort_by(f64::total_cmp);
    let n = v.len() as f64;
    let d = v
        .iter()
        .enumerate()
        .map(|(i, x)| {
            let cdf = normal_cdf(*x);
            ((i + 1) as f64 / n - cdf).max(cdf - i as f64 / n)
        })
        .fold(0.0, f64::max);
    let en = n.sqrt();
    kolmogorov_sf((en + 0.12 + 0.11 / en) * d)
}

/// Durbin–Watson statistic of a residual series.
pub fn durbin_watson(residual: &[f64]) -> f64 {
    let ssr: f64 = residual.iter().map(|r| r * r).sum();
    let diff: f64 = residual.windows(2).map(|w| (w[1] - w[0]).powi(2)).sum();
    diff / ssr
}
