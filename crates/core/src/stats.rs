//! Statistics engine: bootstrap confidence intervals and composite scoring.
//! Pure functions; everything seedable for reproducible tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use spica_shared::model::{FitnessVector, RegimeStats};

/// Fixed first-level composite weights: performance rewarded, p95 latency and
/// power penalized. Workloads report KPIs normalized to [0, 1].
const LATENCY_PENALTY: f64 = 0.3;
const POWER_PENALTY: f64 = 0.2;

#[must_use]
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// 95% bootstrap confidence interval of the mean.
///
/// With fewer than 2 samples the interval degenerates to `[mean, mean]`.
/// A seed makes the resampling deterministic.
#[must_use]
pub fn bootstrap_ci95(samples: &[f64], iterations: usize, seed: Option<u64>) -> (f64, f64) {
    let m = mean(samples);
    if samples.len() < 2 {
        return (m, m);
    }

    let mut rng = match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    };

    let mut means = Vec::with_capacity(iterations);
    for _ in 0..iterations {
        let mut acc = 0.0;
        for _ in 0..samples.len() {
            acc += samples[rng.gen_range(0..samples.len())];
        }
        means.push(acc / samples.len() as f64);
    }
    means.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    (percentile_sorted(&means, 2.5), percentile_sorted(&means, 97.5))
}

/// Nearest-rank percentile over a pre-sorted slice.
#[must_use]
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

/// First-level composite for one regime's KPI means. Missing KPIs contribute
/// nothing (the workload contract makes `performance` mandatory).
#[must_use]
pub fn regime_composite(kpi_means: &BTreeMap<String, f64>) -> f64 {
    let get = |k: &str| kpi_means.get(k).copied().unwrap_or(0.0);
    get("performance") - LATENCY_PENALTY * get("latency_p95") - POWER_PENALTY * get("power")
}

/// Fold per-regime statistics into the six fitness dimensions.
///
/// - performance: mean regime composite
/// - stability: mean reported stability, else 1 − spread of the composites
/// - drawdown / risk: worst regime (ceilings gate on the worst case)
/// - turnover / correlation: mean across regimes
#[must_use]
pub fn fitness_vector_from_regimes(regimes: &[RegimeStats]) -> FitnessVector {
    if regimes.is_empty() {
        return FitnessVector::default();
    }

    let composites: Vec<f64> = regimes.iter().map(|r| regime_composite(&r.kpi_means)).collect();
    let performance = mean(&composites).clamp(0.0, 1.0);

    let kpi = |name: &str| -> Vec<f64> {
        regimes
            .iter()
            .filter_map(|r| r.kpi_means.get(name).copied())
            .collect()
    };
    let worst = |samples: &[f64]| samples.iter().copied().fold(0.0, f64::max);

    let reported_stability = kpi("stability");
    let stability = if reported_stability.is_empty() {
        let spread = composites
            .iter()
            .map(|c| (c - performance).abs())
            .fold(0.0, f64::max);
        (1.0 - spread).clamp(0.0, 1.0)
    } else {
        mean(&reported_stability).clamp(0.0, 1.0)
    };

    FitnessVector {
        performance,
        stability,
        drawdown: worst(&kpi("drawdown")),
        turnover: mean(&kpi("turnover")),
        correlation: mean(&kpi("correlation")),
        risk: worst(&kpi("risk")),
    }
}
