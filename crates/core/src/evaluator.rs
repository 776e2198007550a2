//! Experiment execution and fitness evaluation.
//!
//! A genome is run `trials` times under every regime through an external
//! workload executable. Failed, crashed, or timed-out trials become error
//! samples; they are counted, never dropped. Per-regime statistics feed the
//! two-level fitness calculation, the safety gate, and baseline tracking.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use spica_shared::model::{
    Baseline, CandidatePack, FitnessWeights, Genome, RegimeSpec, RegimeStats, SearchSpace,
    TrialResult, CANDIDATE_PACK_SCHEMA_VERSION, PRIMARY_METRIC,
};
use spica_shared::{SpicaEventData, SpicaId};

use crate::baseline::{deltas_against, BaselineTracker};
use crate::stats;

// ══════════════════════════════════════════════════════════════
// Workload abstraction
// ══════════════════════════════════════════════════════════════

/// One trial of a genome under a regime. Implementations run the real
/// workload; tests substitute scripted results.
#[async_trait]
pub trait Workload: Send + Sync {
    async fn run(&self, genome: &Genome, regime: &RegimeSpec) -> anyhow::Result<TrialResult>;
}

/// Runs the regime's configured executable as a child process. The genome's
/// parameters are passed as a JSON argument; the process prints a JSON object
/// of KPI name to value on stdout. Exit code 137 is counted as an OOM kill.
pub struct CommandWorkload {
    /// Directory regime workload paths are resolved against.
    pub workload_root: PathBuf,
}

#[async_trait]
impl Workload for CommandWorkload {
    async fn run(&self, genome: &Genome, regime: &RegimeSpec) -> anyhow::Result<TrialResult> {
        let program = self.workload_root.join(&regime.workload);
        let params_json = serde_json::to_string(&genome.parameters)?;
        let started = Instant::now();

        let output = tokio::process::Command::new(&program)
            .arg(&regime.name)
            .arg(&params_json)
            .kill_on_drop(true)
            .output()
            .await?;
        let wallclock_ms = started.elapsed().as_millis() as u64;

        if output.status.code() == Some(137) {
            let mut sample = TrialResult::error_sample(genome.id, &regime.name, wallclock_ms);
            sample.oom_count = 1;
            return Ok(sample);
        }
        if !output.status.success() {
            anyhow::bail!(
                "workload '{}' exited with {} for genome {}",
                regime.workload,
                output.status,
                genome.id
            );
        }

        let kpis: BTreeMap<String, f64> = serde_json::from_slice(&output.stdout)?;
        if !kpis.contains_key(PRIMARY_METRIC) {
            anyhow::bail!(
                "workload '{}' did not report the '{}' KPI",
                regime.workload,
                PRIMARY_METRIC
            );
        }
        let kpi_samples = kpis
            .into_iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| (k, vec![v]))
            .collect();
        Ok(TrialResult {
            genome_id: genome.id,
            regime: regime.name.clone(),
            kpi_samples,
            errors: 0,
            oom_count: 0,
            wallclock_ms,
        })
    }
}

// ══════════════════════════════════════════════════════════════
// Evaluator
// ══════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct EvaluatorConfig {
    pub weights: FitnessWeights,
    pub bootstrap_iterations: usize,
    pub max_parallel_experiments: usize,
    pub trial_timeout: Duration,
    /// Fixed bootstrap seed for reproducible tests; entropy in production.
    pub bootstrap_seed: Option<u64>,
}

pub struct FitnessEvaluator {
    space: SearchSpace,
    workload: Arc<dyn Workload>,
    baselines: Arc<BaselineTracker>,
    cfg: EvaluatorConfig,
    semaphore: Arc<Semaphore>,
}

impl FitnessEvaluator {
    pub fn new(
        space: SearchSpace,
        workload: Arc<dyn Workload>,
        baselines: Arc<BaselineTracker>,
        cfg: EvaluatorConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(cfg.max_parallel_experiments.max(1)));
        Self {
            space,
            workload,
            baselines,
            cfg,
            semaphore,
        }
    }

    /// Full evaluation of one genome: all regimes, all trials, statistics,
    /// baseline comparison, safety gate, sealed pack.
    pub async fn evaluate_genome(
        &self,
        run_id: SpicaId,
        genome: &Genome,
    ) -> anyhow::Result<(CandidatePack, Vec<SpicaEventData>)> {
        let mut events = Vec::new();
        let mut per_regime = Vec::with_capacity(self.space.regimes.len());
        for regime in &self.space.regimes {
            let trials = self.run_regime_trials(genome, regime, &mut events).await;
            let stats = self
                .regime_stats(genome, regime, &trials, &mut events)
                .await?;
            per_regime.push(stats);
        }

        let dimensions = stats::fitness_vector_from_regimes(&per_regime);
        let caps = &self.space.caps;
        let gate_violation = dimensions.drawdown > caps.max_drawdown
            || dimensions.risk > caps.max_risk
            || per_regime.iter().any(|r| r.infeasible);
        let feasible = !gate_violation;
        let aggregate_score = if feasible {
            dimensions.weighted_sum(&self.cfg.weights)
        } else {
            f64::NEG_INFINITY
        };

        if !feasible {
            debug!(
                genome_id = %genome.id,
                drawdown = dimensions.drawdown,
                risk = dimensions.risk,
                "Genome failed the safety gate"
            );
        }

        let mut pack = CandidatePack {
            schema_version: CANDIDATE_PACK_SCHEMA_VERSION,
            run_id,
            genome: genome.clone(),
            per_regime,
            dimensions,
            aggregate_score,
            feasible,
            created_at: Utc::now(),
            content_hash: String::new(),
        };
        pack.seal()?;
        Ok((pack, events))
    }

    /// A pack for a genome whose evaluation never completed (cycle budget
    /// exhausted). Every regime is an error sample; the pack is infeasible.
    pub fn failure_pack(&self, run_id: SpicaId, genome: &Genome, reason: &str) -> anyhow::Result<CandidatePack> {
        let per_regime = self
            .space
            .regimes
            .iter()
            .map(|regime| RegimeStats {
                regime: regime.name.clone(),
                trial_count: 0,
                kpi_means: BTreeMap::new(),
                ci95: BTreeMap::new(),
                baseline_ref: None,
                deltas: BTreeMap::new(),
                error_rate: 1.0,
                oom_count: 0,
                infeasible: true,
            })
            .collect();
        warn!(genome_id = %genome.id, reason = %reason, "Synthesizing failure pack");
        let mut pack = CandidatePack {
            schema_version: CANDIDATE_PACK_SCHEMA_VERSION,
            run_id,
            genome: genome.clone(),
            per_regime,
            dimensions: spica_shared::model::FitnessVector::default(),
            aggregate_score: f64::NEG_INFINITY,
            feasible: false,
            created_at: Utc::now(),
            content_hash: String::new(),
        };
        pack.seal()?;
        Ok(pack)
    }

    async fn run_regime_trials(
        &self,
        genome: &Genome,
        regime: &RegimeSpec,
        events: &mut Vec<SpicaEventData>,
    ) -> Vec<TrialResult> {
        let mut pending: FuturesUnordered<_> = (0..regime.trials)
            .map(|_| self.run_one_trial(genome, regime))
            .collect();
        let mut trials = Vec::with_capacity(regime.trials as usize);
        while let Some((trial, failure)) = pending.next().await {
            if let Some(reason) = failure {
                events.push(SpicaEventData::EvaluationFailed {
                    genome_id: genome.id,
                    regime: regime.name.clone(),
                    reason,
                });
            }
            trials.push(trial);
        }
        trials
    }

    /// One trial under the concurrency cap. Never returns an error; failures
    /// collapse into an error sample plus the failure reason.
    async fn run_one_trial(
        &self,
        genome: &Genome,
        regime: &RegimeSpec,
    ) -> (TrialResult, Option<String>) {
        let _permit = match self.semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                return (
                    TrialResult::error_sample(genome.id, &regime.name, 0),
                    Some("experiment semaphore closed".to_string()),
                )
            }
        };
        let started = Instant::now();
        match tokio::time::timeout(self.cfg.trial_timeout, self.workload.run(genome, regime)).await
        {
            Ok(Ok(trial)) => (trial, None),
            Ok(Err(e)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                (
                    TrialResult::error_sample(genome.id, &regime.name, elapsed),
                    Some(e.to_string()),
                )
            }
            Err(_) => {
                let timeout_ms = self.cfg.trial_timeout.as_millis() as u64;
                (
                    TrialResult::error_sample(genome.id, &regime.name, timeout_ms),
                    Some(format!("trial timed out after {timeout_ms}ms")),
                )
            }
        }
    }

    /// Derive one regime's statistics and reconcile it against the baseline.
    async fn regime_stats(
        &self,
        genome: &Genome,
        regime: &RegimeSpec,
        trials: &[TrialResult],
        events: &mut Vec<SpicaEventData>,
    ) -> anyhow::Result<RegimeStats> {
        let trial_count = trials.len() as u32;
        let errors: u32 = trials.iter().map(|t| t.errors).sum();
        let oom_count: u32 = trials.iter().map(|t| t.oom_count).sum();
        let error_rate = if trial_count == 0 {
            1.0
        } else {
            f64::from(errors + oom_count) / f64::from(trial_count)
        };

        let mut samples: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        for trial in trials {
            for (kpi, values) in &trial.kpi_samples {
                samples.entry(kpi.clone()).or_default().extend(values);
            }
        }
        let kpi_means: BTreeMap<String, f64> = samples
            .iter()
            .map(|(kpi, values)| (kpi.clone(), stats::mean(values)))
            .collect();
        let ci95: BTreeMap<String, (f64, f64)> = samples
            .iter()
            .map(|(kpi, values)| {
                (
                    kpi.clone(),
                    stats::bootstrap_ci95(
                        values,
                        self.cfg.bootstrap_iterations,
                        self.cfg.bootstrap_seed,
                    ),
                )
            })
            .collect();

        let caps = &self.space.caps;
        let infeasible = error_rate > caps.max_error_rate || oom_count > caps.max_oom_count;

        let (baseline_ref, deltas) = if infeasible || kpi_means.is_empty() {
            // A failed regime never establishes or moves a baseline.
            (None, BTreeMap::new())
        } else {
            self.reconcile_baseline(genome, regime, &kpi_means, &ci95, events)
                .await?
        };

        Ok(RegimeStats {
            regime: regime.name.clone(),
            trial_count,
            kpi_means,
            ci95,
            baseline_ref,
            deltas,
            error_rate,
            oom_count,
            infeasible,
        })
    }

    /// Baseline protocol for one regime: first success establishes, later
    /// successes report deltas, and a statistically confirmed improvement on
    /// the primary metric (candidate CI low above the baseline mean)
    /// supersedes the baseline.
    async fn reconcile_baseline(
        &self,
        genome: &Genome,
        regime: &RegimeSpec,
        kpi_means: &BTreeMap<String, f64>,
        ci95: &BTreeMap<String, (f64, f64)>,
        events: &mut Vec<SpicaEventData>,
    ) -> anyhow::Result<(Option<SpicaId>, BTreeMap<String, f64>)> {
        let domain = &self.space.domain;
        match self.baselines.current(domain, &regime.name).await? {
            None => {
                let baseline = self
                    .baselines
                    .establish(domain, &regime.name, kpi_means.clone(), genome.id)
                    .await?;
                events.push(SpicaEventData::BaselineEstablished {
                    domain: domain.clone(),
                    regime: regime.name.clone(),
                    baseline_id: baseline.baseline_id,
                });
                // Deltas against a freshly established baseline are zero.
                let deltas = deltas_against(&baseline, kpi_means);
                Ok((Some(baseline.baseline_id), deltas))
            }
            Some(baseline) => {
                let deltas = deltas_against(&baseline, kpi_means);
                let baseline_mean = baseline.metric_means.get(PRIMARY_METRIC).copied();
                let candidate_low = ci95.get(PRIMARY_METRIC).map(|(lo, _)| *lo);
                if let (Some(reference), Some(low)) = (baseline_mean, candidate_low) {
                    if low > reference {
                        let promoted = Baseline {
                            baseline_id: SpicaId::new(),
                            domain: domain.clone(),
                            regime: regime.name.clone(),
                            metric_means: kpi_means.clone(),
                            established_at: Utc::now(),
                            source_genome_id: genome.id,
                        };
                        self.baselines.promote(promoted.clone()).await?;
                        info!(
                            domain = %domain,
                            regime = %regime.name,
                            genome_id = %genome.id,
                            ci_low = low,
                            baseline_mean = reference,
                            "📈 Candidate confirmed above baseline"
                        );
                        events.push(SpicaEventData::BaselinePromoted {
                            domain: domain.clone(),
                            regime: regime.name.clone(),
                            baseline_id: promoted.baseline_id,
                        });
                        return Ok((Some(promoted.baseline_id), deltas));
                    }
                }
                Ok((Some(baseline.baseline_id), deltas))
            }
        }
    }
}
