//! Plain data model for the optimizer: genomes, trial results, candidate
//! packs, baselines, instances, tournaments, promotions.
//!
//! Everything hashed or signed uses `BTreeMap` so the canonical JSON form is
//! stable across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::SpicaId;

pub const CANDIDATE_PACK_SCHEMA_VERSION: u32 = 1;

/// The KPI every baseline comparison and promotion decision keys on.
/// Workload scripts must emit it; everything else is domain-specific.
pub const PRIMARY_METRIC: &str = "performance";

// ══════════════════════════════════════════════════════════════
// Search space
// ══════════════════════════════════════════════════════════════

/// A single tunable parameter value. Tagged so loosely-typed parameter maps
/// stay schema-checkable at genome construction time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum ParamValue {
    Numeric(f64),
    Categorical(String),
}

/// Declared shape of one parameter in the search space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParamSpec {
    Numeric { min: f64, max: f64 },
    Categorical { choices: Vec<String> },
}

/// A named workload profile a genome is tested under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeSpec {
    pub name: String,
    /// Path (or registered name) of the external workload executable.
    pub workload: String,
    pub trials: u32,
}

/// Hard safety ceilings. Violating `max_drawdown` or `max_risk` forces a
/// genome infeasible regardless of every other dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyCaps {
    pub max_error_rate: f64,
    pub max_oom_count: u32,
    pub max_drawdown: f64,
    pub max_risk: f64,
}

impl Default for SafetyCaps {
    fn default() -> Self {
        Self {
            max_error_rate: 0.25,
            max_oom_count: 2,
            max_drawdown: 0.6,
            max_risk: 0.8,
        }
    }
}

/// Declarative per-domain search-space configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchSpace {
    pub domain: String,
    pub parameters: BTreeMap<String, ParamSpec>,
    pub regimes: Vec<RegimeSpec>,
    #[serde(default)]
    pub caps: SafetyCaps,
}

impl SearchSpace {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.domain.is_empty() {
            anyhow::bail!("search space domain must not be empty");
        }
        if self.parameters.is_empty() {
            anyhow::bail!("search space '{}' declares no parameters", self.domain);
        }
        for (name, spec) in &self.parameters {
            match spec {
                ParamSpec::Numeric { min, max } => {
                    if !min.is_finite() || !max.is_finite() || min >= max {
                        anyhow::bail!(
                            "parameter '{}' has invalid bounds [{}, {}]",
                            name,
                            min,
                            max
                        );
                    }
                }
                ParamSpec::Categorical { choices } => {
                    if choices.is_empty() {
                        anyhow::bail!("parameter '{}' has an empty choice set", name);
                    }
                }
            }
        }
        if self.regimes.is_empty() {
            anyhow::bail!("search space '{}' declares no regimes", self.domain);
        }
        for regime in &self.regimes {
            if regime.trials == 0 {
                anyhow::bail!("regime '{}' must run at least one trial", regime.name);
            }
        }
        for (name, val) in [
            ("max_error_rate", self.caps.max_error_rate),
            ("max_drawdown", self.caps.max_drawdown),
            ("max_risk", self.caps.max_risk),
        ] {
            if !val.is_finite() || !(0.0..=1.0).contains(&val) {
                anyhow::bail!("safety cap {} must be in [0.0, 1.0], got {}", name, val);
            }
        }
        Ok(())
    }

    /// Schema check at genome construction time, not at use time: every
    /// declared parameter present, no extras, numerics in bounds,
    /// categoricals drawn from the allowed set.
    pub fn validate_genome(&self, genome: &Genome) -> anyhow::Result<()> {
        for name in genome.parameters.keys() {
            if !self.parameters.contains_key(name) {
                anyhow::bail!("genome {} carries undeclared parameter '{}'", genome.id, name);
            }
        }
        for (name, spec) in &self.parameters {
            let Some(value) = genome.parameters.get(name) else {
                anyhow::bail!("genome {} is missing parameter '{}'", genome.id, name);
            };
            match (spec, value) {
                (ParamSpec::Numeric { min, max }, ParamValue::Numeric(v)) => {
                    if !v.is_finite() || v < min || v > max {
                        anyhow::bail!(
                            "parameter '{}' = {} outside bounds [{}, {}]",
                            name,
                            v,
                            min,
                            max
                        );
                    }
                }
                (ParamSpec::Categorical { choices }, ParamValue::Categorical(v)) => {
                    if !choices.contains(v) {
                        anyhow::bail!("parameter '{}' = '{}' not in allowed set", name, v);
                    }
                }
                _ => anyhow::bail!("parameter '{}' has the wrong value kind", name),
            }
        }
        Ok(())
    }
}

// ══════════════════════════════════════════════════════════════
// Genome & trials
// ══════════════════════════════════════════════════════════════

/// One candidate parameter set. Immutable once created; crossover and
/// mutation always mint a new genome with fresh id and recorded parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Genome {
    pub id: SpicaId,
    pub generation: u64,
    /// 0 parents: seeded. 1 parent: mutation-only. 2 parents: crossover.
    pub parent_ids: Vec<SpicaId>,
    pub parameters: BTreeMap<String, ParamValue>,
}

/// One execution of a genome under one regime. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub genome_id: SpicaId,
    pub regime: String,
    pub kpi_samples: BTreeMap<String, Vec<f64>>,
    pub errors: u32,
    pub oom_count: u32,
    pub wallclock_ms: u64,
}

impl TrialResult {
    /// An error sample: a crashed, cancelled, or timed-out trial. Carries no
    /// KPIs but is counted, never silently dropped.
    #[must_use]
    pub fn error_sample(genome_id: SpicaId, regime: &str, wallclock_ms: u64) -> Self {
        Self {
            genome_id,
            regime: regime.to_string(),
            kpi_samples: BTreeMap::new(),
            errors: 1,
            oom_count: 0,
            wallclock_ms,
        }
    }
}

// ══════════════════════════════════════════════════════════════
// Fitness dimensions
// ══════════════════════════════════════════════════════════════

/// The six fitness dimensions a candidate is scored on. Performance and
/// stability are reward dimensions; drawdown, turnover, correlation and risk
/// are cost dimensions (lower is better).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitnessVector {
    pub performance: f64,
    pub stability: f64,
    pub drawdown: f64,
    pub turnover: f64,
    pub correlation: f64,
    pub risk: f64,
}

impl FitnessVector {
    /// Weighted sum across dimensions. Cost dimensions enter inverted so a
    /// higher score is always better.
    #[must_use]
    pub fn weighted_sum(&self, w: &FitnessWeights) -> f64 {
        let sum = w.performance * self.performance
            + w.stability * self.stability
            + w.drawdown * (1.0 - self.drawdown)
            + w.turnover * (1.0 - self.turnover)
            + w.correlation * (1.0 - self.correlation)
            + w.risk * (1.0 - self.risk);
        sum.clamp(0.0, 1.0)
    }

    /// Behavior descriptor for the novelty archive: the raw dimension values.
    #[must_use]
    pub fn descriptor(&self) -> Vec<f64> {
        vec![
            self.performance,
            self.stability,
            self.drawdown,
            self.turnover,
            self.correlation,
            self.risk,
        ]
    }
}

/// Per-dimension weights for the second-level fitness sum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitnessWeights {
    pub performance: f64,
    pub stability: f64,
    pub drawdown: f64,
    pub turnover: f64,
    pub correlation: f64,
    pub risk: f64,
}

impl FitnessWeights {
    pub fn validate(&self) -> anyhow::Result<()> {
        let fields = [
            ("performance", self.performance),
            ("stability", self.stability),
            ("drawdown", self.drawdown),
            ("turnover", self.turnover),
            ("correlation", self.correlation),
            ("risk", self.risk),
        ];
        for (name, val) in fields {
            if !val.is_finite() || val < 0.0 {
                anyhow::bail!("{} weight must be >= 0 and finite, got {}", name, val);
            }
        }
        let sum: f64 = fields.iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > 0.01 {
            anyhow::bail!("weights must sum to ~1.0, got {:.4}", sum);
        }
        Ok(())
    }
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            performance: 0.40,
            stability: 0.20,
            drawdown: 0.15,
            turnover: 0.10,
            correlation: 0.10,
            risk: 0.05,
        }
    }
}

// ══════════════════════════════════════════════════════════════
// Candidate pack
// ══════════════════════════════════════════════════════════════

/// Derived statistics for one regime inside a candidate pack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeStats {
    pub regime: String,
    pub trial_count: u32,
    pub kpi_means: BTreeMap<String, f64>,
    pub ci95: BTreeMap<String, (f64, f64)>,
    pub baseline_ref: Option<SpicaId>,
    pub deltas: BTreeMap<String, f64>,
    pub error_rate: f64,
    pub oom_count: u32,
    /// Regime-level gate: error/OOM rate over the configured ceiling.
    pub infeasible: bool,
}

/// JSON has no -inf, so the aggregate score of an infeasible pack serializes
/// as null and reads back as f64::NEG_INFINITY.
mod score_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() {
            serializer.serialize_f64(*v)
        } else {
            serializer.serialize_none()
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NEG_INFINITY))
    }
}

/// The immutable, hash-verified record of one genome's full evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePack {
    pub schema_version: u32,
    pub run_id: SpicaId,
    pub genome: Genome,
    pub per_regime: Vec<RegimeStats>,
    pub dimensions: FitnessVector,
    #[serde(with = "score_serde")]
    pub aggregate_score: f64,
    pub feasible: bool,
    pub created_at: DateTime<Utc>,
    /// SHA-256 (base64) over the canonical serialization with this field
    /// empty. Must match on read; a mismatch rejects the artifact.
    pub content_hash: String,
}

impl CandidatePack {
    /// Canonical hash input: the pack with `content_hash` cleared.
    pub fn compute_content_hash(&self) -> anyhow::Result<String> {
        let mut stripped = self.clone();
        stripped.content_hash = String::new();
        let bytes = serde_json::to_vec(&stripped)?;
        Ok(crate::sign::content_hash_b64(&bytes))
    }

    pub fn seal(&mut self) -> anyhow::Result<()> {
        self.content_hash = self.compute_content_hash()?;
        Ok(())
    }

    pub fn verify_content_hash(&self) -> anyhow::Result<bool> {
        Ok(self.compute_content_hash()? == self.content_hash)
    }
}

// ══════════════════════════════════════════════════════════════
// Baseline
// ══════════════════════════════════════════════════════════════

/// Reference metrics for one (domain, regime). Exactly one current baseline
/// per pair; superseded atomically on a statistically confirmed improvement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Baseline {
    pub baseline_id: SpicaId,
    pub domain: String,
    pub regime: String,
    pub metric_means: BTreeMap<String, f64>,
    pub established_at: DateTime<Utc>,
    pub source_genome_id: SpicaId,
}

// ══════════════════════════════════════════════════════════════
// Novelty
// ══════════════════════════════════════════════════════════════

/// Lives only inside the bounded novelty archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoveltyRecord {
    pub genome_id: SpicaId,
    pub behavior_descriptor: Vec<f64>,
    pub novelty_score: f64,
    /// Aggregate fitness at insertion time, for Pareto admission.
    pub fitness: f64,
    pub inserted_at: DateTime<Utc>,
}

// ══════════════════════════════════════════════════════════════
// Instances & lineage
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    Spawned,
    Retained,
    Pruned,
}

/// One append-only link in an instance's lineage chain. The HMAC covers
/// `(parent_hash, entry_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageEntry {
    /// `entry_hash` of the previous link, empty for the root entry.
    pub parent_hash: String,
    /// Manifest content hash this entry attests to.
    pub entry_hash: String,
    pub hmac_signature: String,
    pub timestamp: DateTime<Utc>,
}

/// A standardized test instance with tamper-evident configuration history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpicaInstance {
    pub instance_id: SpicaId,
    pub manifest_hash: String,
    pub config_snapshot: serde_json::Value,
    pub lineage_chain: Vec<LineageEntry>,
    /// Relative path of the append-only telemetry JSONL for this instance.
    pub telemetry_ref: String,
    pub state: InstanceState,
    pub created_at: DateTime<Utc>,
}

// ══════════════════════════════════════════════════════════════
// Tournament & promotion
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TournamentResult {
    pub tournament_id: SpicaId,
    pub participants: Vec<SpicaId>,
    /// None — the tournament was void (empty or all-infeasible cohort).
    pub winner_id: Option<SpicaId>,
    pub scores: BTreeMap<SpicaId, f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Pending,
    Acked,
    RolledBack,
}

/// The signed artifact representing a tournament winner destined for
/// deployment. Written once; `ack_status` is the only mutable field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromotionBundle {
    pub tournament_id: SpicaId,
    pub winner_id: SpicaId,
    pub winner_config: serde_json::Value,
    pub hmac_signature: String,
    pub created_at: DateTime<Utc>,
    pub ack_status: AckStatus,
}

// ══════════════════════════════════════════════════════════════
// Population
// ══════════════════════════════════════════════════════════════

/// Ordered set of exactly `population_size` genomes for one generation.
/// Owned exclusively by the evolver; replaced wholesale each generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Population {
    pub generation: u64,
    pub genomes: Vec<Genome>,
}

impl Population {
    #[must_use]
    pub fn len(&self) -> usize {
        self.genomes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.genomes.is_empty()
    }
}

// ══════════════════════════════════════════════════════════════
// Batch evaluator report
// ══════════════════════════════════════════════════════════════

/// One (domain, regime) block of the nightly batch evaluator's report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRegimeReport {
    pub domain: String,
    pub regime: String,
    pub kpi_means: BTreeMap<String, f64>,
    pub sample_count: u64,
    #[serde(default)]
    pub source_genome_id: Option<SpicaId>,
}

/// Structured report consumed during `Resuming`. A missing or unparseable
/// report degrades ingestion but never blocks the resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub schema_version: u32,
    pub completed_at: DateTime<Utc>,
    pub regimes: Vec<BatchRegimeReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> SearchSpace {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "batch_size".to_string(),
            ParamSpec::Numeric { min: 1.0, max: 64.0 },
        );
        parameters.insert(
            "strategy".to_string(),
            ParamSpec::Categorical {
                choices: vec!["eager".into(), "lazy".into()],
            },
        );
        SearchSpace {
            domain: "inference".into(),
            parameters,
            regimes: vec![RegimeSpec {
                name: "normal".into(),
                workload: "workloads/inference.sh".into(),
                trials: 3,
            }],
            caps: SafetyCaps::default(),
        }
    }

    fn genome(batch: f64, strategy: &str) -> Genome {
        let mut parameters = BTreeMap::new();
        parameters.insert("batch_size".to_string(), ParamValue::Numeric(batch));
        parameters.insert(
            "strategy".to_string(),
            ParamValue::Categorical(strategy.to_string()),
        );
        Genome {
            id: SpicaId::new(),
            generation: 0,
            parent_ids: vec![],
            parameters,
        }
    }

    #[test]
    fn test_validate_genome_accepts_in_schema() {
        assert!(space().validate_genome(&genome(32.0, "eager")).is_ok());
    }

    #[test]
    fn test_validate_genome_rejects_out_of_bounds() {
        assert!(space().validate_genome(&genome(128.0, "eager")).is_err());
    }

    #[test]
    fn test_validate_genome_rejects_off_enum() {
        assert!(space().validate_genome(&genome(8.0, "greedy")).is_err());
    }

    #[test]
    fn test_validate_genome_rejects_undeclared_parameter() {
        let mut g = genome(8.0, "eager");
        g.parameters
            .insert("extra".to_string(), ParamValue::Numeric(1.0));
        assert!(space().validate_genome(&g).is_err());
    }

    #[test]
    fn test_weights_default_validate() {
        assert!(FitnessWeights::default().validate().is_ok());
    }

    #[test]
    fn test_weights_reject_bad_sum() {
        let mut w = FitnessWeights::default();
        w.performance = 0.9;
        assert!(w.validate().is_err());
    }

    #[test]
    fn test_weighted_sum_inverts_cost_dimensions() {
        let w = FitnessWeights::default();
        let safe = FitnessVector {
            performance: 0.8,
            stability: 0.8,
            drawdown: 0.1,
            turnover: 0.1,
            correlation: 0.1,
            risk: 0.1,
        };
        let risky = FitnessVector {
            drawdown: 0.9,
            risk: 0.9,
            ..safe.clone()
        };
        assert!(safe.weighted_sum(&w) > risky.weighted_sum(&w));
    }

    fn sample_pack() -> CandidatePack {
        let mut pack = CandidatePack {
            schema_version: CANDIDATE_PACK_SCHEMA_VERSION,
            run_id: SpicaId::from_name("run.test"),
            genome: genome(16.0, "lazy"),
            per_regime: vec![],
            dimensions: FitnessVector::default(),
            aggregate_score: 0.5,
            feasible: true,
            created_at: Utc::now(),
            content_hash: String::new(),
        };
        pack.seal().unwrap();
        pack
    }

    #[test]
    fn test_content_hash_roundtrip() {
        let pack = sample_pack();
        assert!(pack.verify_content_hash().unwrap());
    }

    #[test]
    fn test_content_hash_detects_tamper() {
        let mut pack = sample_pack();
        pack.aggregate_score = 0.99;
        assert!(!pack.verify_content_hash().unwrap());
    }

    #[test]
    fn test_infeasible_score_json_roundtrip() {
        let mut pack = sample_pack();
        pack.feasible = false;
        pack.aggregate_score = f64::NEG_INFINITY;
        pack.seal().unwrap();
        let json = serde_json::to_string(&pack).unwrap();
        let back: CandidatePack = serde_json::from_str(&json).unwrap();
        assert!(back.aggregate_score.is_infinite() && back.aggregate_score < 0.0);
        assert!(back.verify_content_hash().unwrap());
    }
}
