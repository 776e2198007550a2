use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::SpicaId;

/// Telemetry payloads emitted by the optimizer subsystems. Broadcast on the
/// in-process bus; audit-worthy variants are mirrored into `audit_logs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpicaEventData {
    GenerationAdvanced {
        generation: u64,
        population_size: usize,
        best_score: f64,
        feasible_count: usize,
    },
    /// Empty feasible set: elitism fell back to least-infeasible genomes.
    /// Never promoted, always surfaced.
    GenerationDegraded {
        generation: u64,
        infeasible_count: usize,
    },
    EvaluationFailed {
        genome_id: SpicaId,
        regime: String,
        reason: String,
    },
    GenomeQuarantined {
        genome_id: SpicaId,
        until_generation: u64,
    },
    BaselineEstablished {
        domain: String,
        regime: String,
        baseline_id: SpicaId,
    },
    BaselinePromoted {
        domain: String,
        regime: String,
        baseline_id: SpicaId,
    },
    PhaseTransition {
        from: String,
        to: String,
    },
    DegradedIngestion {
        reason: String,
    },
    InstanceSpawned {
        instance_id: SpicaId,
    },
    InstancePruned {
        instance_id: SpicaId,
    },
    TournamentVoid {
        tournament_id: SpicaId,
    },
    PromotionCreated {
        tournament_id: SpicaId,
        winner_id: SpicaId,
    },
    PromotionAcked {
        tournament_id: SpicaId,
    },
    PromotionRolledBack {
        tournament_id: SpicaId,
        reason: String,
    },
    IntegrityViolation {
        artifact: String,
        detail: String,
    },
}

impl SpicaEventData {
    /// Events that must reach the audit log, not just the tracing output.
    #[must_use]
    pub fn is_audit_worthy(&self) -> bool {
        matches!(
            self,
            Self::GenerationDegraded { .. }
                | Self::BaselinePromoted { .. }
                | Self::PromotionCreated { .. }
                | Self::PromotionAcked { .. }
                | Self::PromotionRolledBack { .. }
                | Self::IntegrityViolation { .. }
        )
    }

    /// Short tag used as the audit log event_type column.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::GenerationAdvanced { .. } => "GENERATION_ADVANCED",
            Self::GenerationDegraded { .. } => "GENERATION_DEGRADED",
            Self::EvaluationFailed { .. } => "EVALUATION_FAILED",
            Self::GenomeQuarantined { .. } => "GENOME_QUARANTINED",
            Self::BaselineEstablished { .. } => "BASELINE_ESTABLISHED",
            Self::BaselinePromoted { .. } => "BASELINE_PROMOTED",
            Self::PhaseTransition { .. } => "PHASE_TRANSITION",
            Self::DegradedIngestion { .. } => "DEGRADED_INGESTION",
            Self::InstanceSpawned { .. } => "INSTANCE_SPAWNED",
            Self::InstancePruned { .. } => "INSTANCE_PRUNED",
            Self::TournamentVoid { .. } => "TOURNAMENT_VOID",
            Self::PromotionCreated { .. } => "PROMOTION_CREATED",
            Self::PromotionAcked { .. } => "PROMOTION_ACKED",
            Self::PromotionRolledBack { .. } => "PROMOTION_ROLLED_BACK",
            Self::IntegrityViolation { .. } => "INTEGRITY_VIOLATION",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpicaEvent {
    pub trace_id: SpicaId,
    pub timestamp: DateTime<Utc>,
    pub data: SpicaEventData,
}

impl SpicaEvent {
    #[must_use]
    pub fn new(data: SpicaEventData) -> Self {
        Self {
            trace_id: SpicaId::new(),
            timestamp: Utc::now(),
            data,
        }
    }
}
