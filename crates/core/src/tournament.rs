//! Tournament selection over an evaluated cohort and the signed promotion
//! pipeline that follows the winner out to deployment.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use spica_shared::model::{
    AckStatus, Baseline, CandidatePack, PromotionBundle, TournamentResult, PRIMARY_METRIC,
};
use spica_shared::{sign, OptimizerStore, SpicaError, SpicaEventData, SpicaId};

use crate::artifact::ArtifactStore;
use crate::baseline::BaselineTracker;
use crate::instance::SpicaInstanceManager;

pub const TOURNAMENT_STORE_NS: &str = "core.tournament";
pub const KEY_ROLLBACK_HISTORY: &str = "rollback:history";

/// Rollback records kept for the operator CLI.
const MAX_ROLLBACK_HISTORY: usize = 100;

/// Outcome of validating a deployed winner against its baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentVerdict {
    /// Improvement at or above the keep threshold; new baseline stands.
    Keep,
    /// Inside the neutral band; deployment stays, baseline unchanged.
    Neutral,
    /// Regression past the rollback threshold; bundle rolled back and the
    /// previous baseline restored.
    RolledBack,
}

pub struct PromoterConfig {
    /// Relative improvement that confirms a deployment.
    pub keep_threshold: f64,
    /// Relative regression that forces a rollback.
    pub rollback_threshold: f64,
    pub signing_key: Option<Vec<u8>>,
}

pub struct TournamentPromoter {
    store: Arc<dyn OptimizerStore>,
    artifacts: Arc<ArtifactStore>,
    baselines: Arc<BaselineTracker>,
    instances: Arc<SpicaInstanceManager>,
    cfg: PromoterConfig,
}

impl TournamentPromoter {
    pub fn new(
        store: Arc<dyn OptimizerStore>,
        artifacts: Arc<ArtifactStore>,
        baselines: Arc<BaselineTracker>,
        instances: Arc<SpicaInstanceManager>,
        cfg: PromoterConfig,
    ) -> Self {
        Self {
            store,
            artifacts,
            baselines,
            instances,
            cfg,
        }
    }

    fn signing_key(&self) -> Result<&[u8], SpicaError> {
        self.cfg
            .signing_key
            .as_deref()
            .ok_or_else(|| SpicaError::KeyUnavailable("SPICA_SIGNING_KEY is not set".to_string()))
    }

    // ── Tournament ──

    /// Rank the feasible members of a cohort by aggregate score. An empty or
    /// all-infeasible cohort yields a void tournament (no winner), never a
    /// promoted infeasible genome.
    pub async fn run_tournament(
        &self,
        cohort: &[CandidatePack],
    ) -> anyhow::Result<(TournamentResult, Vec<SpicaEventData>)> {
        let tournament_id = SpicaId::new();
        let mut events = Vec::new();

        let mut scores: BTreeMap<SpicaId, f64> = BTreeMap::new();
        let mut best: Option<(&CandidatePack, f64)> = None;
        for pack in cohort.iter().filter(|p| p.feasible) {
            scores.insert(pack.genome.id, pack.aggregate_score);
            let better = match best {
                None => true,
                Some((incumbent, score)) => {
                    pack.aggregate_score > score
                        || (pack.aggregate_score == score && pack.genome.id < incumbent.genome.id)
                }
            };
            if better {
                best = Some((pack, pack.aggregate_score));
            }
        }

        let winner_id = best.map(|(pack, _)| pack.genome.id);
        if let Some(winner) = winner_id {
            info!(
                tournament_id = %tournament_id,
                winner_id = %winner,
                participants = scores.len(),
                "Tournament decided"
            );
        } else {
            warn!(
                tournament_id = %tournament_id,
                cohort_size = cohort.len(),
                "Tournament void: no feasible participants"
            );
            events.push(SpicaEventData::TournamentVoid { tournament_id });
        }

        let result = TournamentResult {
            tournament_id,
            participants: cohort.iter().map(|p| p.genome.id).collect(),
            winner_id,
            scores,
            timestamp: Utc::now(),
        };
        self.store
            .set_json(
                TOURNAMENT_STORE_NS,
                &format!("tournament:{tournament_id}"),
                serde_json::to_value(&result)?,
            )
            .await?;
        Ok((result, events))
    }

    // ── Promotion ──

    /// Sign the winner's configuration into a write-once promotion bundle
    /// and spawn a tracked instance running that configuration. Fails closed
    /// without a signing key; refuses void tournaments.
    pub async fn promote(
        &self,
        tournament: &TournamentResult,
        winner: &CandidatePack,
    ) -> anyhow::Result<(PromotionBundle, Vec<SpicaEventData>)> {
        let key = self.signing_key()?.to_vec();
        let Some(winner_id) = tournament.winner_id else {
            anyhow::bail!(
                "tournament {} is void and has nothing to promote",
                tournament.tournament_id
            );
        };
        if winner_id != winner.genome.id {
            anyhow::bail!(
                "pack {} is not the winner of tournament {}",
                winner.genome.id,
                tournament.tournament_id
            );
        }

        let mut bundle = PromotionBundle {
            tournament_id: tournament.tournament_id,
            winner_id,
            winner_config: serde_json::to_value(&winner.genome.parameters)?,
            hmac_signature: String::new(),
            created_at: Utc::now(),
            ack_status: AckStatus::Pending,
        };
        bundle.hmac_signature = sign::sign_promotion(&key, &bundle)?;
        self.artifacts.write_promotion(&bundle).await?;
        info!(
            tournament_id = %bundle.tournament_id,
            winner_id = %winner_id,
            "Promotion bundle created"
        );
        let (_, spawn_event) = self.instances.spawn(bundle.winner_config.clone()).await?;
        Ok((
            bundle,
            vec![
                SpicaEventData::PromotionCreated {
                    tournament_id: tournament.tournament_id,
                    winner_id,
                },
                spawn_event,
            ],
        ))
    }

    /// Verify a bundle's HMAC before anything consumes it.
    pub fn verify_bundle(&self, bundle: &PromotionBundle) -> anyhow::Result<()> {
        let key = self.signing_key()?;
        sign::verify_promotion(key, bundle)?;
        Ok(())
    }

    /// Mark a bundle as acknowledged by the deployment side.
    pub async fn acknowledge(
        &self,
        tournament_id: SpicaId,
    ) -> anyhow::Result<SpicaEventData> {
        let bundle = self.artifacts.read_promotion(tournament_id).await?;
        self.verify_bundle(&bundle)?;
        self.artifacts
            .update_ack_status(tournament_id, AckStatus::Acked)
            .await?;
        Ok(SpicaEventData::PromotionAcked { tournament_id })
    }

    /// Post-deployment validation: compare live primary-metric performance
    /// against the promoted baseline for a regime and keep, hold, or roll
    /// back. A bundle that fails signature verification is refused outright.
    pub async fn validate_deployment(
        &self,
        tournament_id: SpicaId,
        domain: &str,
        regime: &str,
        observed_primary: f64,
    ) -> anyhow::Result<(DeploymentVerdict, Vec<SpicaEventData>)> {
        let bundle = self.artifacts.read_promotion(tournament_id).await?;
        if let Err(e) = self.verify_bundle(&bundle) {
            return Err(SpicaError::Signature(format!(
                "promotion bundle {} failed verification: {}",
                tournament_id, e
            ))
            .into());
        }

        let baseline = self
            .baselines
            .current(domain, regime)
            .await?
            .ok_or_else(|| {
                SpicaError::Internal(format!("no baseline for ({domain}, {regime})"))
            })?;
        let reference = baseline
            .metric_means
            .get(PRIMARY_METRIC)
            .copied()
            .unwrap_or(0.0);
        let improvement = if reference.abs() > f64::EPSILON {
            (observed_primary - reference) / reference.abs()
        } else {
            observed_primary - reference
        };

        let mut events = Vec::new();
        let verdict = if improvement >= self.cfg.keep_threshold {
            info!(
                tournament_id = %tournament_id,
                improvement = improvement,
                "Deployment confirmed"
            );
            // A confirmed deployment becomes the new reference point. The
            // outgoing baseline is preserved on the history stack.
            let mut metric_means = baseline.metric_means.clone();
            metric_means.insert(PRIMARY_METRIC.to_string(), observed_primary);
            let promoted = Baseline {
                baseline_id: SpicaId::new(),
                domain: domain.to_string(),
                regime: regime.to_string(),
                metric_means,
                established_at: Utc::now(),
                source_genome_id: bundle.winner_id,
            };
            self.baselines.promote(promoted.clone()).await?;
            events.push(SpicaEventData::BaselinePromoted {
                domain: domain.to_string(),
                regime: regime.to_string(),
                baseline_id: promoted.baseline_id,
            });
            DeploymentVerdict::Keep
        } else if improvement <= -self.cfg.rollback_threshold {
            let reason = format!(
                "primary metric regressed {:.2}% against baseline {}",
                improvement * 100.0,
                baseline.baseline_id
            );
            warn!(tournament_id = %tournament_id, reason = %reason, "🔄 Rolling back promotion");
            self.artifacts
                .update_ack_status(tournament_id, AckStatus::RolledBack)
                .await?;
            self.baselines.restore_previous(domain, regime).await?;
            self.record_rollback(tournament_id, &reason).await?;
            events.push(SpicaEventData::PromotionRolledBack {
                tournament_id,
                reason,
            });
            DeploymentVerdict::RolledBack
        } else {
            DeploymentVerdict::Neutral
        };

        // Record the observation on the instance spawned for this promotion,
        // matched through the manifest hash of the promoted configuration.
        let manifest_hash = sign::hash_json(&bundle.winner_config)?;
        if let Some(instance) = self
            .instances
            .list()
            .await?
            .into_iter()
            .find(|i| i.manifest_hash == manifest_hash)
        {
            self.instances
                .append_telemetry(
                    instance.instance_id,
                    &serde_json::json!({
                        "tournament_id": tournament_id,
                        "domain": domain,
                        "regime": regime,
                        "observed_primary": observed_primary,
                        "verdict": format!("{verdict:?}"),
                        "timestamp": Utc::now(),
                    }),
                )
                .await?;
        }
        Ok((verdict, events))
    }

    pub async fn rollback_history(&self) -> anyhow::Result<Vec<serde_json::Value>> {
        match self
            .store
            .get_json(TOURNAMENT_STORE_NS, KEY_ROLLBACK_HISTORY)
            .await?
        {
            Some(val) => Ok(serde_json::from_value(val)?),
            None => Ok(vec![]),
        }
    }

    async fn record_rollback(&self, tournament_id: SpicaId, reason: &str) -> anyhow::Result<()> {
        let mut history = self.rollback_history().await?;
        history.push(serde_json::json!({
            "tournament_id": tournament_id,
            "reason": reason,
            "timestamp": Utc::now(),
        }));
        if history.len() > MAX_ROLLBACK_HISTORY {
            history = history.split_off(history.len() - MAX_ROLLBACK_HISTORY);
        }
        self.store
            .set_json(
                TOURNAMENT_STORE_NS,
                KEY_ROLLBACK_HISTORY,
                serde_json::to_value(history)?,
            )
            .await
    }
}
