//! The phase-synchronized scheduler. Optimization runs in bounded cycles
//! until the nightly batch window approaches, yields the machine to the
//! batch evaluator, waits for its completion signal (or a grace deadline),
//! ingests the report, and resumes.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};

use spica_shared::model::CandidatePack;
use spica_shared::{SpicaEventData, SpicaId};

use crate::artifact::ArtifactStore;
use crate::bridge;
use crate::config::AppConfig;
use crate::evaluator::FitnessEvaluator;
use crate::events::EventBus;
use crate::evolution::GenomeEvolver;
use crate::instance::SpicaInstanceManager;
use crate::novelty::NoveltyArchive;
use crate::tournament::TournamentPromoter;

// ══════════════════════════════════════════════════════════════
// Window math
// ══════════════════════════════════════════════════════════════

/// True when `now` falls inside [start, end), handling windows that wrap
/// past midnight.
#[must_use]
pub fn in_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    if start <= end {
        now >= start && now < end
    } else {
        now >= start || now < end
    }
}

/// True when the window has started or starts within `lookahead`. The
/// scheduler yields early so a running cycle never straddles the boundary.
#[must_use]
pub fn window_imminent(
    now: NaiveTime,
    start: NaiveTime,
    end: NaiveTime,
    lookahead: ChronoDuration,
) -> bool {
    if in_window(now, start, end) {
        return true;
    }
    let until_start = start.signed_duration_since(now);
    let until_start = if until_start < ChronoDuration::zero() {
        until_start + ChronoDuration::hours(24)
    } else {
        until_start
    };
    until_start <= lookahead
}

/// Wall-clock deadline for the batch signal: the next window end after
/// `now`, plus the grace period.
#[must_use]
pub fn batch_deadline(
    now: DateTime<Utc>,
    end: NaiveTime,
    grace: ChronoDuration,
) -> DateTime<Utc> {
    let mut candidate = now.date_naive().and_time(end).and_utc();
    if candidate <= now {
        candidate += ChronoDuration::hours(24);
    }
    candidate + grace
}

// ══════════════════════════════════════════════════════════════
// Scheduler
// ══════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Evolving,
    Yielding,
    AwaitingBatch,
    Resuming,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evolving => "Evolving",
            Self::Yielding => "Yielding",
            Self::AwaitingBatch => "AwaitingBatch",
            Self::Resuming => "Resuming",
        }
    }
}

pub struct PhaseSyncScheduler {
    cfg: AppConfig,
    evolver: GenomeEvolver,
    evaluator: FitnessEvaluator,
    artifacts: Arc<ArtifactStore>,
    baselines: Arc<crate::baseline::BaselineTracker>,
    archive: NoveltyArchive,
    promoter: TournamentPromoter,
    instances: Arc<SpicaInstanceManager>,
    bus: EventBus,
    shutdown: Arc<Notify>,
    phase: Phase,
    /// Evaluated packs of the most recent generation, the tournament cohort.
    cohort: Vec<CandidatePack>,
    batch_deadline: Option<DateTime<Utc>>,
}

impl PhaseSyncScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: AppConfig,
        evolver: GenomeEvolver,
        evaluator: FitnessEvaluator,
        artifacts: Arc<ArtifactStore>,
        baselines: Arc<crate::baseline::BaselineTracker>,
        archive: NoveltyArchive,
        promoter: TournamentPromoter,
        instances: Arc<SpicaInstanceManager>,
        bus: EventBus,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            cfg,
            evolver,
            evaluator,
            artifacts,
            baselines,
            archive,
            promoter,
            instances,
            bus,
            shutdown,
            phase: Phase::Evolving,
            cohort: Vec::new(),
            batch_deadline: None,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Load or seed the population before the first step.
    pub async fn bootstrap(&mut self) -> anyhow::Result<()> {
        self.evolver.load_or_seed().await
    }

    /// Main loop. Returns when shutdown is signalled; the population is
    /// persisted before exit so a restart resumes where it left off.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        self.bootstrap().await?;
        info!(phase = self.phase.as_str(), "Scheduler started");

        let shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                () = shutdown.notified() => {
                    info!("Shutdown requested, persisting population");
                    self.evolver.persist().await?;
                    return Ok(());
                }
                result = self.step() => {
                    if let Err(e) = result {
                        // One failed step must not kill the daemon.
                        error!(phase = self.phase.as_str(), error = %e, "Scheduler step failed");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }

    fn transition(&mut self, to: Phase) {
        let from = self.phase;
        if from == to {
            return;
        }
        info!(from = from.as_str(), to = to.as_str(), "Phase transition");
        self.bus.emit(SpicaEventData::PhaseTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        });
        self.phase = to;
    }

    /// Advance the phase machine by one step. `run` drives this in a loop;
    /// it is public so the machine can also be driven explicitly.
    pub async fn step(&mut self) -> anyhow::Result<()> {
        match self.phase {
            Phase::Evolving => self.step_evolving().await,
            Phase::Yielding => self.step_yielding().await,
            Phase::AwaitingBatch => self.step_awaiting().await,
            Phase::Resuming => self.step_resuming().await,
        }
    }

    // ── Evolving ──

    async fn step_evolving(&mut self) -> anyhow::Result<()> {
        let lookahead =
            ChronoDuration::from_std(self.cfg.cycle_budget).unwrap_or_else(|_| ChronoDuration::minutes(10));
        if window_imminent(
            Utc::now().time(),
            self.cfg.phase_window_start,
            self.cfg.phase_window_end,
            lookahead,
        ) {
            self.transition(Phase::Yielding);
            return Ok(());
        }
        self.run_cycle().await
    }

    /// One optimization cycle: evaluate the whole population under the cycle
    /// budget, archive behaviors, persist packs, advance the generation.
    /// Genomes the budget ran out on become evaluation-failure packs.
    async fn run_cycle(&mut self) -> anyhow::Result<()> {
        let run_id = SpicaId::new();
        let mut budget = self.cfg.cycle_budget;
        // A cycle that would straddle the window start may drain only
        // drain_timeout past it before in-flight work is force-cancelled.
        let until_start = {
            let d = self
                .cfg
                .phase_window_start
                .signed_duration_since(Utc::now().time());
            if d < ChronoDuration::zero() {
                d + ChronoDuration::hours(24)
            } else {
                d
            }
        };
        if let Ok(until_start) = until_start.to_std() {
            budget = budget.min(until_start + self.cfg.drain_timeout);
        }
        let deadline = Instant::now() + budget;
        let genomes = self.evolver.population().genomes.clone();
        info!(
            generation = self.evolver.generation(),
            population_size = genomes.len(),
            "Starting optimization cycle"
        );

        let mut packs: HashMap<SpicaId, CandidatePack> = HashMap::with_capacity(genomes.len());
        for genome in &genomes {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.bus.emit(SpicaEventData::EvaluationFailed {
                    genome_id: genome.id,
                    regime: "*".to_string(),
                    reason: "cycle budget exhausted".to_string(),
                });
                let pack = self
                    .evaluator
                    .failure_pack(run_id, genome, "cycle budget exhausted")?;
                packs.insert(genome.id, pack);
                continue;
            }
            match tokio::time::timeout(remaining, self.evaluator.evaluate_genome(run_id, genome))
                .await
            {
                Ok(Ok((pack, events))) => {
                    self.bus.emit_all(events);
                    packs.insert(genome.id, pack);
                }
                Ok(Err(e)) => {
                    warn!(genome_id = %genome.id, error = %e, "Evaluation errored");
                    self.bus.emit(SpicaEventData::EvaluationFailed {
                        genome_id: genome.id,
                        regime: "*".to_string(),
                        reason: e.to_string(),
                    });
                    let pack = self.evaluator.failure_pack(run_id, genome, &e.to_string())?;
                    packs.insert(genome.id, pack);
                }
                Err(_) => {
                    self.bus.emit(SpicaEventData::EvaluationFailed {
                        genome_id: genome.id,
                        regime: "*".to_string(),
                        reason: "cycle budget exhausted".to_string(),
                    });
                    let pack = self
                        .evaluator
                        .failure_pack(run_id, genome, "cycle budget exhausted")?;
                    packs.insert(genome.id, pack);
                }
            }
        }

        // Novelty bookkeeping covers every evaluated genome, infeasible ones
        // included; their behaviors are still informative.
        for pack in packs.values() {
            let descriptor = pack.dimensions.descriptor();
            let novelty_score = self.archive.score(&descriptor);
            self.archive.consider(spica_shared::model::NoveltyRecord {
                genome_id: pack.genome.id,
                behavior_descriptor: descriptor,
                novelty_score,
                fitness: if pack.feasible {
                    pack.aggregate_score
                } else {
                    0.0
                },
                inserted_at: Utc::now(),
            });
        }

        for pack in packs.values() {
            self.artifacts.write_pack(pack).await?;
        }

        self.cohort = packs.values().cloned().collect();
        let events = self.evolver.advance_generation(&packs).await?;
        self.bus.emit_all(events);
        Ok(())
    }

    // ── Yielding ──

    async fn step_yielding(&mut self) -> anyhow::Result<()> {
        // Nothing is in flight here: cycles are budgeted (and drain-capped
        // near the window), and this phase is only entered between cycles.
        self.evolver.persist().await?;
        self.batch_deadline = Some(batch_deadline(
            Utc::now(),
            self.cfg.phase_window_end,
            ChronoDuration::from_std(self.cfg.phase_grace).unwrap_or_else(|_| ChronoDuration::minutes(15)),
        ));
        info!(deadline = ?self.batch_deadline, "Yielded to batch evaluator");
        self.transition(Phase::AwaitingBatch);
        Ok(())
    }

    // ── AwaitingBatch ──

    async fn step_awaiting(&mut self) -> anyhow::Result<()> {
        if self.artifacts.consume_batch_signal().await? {
            self.transition(Phase::Resuming);
            return Ok(());
        }
        let deadline = self.batch_deadline.unwrap_or_else(Utc::now);
        if Utc::now() >= deadline {
            warn!("Batch signal never arrived; resuming degraded");
            self.bus.emit(SpicaEventData::DegradedIngestion {
                reason: "batch completion signal missed the grace deadline".to_string(),
            });
            self.transition(Phase::Resuming);
            return Ok(());
        }
        tokio::time::sleep(self.cfg.signal_poll_interval).await;
        Ok(())
    }

    // ── Resuming ──

    async fn step_resuming(&mut self) -> anyhow::Result<()> {
        match self.artifacts.read_batch_report().await {
            Some(report) => {
                let events =
                    bridge::ingest_report(&report, &self.baselines, &mut self.archive).await?;
                self.bus.emit_all(events);
            }
            None => {
                self.bus.emit(SpicaEventData::DegradedIngestion {
                    reason: "batch report missing or unparseable".to_string(),
                });
            }
        }

        self.run_tournament_round().await?;

        let prune_events = self.instances.prune_stale().await?;
        self.bus.emit_all(prune_events);

        self.batch_deadline = None;
        self.transition(Phase::Evolving);
        Ok(())
    }

    /// Tournament over the latest evaluated cohort, followed by promotion of
    /// the winner. A missing signing key refuses the promotion but never
    /// blocks the resume.
    async fn run_tournament_round(&mut self) -> anyhow::Result<()> {
        if self.cohort.is_empty() {
            return Ok(());
        }
        let (result, events) = self.promoter.run_tournament(&self.cohort).await?;
        self.bus.emit_all(events);

        let Some(winner_id) = result.winner_id else {
            return Ok(());
        };
        let Some(winner) = self.cohort.iter().find(|p| p.genome.id == winner_id) else {
            return Ok(());
        };
        match self.promoter.promote(&result, winner).await {
            Ok((_, events)) => self.bus.emit_all(events),
            Err(e) => warn!(
                tournament_id = %result.tournament_id,
                error = %e,
                "Promotion refused"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn test_in_window_plain() {
        let (start, end) = (t(3, 0), t(7, 0));
        assert!(!in_window(t(2, 59), start, end));
        assert!(in_window(t(3, 0), start, end));
        assert!(in_window(t(5, 30), start, end));
        assert!(!in_window(t(7, 0), start, end));
    }

    #[test]
    fn test_in_window_wraps_midnight() {
        let (start, end) = (t(23, 0), t(2, 0));
        assert!(in_window(t(23, 30), start, end));
        assert!(in_window(t(1, 59), start, end));
        assert!(!in_window(t(2, 0), start, end));
        assert!(!in_window(t(12, 0), start, end));
    }

    #[test]
    fn test_window_imminent_before_start() {
        let (start, end) = (t(3, 0), t(7, 0));
        let lookahead = ChronoDuration::minutes(10);
        assert!(window_imminent(t(2, 58), start, end, lookahead));
        assert!(window_imminent(t(2, 50), start, end, lookahead));
        assert!(!window_imminent(t(2, 49), start, end, lookahead));
        // Inside the window is always imminent.
        assert!(window_imminent(t(4, 0), start, end, lookahead));
        assert!(!window_imminent(t(12, 0), start, end, lookahead));
    }

    #[test]
    fn test_window_imminent_across_midnight() {
        let (start, end) = (t(0, 5), t(4, 0));
        let lookahead = ChronoDuration::minutes(10);
        assert!(window_imminent(t(23, 58), start, end, lookahead));
        assert!(!window_imminent(t(23, 40), start, end, lookahead));
    }

    #[test]
    fn test_batch_deadline_rolls_to_next_day() {
        let grace = ChronoDuration::minutes(15);
        let end = t(7, 0);

        let before_end = "2026-08-30T03:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let deadline = batch_deadline(before_end, end, grace);
        assert_eq!(deadline, "2026-08-30T07:15:00Z".parse::<DateTime<Utc>>().unwrap());

        let after_end = "2026-08-30T08:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let deadline = batch_deadline(after_end, end, grace);
        assert_eq!(deadline, "2026-08-31T07:15:00Z".parse::<DateTime<Utc>>().unwrap());
    }

    #[test]
    fn test_phase_names() {
        assert_eq!(Phase::Evolving.as_str(), "Evolving");
        assert_eq!(Phase::AwaitingBatch.as_str(), "AwaitingBatch");
    }
}
