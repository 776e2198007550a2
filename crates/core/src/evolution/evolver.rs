//! The genome evolver owns the population. One generation at a time,
//! replaced wholesale; all mutation of optimizer state happens on the
//! scheduler's single logical thread.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use spica_shared::model::{CandidatePack, Genome, Population, SearchSpace};
use spica_shared::{OptimizerStore, SpicaEventData, SpicaId};

use super::calc;

const EVOLVER_STORE_NS: &str = "core.evolver";
const KEY_POPULATION: &str = "population:current";
const KEY_GENERATION: &str = "population:generation";
const KEY_QUARANTINE: &str = "quarantine:ledger";
const KEY_INFEASIBLE_AUDIT: &str = "audit:infeasible";

/// Infeasible genome ids retained for audit, most recent generations first.
const MAX_INFEASIBLE_AUDIT_ENTRIES: usize = 1000;

/// Read the persisted population without constructing an evolver (status
/// reporting).
pub async fn load_population(store: &dyn OptimizerStore) -> anyhow::Result<Option<Population>> {
    match store.get_json(EVOLVER_STORE_NS, KEY_POPULATION).await? {
        Some(val) => Ok(Some(serde_json::from_value(val)?)),
        None => Ok(None),
    }
}

#[derive(Clone)]
pub struct EvolverConfig {
    pub population_size: usize,
    pub elite_k: usize,
    pub tournament_size: usize,
    pub crossover_rate: f64,
    pub mutation_rate: f64,
    pub mutation_sigma: f64,
    pub quarantine_generations: u64,
    /// Per-regime error/OOM rate above which a genome is quarantined.
    pub max_error_rate: f64,
}

pub struct GenomeEvolver {
    store: Arc<dyn OptimizerStore>,
    space: SearchSpace,
    cfg: EvolverConfig,
    population: Population,
    /// genome_id -> generation at which the quarantine lifts.
    quarantine: HashMap<SpicaId, u64>,
    rng: StdRng,
}

impl GenomeEvolver {
    pub fn new(
        store: Arc<dyn OptimizerStore>,
        space: SearchSpace,
        cfg: EvolverConfig,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self {
            store,
            space,
            cfg,
            population: Population {
                generation: 0,
                genomes: vec![],
            },
            quarantine: HashMap::new(),
            rng,
        }
    }

    #[must_use]
    pub fn population(&self) -> &Population {
        &self.population
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.population.generation
    }

    /// Seed a fresh random population (generation 0).
    pub fn seed_population(&mut self) -> anyhow::Result<()> {
        let mut genomes = Vec::with_capacity(self.cfg.population_size);
        for _ in 0..self.cfg.population_size {
            let genome = calc::random_genome(&self.space, 0, &mut self.rng);
            self.space.validate_genome(&genome)?;
            genomes.push(genome);
        }
        self.population = Population {
            generation: 0,
            genomes,
        };
        info!(
            population_size = self.population.len(),
            "Seeded initial population"
        );
        Ok(())
    }

    /// Persist the population and generation counter to durable storage.
    pub async fn persist(&self) -> anyhow::Result<()> {
        self.store
            .set_json(
                EVOLVER_STORE_NS,
                KEY_POPULATION,
                serde_json::to_value(&self.population)?,
            )
            .await?;
        self.store
            .set_json(
                EVOLVER_STORE_NS,
                KEY_GENERATION,
                serde_json::to_value(self.population.generation)?,
            )
            .await?;
        self.store
            .set_json(
                EVOLVER_STORE_NS,
                KEY_QUARANTINE,
                serde_json::to_value(
                    self.quarantine
                        .iter()
                        .map(|(id, until)| (id.to_string(), *until))
                        .collect::<HashMap<String, u64>>(),
                )?,
            )
            .await?;
        Ok(())
    }

    /// Reload the persisted population, or seed a fresh one when none exists.
    pub async fn load_or_seed(&mut self) -> anyhow::Result<()> {
        match self.store.get_json(EVOLVER_STORE_NS, KEY_POPULATION).await? {
            Some(val) => {
                self.population = serde_json::from_value(val)?;
                if let Some(q) = self.store.get_json(EVOLVER_STORE_NS, KEY_QUARANTINE).await? {
                    let raw: HashMap<String, u64> = serde_json::from_value(q)?;
                    self.quarantine = raw
                        .into_iter()
                        .filter_map(|(id, until)| id.parse::<SpicaId>().ok().map(|id| (id, until)))
                        .collect();
                }
                info!(
                    generation = self.population.generation,
                    population_size = self.population.len(),
                    "Restored persisted population"
                );
                Ok(())
            }
            None => self.seed_population(),
        }
    }

    /// Advance one generation from a fully evaluated population.
    ///
    /// Elitism invariant: the top `elite_k` feasible genomes carry over
    /// unchanged. The rest of the next population is built by tournament
    /// selection over the feasible mating pool, then crossover and mutation.
    /// An empty feasible set degrades the generation: least-infeasible
    /// elitism plus a random restart of the remaining slots, flagged, never
    /// promoted. An empty evaluation set is an error.
    pub async fn advance_generation(
        &mut self,
        evaluated: &HashMap<SpicaId, CandidatePack>,
    ) -> anyhow::Result<Vec<SpicaEventData>> {
        if evaluated.is_empty() {
            anyhow::bail!(
                "cannot advance generation {} from an empty evaluation set",
                self.population.generation + 1
            );
        }
        let next_generation = self.population.generation + 1;
        let mut events = Vec::new();

        let packs: Vec<CandidatePack> = evaluated.values().cloned().collect();
        let (feasible, infeasible) = calc::partition_feasible(&packs);

        // Infeasible genomes are excluded from selection but recorded for audit.
        if !infeasible.is_empty() {
            self.record_infeasible(next_generation, &infeasible).await?;
        }
        events.extend(self.update_quarantine(next_generation, &packs));

        // Mating pool: feasible, not quarantined.
        let pool: Vec<&CandidatePack> = feasible
            .iter()
            .copied()
            .filter(|p| !self.is_quarantined(p.genome.id))
            .collect();

        let degraded = pool.is_empty();
        let elites: Vec<Genome> = if degraded {
            warn!(
                generation = next_generation,
                infeasible_count = infeasible.len(),
                "No feasible genomes; falling back to least-infeasible elitism"
            );
            events.push(SpicaEventData::GenerationDegraded {
                generation: next_generation,
                infeasible_count: infeasible.len(),
            });
            calc::least_infeasible(&infeasible, &self.space.caps)
                .into_iter()
                .take(self.cfg.elite_k.max(1))
                .map(|p| p.genome.clone())
                .collect()
        } else {
            calc::select_elites(&pool, self.cfg.elite_k)
        };

        let mut next_genomes: Vec<Genome> = elites;

        // Offspring fill the remaining slots. A degraded generation has no
        // feasible parents to breed from, so it restarts the non-elite slots
        // with fresh random genomes instead of recombining infeasible ones.
        while next_genomes.len() < self.cfg.population_size {
            let offspring = if degraded {
                let genome = calc::random_genome(&self.space, next_generation, &mut self.rng);
                self.space.validate_genome(&genome)?;
                genome
            } else {
                self.breed(&pool, next_generation)?
            };
            next_genomes.push(offspring);
        }

        let best_score = pool
            .iter()
            .map(|p| p.aggregate_score)
            .fold(f64::NEG_INFINITY, f64::max);

        self.population = Population {
            generation: next_generation,
            genomes: next_genomes,
        };
        self.persist().await?;

        info!(
            generation = next_generation,
            feasible_count = pool.len(),
            best_score = best_score,
            degraded = degraded,
            "📈 Generation advanced"
        );
        events.push(SpicaEventData::GenerationAdvanced {
            generation: next_generation,
            population_size: self.population.len(),
            best_score,
            feasible_count: pool.len(),
        });

        Ok(events)
    }

    fn breed(
        &mut self,
        pool: &[&CandidatePack],
        generation: u64,
    ) -> anyhow::Result<Genome> {
        debug_assert!(!pool.is_empty());
        let parent_a = calc::tournament_pick(pool, self.cfg.tournament_size, &mut self.rng);

        let crossed = self.rng.gen_bool(self.cfg.crossover_rate);
        let (mut parameters, parent_ids) = if crossed && pool.len() > 1 {
            let parent_b = calc::tournament_pick(pool, self.cfg.tournament_size, &mut self.rng);
            (
                calc::crossover(&parent_a.genome, &parent_b.genome, &mut self.rng),
                vec![parent_a.genome.id, parent_b.genome.id],
            )
        } else {
            (parent_a.genome.parameters.clone(), vec![parent_a.genome.id])
        };

        calc::mutate(
            &mut parameters,
            &self.space,
            self.cfg.mutation_rate,
            self.cfg.mutation_sigma,
            &mut self.rng,
        );

        let genome = Genome {
            id: SpicaId::new(),
            generation,
            parent_ids,
            parameters,
        };
        self.space.validate_genome(&genome)?;
        Ok(genome)
    }

    #[must_use]
    pub fn is_quarantined(&self, genome_id: SpicaId) -> bool {
        self.quarantine
            .get(&genome_id)
            .is_some_and(|until| *until > self.population.generation)
    }

    /// Quarantine genomes whose trial error rate crossed the threshold in any
    /// regime; lift expired quarantines.
    fn update_quarantine(
        &mut self,
        next_generation: u64,
        packs: &[CandidatePack],
    ) -> Vec<SpicaEventData> {
        let mut events = Vec::new();
        self.quarantine.retain(|_, until| *until > next_generation);

        for pack in packs {
            let over_threshold = pack
                .per_regime
                .iter()
                .any(|r| r.error_rate > self.cfg.max_error_rate);
            if over_threshold && !self.quarantine.contains_key(&pack.genome.id) {
                let until = next_generation + self.cfg.quarantine_generations;
                self.quarantine.insert(pack.genome.id, until);
                warn!(
                    genome_id = %pack.genome.id,
                    until_generation = until,
                    "Genome quarantined for repeated trial failures"
                );
                events.push(SpicaEventData::GenomeQuarantined {
                    genome_id: pack.genome.id,
                    until_generation: until,
                });
            }
        }
        events
    }

    async fn record_infeasible(
        &self,
        generation: u64,
        infeasible: &[&CandidatePack],
    ) -> anyhow::Result<()> {
        let mut audit: Vec<serde_json::Value> = match self
            .store
            .get_json(EVOLVER_STORE_NS, KEY_INFEASIBLE_AUDIT)
            .await?
        {
            Some(val) => serde_json::from_value(val)?,
            None => vec![],
        };
        for pack in infeasible {
            audit.push(serde_json::json!({
                "generation": generation,
                "genome_id": pack.genome.id,
                "drawdown": pack.dimensions.drawdown,
                "risk": pack.dimensions.risk,
            }));
        }
        if audit.len() > MAX_INFEASIBLE_AUDIT_ENTRIES {
            audit = audit.split_off(audit.len() - MAX_INFEASIBLE_AUDIT_ENTRIES);
        }
        self.store
            .set_json(
                EVOLVER_STORE_NS,
                KEY_INFEASIBLE_AUDIT,
                serde_json::to_value(audit)?,
            )
            .await
    }
}
