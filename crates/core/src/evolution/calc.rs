//! Pure genetic operators. No storage, no clocks; all randomness comes in
//! through the caller's RNG so tests can seed it.

use rand::Rng;
use std::collections::BTreeMap;

use spica_shared::model::{
    CandidatePack, Genome, ParamSpec, ParamValue, SafetyCaps, SearchSpace,
};
use spica_shared::SpicaId;

/// Split evaluated packs into feasible and infeasible. Infeasible genomes
/// carry `aggregate_score = -inf` and never reach elitism or the mating pool.
#[must_use]
pub fn partition_feasible(packs: &[CandidatePack]) -> (Vec<&CandidatePack>, Vec<&CandidatePack>) {
    packs.iter().partition(|p| p.feasible)
}

/// Top `elite_k` feasible genomes by aggregate score, ties broken by genome
/// id for determinism. Elites are carried over unchanged (same id, same
/// generation, same parameters).
#[must_use]
pub fn select_elites(feasible: &[&CandidatePack], elite_k: usize) -> Vec<Genome> {
    let mut sorted: Vec<&&CandidatePack> = feasible.iter().collect();
    sorted.sort_by(|a, b| {
        b.aggregate_score
            .partial_cmp(&a.aggregate_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.genome.id.cmp(&b.genome.id))
    });
    sorted
        .into_iter()
        .take(elite_k)
        .map(|p| p.genome.clone())
        .collect()
}

/// Draw `tournament_size` packs uniformly at random and keep the best.
pub fn tournament_pick<'a, R: Rng>(
    pool: &[&'a CandidatePack],
    tournament_size: usize,
    rng: &mut R,
) -> &'a CandidatePack {
    debug_assert!(!pool.is_empty());
    let mut best = pool[rng.gen_range(0..pool.len())];
    for _ in 1..tournament_size {
        let challenger = pool[rng.gen_range(0..pool.len())];
        if challenger.aggregate_score > best.aggregate_score {
            best = challenger;
        }
    }
    best
}

/// Per-parameter uniform crossover between two parents.
pub fn crossover<R: Rng>(
    a: &Genome,
    b: &Genome,
    rng: &mut R,
) -> BTreeMap<String, ParamValue> {
    a.parameters
        .iter()
        .map(|(name, value_a)| {
            let value = if rng.gen_bool(0.5) {
                value_a.clone()
            } else {
                b.parameters.get(name).unwrap_or(value_a).clone()
            };
            (name.clone(), value)
        })
        .collect()
}

/// Mutate parameters in place: numerics get bounded uniform noise
/// (`sigma` fraction of the range) clamped back inside the bounds,
/// categoricals are resampled from the allowed set.
pub fn mutate<R: Rng>(
    parameters: &mut BTreeMap<String, ParamValue>,
    space: &SearchSpace,
    mutation_rate: f64,
    sigma: f64,
    rng: &mut R,
) {
    for (name, value) in parameters.iter_mut() {
        if !rng.gen_bool(mutation_rate) {
            continue;
        }
        match (space.parameters.get(name), &mut *value) {
            (Some(ParamSpec::Numeric { min, max }), ParamValue::Numeric(v)) => {
                let range = max - min;
                let noise = sigma * range * (rng.gen::<f64>() * 2.0 - 1.0);
                *v = (*v + noise).clamp(*min, *max);
            }
            (Some(ParamSpec::Categorical { choices }), ParamValue::Categorical(v)) => {
                *v = choices[rng.gen_range(0..choices.len())].clone();
            }
            _ => {}
        }
    }
}

/// Random genome drawn uniformly from the search space (seeding and
/// degraded-generation restarts).
pub fn random_genome<R: Rng>(space: &SearchSpace, generation: u64, rng: &mut R) -> Genome {
    let parameters = space
        .parameters
        .iter()
        .map(|(name, spec)| {
            let value = match spec {
                ParamSpec::Numeric { min, max } => {
                    ParamValue::Numeric(rng.gen_range(*min..=*max))
                }
                ParamSpec::Categorical { choices } => {
                    ParamValue::Categorical(choices[rng.gen_range(0..choices.len())].clone())
                }
            };
            (name.clone(), value)
        })
        .collect();
    Genome {
        id: SpicaId::new(),
        generation,
        parent_ids: vec![],
        parameters,
    }
}

/// How far past the safety ceilings a pack sits. Used only for the degraded
/// fallback ("least infeasible"); zero for feasible packs.
#[must_use]
pub fn constraint_excess(pack: &CandidatePack, caps: &SafetyCaps) -> f64 {
    (pack.dimensions.drawdown - caps.max_drawdown).max(0.0)
        + (pack.dimensions.risk - caps.max_risk).max(0.0)
}

/// Infeasible packs ordered least-infeasible first (deterministic: ties
/// broken by genome id).
#[must_use]
pub fn least_infeasible<'a>(
    infeasible: &[&'a CandidatePack],
    caps: &SafetyCaps,
) -> Vec<&'a CandidatePack> {
    let mut sorted: Vec<&'a CandidatePack> = infeasible.to_vec();
    sorted.sort_by(|a, b| {
        constraint_excess(a, caps)
            .partial_cmp(&constraint_excess(b, caps))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.genome.id.cmp(&b.genome.id))
    });
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use spica_shared::model::{
        FitnessVector, RegimeSpec, CANDIDATE_PACK_SCHEMA_VERSION,
    };

    fn space() -> SearchSpace {
        let mut parameters = BTreeMap::new();
        parameters.insert(
            "threads".to_string(),
            ParamSpec::Numeric { min: 1.0, max: 16.0 },
        );
        parameters.insert(
            "mode".to_string(),
            ParamSpec::Categorical {
                choices: vec!["fast".into(), "safe".into(), "balanced".into()],
            },
        );
        SearchSpace {
            domain: "test".into(),
            parameters,
            regimes: vec![RegimeSpec {
                name: "normal".into(),
                workload: "noop".into(),
                trials: 1,
            }],
            caps: SafetyCaps::default(),
        }
    }

    fn pack(score: f64, feasible: bool) -> CandidatePack {
        let mut rng = StdRng::seed_from_u64(42);
        CandidatePack {
            schema_version: CANDIDATE_PACK_SCHEMA_VERSION,
            run_id: SpicaId::new(),
            genome: random_genome(&space(), 0, &mut rng),
            per_regime: vec![],
            dimensions: FitnessVector::default(),
            aggregate_score: if feasible { score } else { f64::NEG_INFINITY },
            feasible,
            created_at: Utc::now(),
            content_hash: String::new(),
        }
    }

    #[test]
    fn test_partition_feasible() {
        let packs = vec![pack(0.9, true), pack(0.0, false), pack(0.5, true)];
        let (feasible, infeasible) = partition_feasible(&packs);
        assert_eq!(feasible.len(), 2);
        assert_eq!(infeasible.len(), 1);
    }

    #[test]
    fn test_select_elites_takes_best() {
        let packs = vec![pack(0.1, true), pack(0.9, true), pack(0.5, true)];
        let refs: Vec<&CandidatePack> = packs.iter().collect();
        let elites = select_elites(&refs, 1);
        assert_eq!(elites.len(), 1);
        assert_eq!(elites[0].id, packs[1].genome.id);
    }

    #[test]
    fn test_crossover_values_come_from_parents() {
        let mut rng = StdRng::seed_from_u64(1);
        let a = random_genome(&space(), 0, &mut rng);
        let b = random_genome(&space(), 0, &mut rng);
        let child = crossover(&a, &b, &mut rng);
        for (name, value) in &child {
            let from_a = a.parameters.get(name) == Some(value);
            let from_b = b.parameters.get(name) == Some(value);
            assert!(from_a || from_b, "parameter '{name}' from neither parent");
        }
    }

    #[test]
    fn test_mutation_respects_bounds_and_schema() {
        let space = space();
        let mut rng = StdRng::seed_from_u64(2);
        let mut genome = random_genome(&space, 0, &mut rng);
        // Force every parameter to mutate, many times over
        for _ in 0..200 {
            mutate(&mut genome.parameters, &space, 1.0, 0.5, &mut rng);
            assert!(space.validate_genome(&genome).is_ok());
        }
    }

    #[test]
    fn test_tournament_pick_prefers_higher_score() {
        let strong = pack(0.95, true);
        let weak = pack(0.05, true);
        let pool = vec![&weak, &strong];
        let mut rng = StdRng::seed_from_u64(3);
        let mut strong_wins = 0;
        for _ in 0..100 {
            if tournament_pick(&pool, 2, &mut rng).genome.id == strong.genome.id {
                strong_wins += 1;
            }
        }
        // With tournament size 2 over 2 entries the stronger pack wins
        // whenever it is drawn at all: P = 3/4.
        assert!(strong_wins > 60, "strong pack won only {strong_wins}/100");
    }

    #[test]
    fn test_least_infeasible_ordering() {
        let caps = SafetyCaps::default();
        let mut mild = pack(0.0, false);
        mild.dimensions.drawdown = 0.65;
        let mut severe = pack(0.0, false);
        severe.dimensions.drawdown = 0.95;
        severe.dimensions.risk = 0.9;
        let ordered = least_infeasible(&[&severe, &mild], &caps);
        assert_eq!(ordered[0].genome.id, mild.genome.id);
    }
}
