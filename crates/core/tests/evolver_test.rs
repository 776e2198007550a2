//! Generation-advancement behavior: elitism, population size, safety gate
//! exclusion, and the degraded all-infeasible path.

use chrono::Utc;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use spica_core::db::{init_db, SqliteDataStore};
use spica_core::evolution::{EvolverConfig, GenomeEvolver};
use spica_shared::model::{
    CandidatePack, FitnessVector, Genome, ParamSpec, RegimeSpec, RegimeStats, SafetyCaps,
    SearchSpace, CANDIDATE_PACK_SCHEMA_VERSION,
};
use spica_shared::{OptimizerStore, SpicaEventData, SpicaId};

async fn setup_store() -> Arc<dyn OptimizerStore> {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    init_db(&pool, "sqlite::memory:").await.unwrap();
    Arc::new(SqliteDataStore::new(pool))
}

fn space() -> SearchSpace {
    let mut parameters = BTreeMap::new();
    parameters.insert(
        "cache_mb".to_string(),
        ParamSpec::Numeric {
            min: 16.0,
            max: 512.0,
        },
    );
    parameters.insert(
        "eviction".to_string(),
        ParamSpec::Categorical {
            choices: vec!["lru".into(), "lfu".into(), "arc".into()],
        },
    );
    SearchSpace {
        domain: "cache".into(),
        parameters,
        regimes: vec![RegimeSpec {
            name: "steady".into(),
            workload: "steady.sh".into(),
            trials: 3,
        }],
        caps: SafetyCaps::default(),
    }
}

fn config() -> EvolverConfig {
    EvolverConfig {
        population_size: 8,
        elite_k: 2,
        tournament_size: 3,
        crossover_rate: 0.7,
        mutation_rate: 0.15,
        mutation_sigma: 0.1,
        quarantine_generations: 3,
        max_error_rate: 0.25,
    }
}

fn pack_for(genome: &Genome, score: f64, feasible: bool) -> CandidatePack {
    let mut dimensions = FitnessVector {
        performance: score.max(0.0),
        stability: 0.8,
        ..FitnessVector::default()
    };
    if !feasible {
        dimensions.drawdown = 0.9; // over the default 0.6 cap
    }
    let mut pack = CandidatePack {
        schema_version: CANDIDATE_PACK_SCHEMA_VERSION,
        run_id: SpicaId::new(),
        genome: genome.clone(),
        per_regime: vec![RegimeStats {
            regime: "steady".into(),
            trial_count: 3,
            kpi_means: BTreeMap::new(),
            ci95: BTreeMap::new(),
            baseline_ref: None,
            deltas: BTreeMap::new(),
            error_rate: 0.0,
            oom_count: 0,
            infeasible: false,
        }],
        dimensions,
        aggregate_score: if feasible { score } else { f64::NEG_INFINITY },
        feasible,
        created_at: Utc::now(),
        content_hash: String::new(),
    };
    pack.seal().unwrap();
    pack
}

fn evaluated(
    evolver: &GenomeEvolver,
    scores: &[(f64, bool)],
) -> HashMap<SpicaId, CandidatePack> {
    evolver
        .population()
        .genomes
        .iter()
        .zip(scores.iter().cycle())
        .map(|(genome, (score, feasible))| (genome.id, pack_for(genome, *score, *feasible)))
        .collect()
}

#[tokio::test]
async fn test_population_size_invariant_across_generations() {
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), config(), Some(11));
    evolver.seed_population().unwrap();
    assert_eq!(evolver.population().len(), 8);
    assert_eq!(evolver.generation(), 0);

    let packs = evaluated(&evolver, &[(0.9, true), (0.7, true), (0.5, true), (0.1, true)]);
    evolver.advance_generation(&packs).await.unwrap();

    assert_eq!(evolver.generation(), 1);
    assert_eq!(evolver.population().len(), 8);
    for genome in &evolver.population().genomes {
        // Every genome in the new population stays within the schema.
        space().validate_genome(genome).unwrap();
    }
}

#[tokio::test]
async fn test_elites_carry_over_unchanged() {
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), config(), Some(42));
    evolver.seed_population().unwrap();

    let packs = evaluated(&evolver, &[(0.9, true), (0.7, true), (0.5, true), (0.1, true)]);
    let mut by_score: Vec<&CandidatePack> = packs.values().filter(|p| p.feasible).collect();
    by_score.sort_by(|a, b| b.aggregate_score.partial_cmp(&a.aggregate_score).unwrap());
    let top: Vec<Genome> = by_score.iter().take(2).map(|p| p.genome.clone()).collect();

    evolver.advance_generation(&packs).await.unwrap();

    for elite in &top {
        let carried = evolver
            .population()
            .genomes
            .iter()
            .find(|g| g.id == elite.id)
            .expect("elite missing from next generation");
        // Byte-identical: same id, same parameters, no re-parenting.
        assert_eq!(carried, elite);
    }
}

#[tokio::test]
async fn test_offspring_record_parents() {
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), config(), Some(7));
    evolver.seed_population().unwrap();
    let parent_ids: Vec<SpicaId> = evolver.population().genomes.iter().map(|g| g.id).collect();

    let packs = evaluated(&evolver, &[(0.8, true), (0.6, true)]);
    evolver.advance_generation(&packs).await.unwrap();

    let offspring: Vec<&Genome> = evolver
        .population()
        .genomes
        .iter()
        .filter(|g| g.generation == 1)
        .collect();
    assert!(!offspring.is_empty());
    for child in offspring {
        assert!(!child.parent_ids.is_empty() && child.parent_ids.len() <= 2);
        for parent in &child.parent_ids {
            assert!(parent_ids.contains(parent));
        }
    }
}

#[tokio::test]
async fn test_gate_violator_never_selected_as_elite() {
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), config(), Some(3));
    evolver.seed_population().unwrap();

    // The infeasible genome carries the highest raw performance; the gate
    // must still exclude it from elitism.
    let genomes: Vec<Genome> = evolver.population().genomes.clone();
    let mut packs = HashMap::new();
    for (i, genome) in genomes.iter().enumerate() {
        let (score, feasible) = if i == 0 { (0.99, false) } else { (0.5, true) };
        packs.insert(genome.id, pack_for(genome, score, feasible));
    }
    let violator = genomes[0].id;

    evolver.advance_generation(&packs).await.unwrap();

    let survivors_from_gen0: Vec<SpicaId> = evolver
        .population()
        .genomes
        .iter()
        .filter(|g| g.generation == 0)
        .map(|g| g.id)
        .collect();
    assert!(!survivors_from_gen0.contains(&violator));
}

#[tokio::test]
async fn test_all_infeasible_generation_degrades() {
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), config(), Some(19));
    evolver.seed_population().unwrap();

    let packs = evaluated(&evolver, &[(0.4, false)]);
    let events = evolver.advance_generation(&packs).await.unwrap();

    assert!(events
        .iter()
        .any(|e| matches!(e, SpicaEventData::GenerationDegraded { .. })));
    // The population survives the degraded generation at full size.
    assert_eq!(evolver.population().len(), 8);
    assert_eq!(evolver.generation(), 1);
}

#[tokio::test]
async fn test_degraded_generation_restarts_with_random_genomes() {
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), config(), Some(29));
    evolver.seed_population().unwrap();

    let packs = evaluated(&evolver, &[(0.4, false)]);
    evolver.advance_generation(&packs).await.unwrap();

    // Non-elite slots are fresh random genomes, never offspring of the
    // infeasible cohort.
    let restarted: Vec<&Genome> = evolver
        .population()
        .genomes
        .iter()
        .filter(|g| g.generation == 1)
        .collect();
    assert!(!restarted.is_empty());
    for genome in restarted {
        assert!(genome.parent_ids.is_empty());
        space().validate_genome(genome).unwrap();
    }
}

#[tokio::test]
async fn test_empty_evaluation_set_is_an_error() {
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), config(), Some(31));
    evolver.seed_population().unwrap();

    let err = evolver
        .advance_generation(&HashMap::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("empty evaluation set"));
    // The population is untouched.
    assert_eq!(evolver.generation(), 0);
    assert_eq!(evolver.population().len(), 8);
}

#[tokio::test]
async fn test_quarantine_excludes_error_prone_genome() {
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), config(), Some(23));
    evolver.seed_population().unwrap();

    let genomes: Vec<Genome> = evolver.population().genomes.clone();
    let mut packs = HashMap::new();
    for (i, genome) in genomes.iter().enumerate() {
        let mut pack = pack_for(genome, 0.6, true);
        if i == 0 {
            pack.per_regime[0].error_rate = 0.67; // over the 0.25 threshold
            pack.seal().unwrap();
        }
        packs.insert(genome.id, pack);
    }
    let flaky = genomes[0].id;

    let events = evolver.advance_generation(&packs).await.unwrap();
    assert!(events.iter().any(
        |e| matches!(e, SpicaEventData::GenomeQuarantined { genome_id, .. } if *genome_id == flaky)
    ));
    assert!(evolver.is_quarantined(flaky));
}

#[tokio::test]
async fn test_population_persists_and_reloads() {
    let store = setup_store().await;
    let mut evolver = GenomeEvolver::new(store.clone(), space(), config(), Some(5));
    evolver.seed_population().unwrap();
    let packs = evaluated(&evolver, &[(0.7, true)]);
    evolver.advance_generation(&packs).await.unwrap();
    let snapshot = evolver.population().clone();

    let mut revived = GenomeEvolver::new(store, space(), config(), Some(5));
    revived.load_or_seed().await.unwrap();
    assert_eq!(revived.generation(), snapshot.generation);
    assert_eq!(revived.population().genomes, snapshot.genomes);
}

#[tokio::test]
async fn test_small_population_selection_scenario() {
    // population_size=4, elite_k=1, tournament_size=2, all feasible with
    // scores [0.9, 0.7, 0.5, 0.1]: the 0.9 genome survives unchanged, the
    // other three slots are bred from the evaluated pool.
    let cfg = EvolverConfig {
        population_size: 4,
        elite_k: 1,
        tournament_size: 2,
        ..config()
    };
    let mut evolver = GenomeEvolver::new(setup_store().await, space(), cfg, Some(17));
    evolver.seed_population().unwrap();
    let gen0: Vec<Genome> = evolver.population().genomes.clone();
    let gen0_ids: Vec<SpicaId> = gen0.iter().map(|g| g.id).collect();

    let packs = evaluated(&evolver, &[(0.9, true), (0.7, true), (0.5, true), (0.1, true)]);
    evolver.advance_generation(&packs).await.unwrap();

    let next = evolver.population();
    assert_eq!(next.len(), 4);
    let best = &gen0[0];
    assert!(
        next.genomes.iter().any(|g| g == best),
        "the 0.9 genome must carry over byte-identical"
    );
    for genome in next.genomes.iter().filter(|g| g.id != best.id) {
        assert_eq!(genome.generation, 1);
        assert!(!genome.parent_ids.is_empty());
        assert!(genome.parent_ids.iter().all(|p| gen0_ids.contains(p)));
    }
}
