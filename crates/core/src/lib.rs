pub mod artifact;
pub mod baseline;
pub mod bridge;
pub mod config;
pub mod db;
pub mod evaluator;
pub mod events;
pub mod evolution;
pub mod instance;
pub mod novelty;
pub mod phase;
pub mod stats;
pub mod tournament;

pub use db::SqliteDataStore;

use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use spica_shared::model::SearchSpace;
use spica_shared::OptimizerStore;

/// Boot the optimizer daemon and run it until a shutdown signal arrives.
pub async fn run_optimizer() -> anyhow::Result<()> {
    info!("+---------------------------------------+");
    info!("|         Spica Optimizer Daemon        |");
    info!(
        "|             Version {:<10}        |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+---------------------------------------+");

    let cfg = config::AppConfig::load()?;
    info!(
        "📍 Loaded Config: DB_URL={}, DATA_DIR={}",
        cfg.database_url,
        cfg.data_dir.display()
    );

    if cfg.signing_key.is_none() {
        warn!("⚠️  SPICA_SIGNING_KEY is not set. Instance spawning and promotions will be refused.");
        warn!("    Set SPICA_SIGNING_KEY in .env or environment to enable the signed pipeline.");
    }

    // 0. Ensure parent directory of the DB file exists (deployed layout).
    if let Some(path_str) = cfg.database_url.strip_prefix("sqlite:") {
        let db_path = std::path::Path::new(path_str);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && parent != std::path::Path::new(".") {
                std::fs::create_dir_all(parent)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ =
                        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
                }
                info!("📁 Data directory: {}", parent.display());
            }
        }
    }

    // 1. Database
    use sqlx::sqlite::SqliteConnectOptions;
    use std::str::FromStr;
    let opts = SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true);
    let pool = sqlx::SqlitePool::connect_with(opts).await?;
    db::init_db(&pool, &cfg.database_url).await?;
    let store: Arc<dyn OptimizerStore> = Arc::new(db::SqliteDataStore::new(pool.clone()));

    // 2. Search space
    let raw = std::fs::read_to_string(&cfg.search_space_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to read search space {}: {}",
            cfg.search_space_path.display(),
            e
        )
    })?;
    let space: SearchSpace = serde_json::from_str(&raw)?;
    space.validate()?;
    info!(
        domain = %space.domain,
        parameters = space.parameters.len(),
        regimes = space.regimes.len(),
        "Search space loaded"
    );

    // 3. Artifacts & instances
    let artifacts = Arc::new(artifact::ArtifactStore::new(cfg.data_dir.clone()));
    artifacts.init().await?;
    let instances = Arc::new(instance::SpicaInstanceManager::new(
        store.clone(),
        instance::InstanceManagerConfig {
            data_dir: cfg.data_dir.clone(),
            signing_key: cfg.signing_key.clone(),
            prune_after_days: cfg.prune_after_days,
            min_instances: cfg.min_instances,
        },
    ));
    instances.init().await?;

    // 4. Evaluation pipeline
    let baselines = Arc::new(baseline::BaselineTracker::new(store.clone()));
    let workload_root = cfg
        .search_space_path
        .parent()
        .map(std::path::Path::to_path_buf)
        .unwrap_or_else(|| config::exe_dir());
    let evaluator = evaluator::FitnessEvaluator::new(
        space.clone(),
        Arc::new(evaluator::CommandWorkload { workload_root }),
        baselines.clone(),
        evaluator::EvaluatorConfig {
            weights: cfg.fitness_weights.clone(),
            bootstrap_iterations: cfg.bootstrap_iterations,
            max_parallel_experiments: cfg.max_parallel_experiments,
            trial_timeout: cfg.trial_timeout,
            bootstrap_seed: None,
        },
    );

    // 5. Evolution, novelty, promotion
    let evolver = evolution::GenomeEvolver::new(
        store.clone(),
        space.clone(),
        evolution::EvolverConfig {
            population_size: cfg.population_size,
            elite_k: cfg.elite_k,
            tournament_size: cfg.tournament_size,
            crossover_rate: cfg.crossover_rate,
            mutation_rate: cfg.mutation_rate,
            mutation_sigma: cfg.mutation_sigma,
            quarantine_generations: cfg.quarantine_generations,
            max_error_rate: space.caps.max_error_rate,
        },
        None,
    );
    let archive = novelty::NoveltyArchive::new(cfg.archive_capacity, cfg.novelty_k);
    let promoter = tournament::TournamentPromoter::new(
        store.clone(),
        artifacts.clone(),
        baselines.clone(),
        instances.clone(),
        tournament::PromoterConfig {
            keep_threshold: cfg.promote_keep_threshold,
            rollback_threshold: cfg.promote_rollback_threshold,
            signing_key: cfg.signing_key.clone(),
        },
    );

    // 6. Scheduler & shutdown signal
    let shutdown = Arc::new(Notify::new());
    let bus = events::EventBus::new(pool.clone());
    let mut scheduler = phase::PhaseSyncScheduler::new(
        cfg,
        evolver,
        evaluator,
        artifacts,
        baselines,
        archive,
        promoter,
        instances,
        bus,
        shutdown.clone(),
    );

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("🛑 Ctrl-C received. Stopping optimizer...");
            shutdown.notify_waiters();
        }
    });

    info!("🚀 Spica optimizer is running");
    scheduler.run().await
}
