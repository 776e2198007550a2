//! Shared handles for CLI commands. The CLI reads the same SQLite database
//! and data directory the daemon writes; there is no network hop.

use anyhow::Context;
use sqlx::sqlite::SqliteConnectOptions;
use std::str::FromStr;
use std::sync::Arc;

use spica_core::artifact::ArtifactStore;
use spica_core::baseline::BaselineTracker;
use spica_core::config::AppConfig;
use spica_core::instance::{InstanceManagerConfig, SpicaInstanceManager};
use spica_core::tournament::{PromoterConfig, TournamentPromoter};
use spica_core::SqliteDataStore;
use spica_shared::OptimizerStore;

pub struct CliContext {
    pub cfg: AppConfig,
    pub store: Arc<dyn OptimizerStore>,
    pub artifacts: Arc<ArtifactStore>,
    pub baselines: Arc<BaselineTracker>,
    pub instances: Arc<SpicaInstanceManager>,
    pub promoter: TournamentPromoter,
}

impl CliContext {
    pub async fn open() -> anyhow::Result<Self> {
        let cfg = AppConfig::load()?;
        let opts = SqliteConnectOptions::from_str(&cfg.database_url)?;
        let pool = sqlx::SqlitePool::connect_with(opts)
            .await
            .with_context(|| format!("Failed to open {}", cfg.database_url))?;

        let store: Arc<dyn OptimizerStore> = Arc::new(SqliteDataStore::new(pool));
        let artifacts = Arc::new(ArtifactStore::new(cfg.data_dir.clone()));
        let baselines = Arc::new(BaselineTracker::new(store.clone()));
        let instances = Arc::new(SpicaInstanceManager::new(
            store.clone(),
            InstanceManagerConfig {
                data_dir: cfg.data_dir.clone(),
                signing_key: cfg.signing_key.clone(),
                prune_after_days: cfg.prune_after_days,
                min_instances: cfg.min_instances,
            },
        ));
        let promoter = TournamentPromoter::new(
            store.clone(),
            artifacts.clone(),
            baselines.clone(),
            instances.clone(),
            PromoterConfig {
                keep_threshold: cfg.promote_keep_threshold,
                rollback_threshold: cfg.promote_rollback_threshold,
                signing_key: cfg.signing_key.clone(),
            },
        );
        Ok(Self {
            cfg,
            store,
            artifacts,
            baselines,
            instances,
            promoter,
        })
    }
}
