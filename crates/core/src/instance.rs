//! Standardized test instances with tamper-evident lineage.
//!
//! Every instance carries an append-only chain of HMAC-signed lineage
//! entries; each entry binds to its predecessor's hash, so truncation or
//! in-place edits are detectable from the first corrupted link onward.
//! Spawning and configuration changes fail closed when no signing key is
//! configured.

use chrono::{Duration, Utc};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use spica_shared::model::{InstanceState, LineageEntry, SpicaInstance};
use spica_shared::sign;
use spica_shared::{OptimizerStore, SpicaError, SpicaEventData, SpicaId};

const INSTANCE_STORE_NS: &str = "core.instance";
pub const MANIFESTS_DIR: &str = "manifests";
pub const TELEMETRY_DIR: &str = "telemetry";

fn key_instance(id: SpicaId) -> String {
    format!("instance:{id}")
}

pub struct InstanceManagerConfig {
    pub data_dir: PathBuf,
    /// Spawn/update fail closed without it.
    pub signing_key: Option<Vec<u8>>,
    pub prune_after_days: i64,
    pub min_instances: usize,
}

pub struct SpicaInstanceManager {
    store: Arc<dyn OptimizerStore>,
    cfg: InstanceManagerConfig,
    /// Per-instance append locks so two config updates cannot interleave
    /// their chain reads and writes.
    chain_locks: DashMap<SpicaId, Arc<Mutex<()>>>,
}

impl SpicaInstanceManager {
    pub fn new(store: Arc<dyn OptimizerStore>, cfg: InstanceManagerConfig) -> Self {
        Self {
            store,
            cfg,
            chain_locks: DashMap::new(),
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        for dir in [MANIFESTS_DIR, TELEMETRY_DIR] {
            tokio::fs::create_dir_all(self.cfg.data_dir.join(dir)).await?;
        }
        Ok(())
    }

    fn signing_key(&self) -> Result<&[u8], SpicaError> {
        self.cfg
            .signing_key
            .as_deref()
            .ok_or_else(|| SpicaError::KeyUnavailable("SPICA_SIGNING_KEY is not set".to_string()))
    }

    fn chain_lock(&self, id: SpicaId) -> Arc<Mutex<()>> {
        self.chain_locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Lifecycle ──

    /// Spawn an instance from a configuration snapshot. Writes the manifest,
    /// signs the root lineage entry, and registers the instance.
    pub async fn spawn(
        &self,
        config_snapshot: serde_json::Value,
    ) -> anyhow::Result<(SpicaInstance, SpicaEventData)> {
        let key = self.signing_key()?.to_vec();
        let instance_id = SpicaId::new();
        let manifest_hash = sign::hash_json(&config_snapshot)?;

        let manifest_path = self
            .cfg
            .data_dir
            .join(MANIFESTS_DIR)
            .join(format!("{instance_id}.json"));
        crate::artifact::write_atomic(&manifest_path, &serde_json::to_vec_pretty(&config_snapshot)?)
            .await?;

        let root = make_entry(&key, "", &manifest_hash)?;
        let instance = SpicaInstance {
            instance_id,
            manifest_hash,
            config_snapshot,
            lineage_chain: vec![root],
            telemetry_ref: format!("{TELEMETRY_DIR}/{instance_id}.jsonl"),
            state: InstanceState::Spawned,
            created_at: Utc::now(),
        };
        self.save(&instance).await?;
        info!(instance_id = %instance_id, "Instance spawned");
        Ok((instance, SpicaEventData::InstanceSpawned { instance_id }))
    }

    pub async fn get(&self, instance_id: SpicaId) -> anyhow::Result<Option<SpicaInstance>> {
        match self
            .store
            .get_json(INSTANCE_STORE_NS, &key_instance(instance_id))
            .await?
        {
            Some(val) => Ok(Some(serde_json::from_value(val)?)),
            None => Ok(None),
        }
    }

    pub async fn list(&self) -> anyhow::Result<Vec<SpicaInstance>> {
        let rows = self.store.get_prefix(INSTANCE_STORE_NS, "instance:").await?;
        let mut instances = Vec::with_capacity(rows.len());
        for (_, val) in rows {
            instances.push(serde_json::from_value(val)?);
        }
        instances.sort_by_key(|i: &SpicaInstance| (i.created_at, i.instance_id));
        Ok(instances)
    }

    /// Apply a new configuration to an instance, appending a signed lineage
    /// entry. The previous chain must verify in full first.
    pub async fn update_config(
        &self,
        instance_id: SpicaId,
        config_snapshot: serde_json::Value,
    ) -> anyhow::Result<SpicaInstance> {
        let key = self.signing_key()?.to_vec();
        let lock = self.chain_lock(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self
            .get(instance_id)
            .await?
            .ok_or_else(|| SpicaError::Internal(format!("unknown instance {instance_id}")))?;
        if instance.state == InstanceState::Pruned {
            anyhow::bail!("instance {} is pruned and cannot be reconfigured", instance_id);
        }

        let valid = sign::verify_lineage_chain(&key, &instance.lineage_chain)?;
        if valid != instance.lineage_chain.len() {
            return Err(SpicaError::Integrity(format!(
                "lineage chain for instance {} valid only through entry {}",
                instance_id, valid
            ))
            .into());
        }

        let manifest_hash = sign::hash_json(&config_snapshot)?;
        let parent_hash = instance
            .lineage_chain
            .last()
            .map(|e| e.entry_hash.clone())
            .unwrap_or_default();
        let entry = make_entry(&key, &parent_hash, &manifest_hash)?;

        let manifest_path = self
            .cfg
            .data_dir
            .join(MANIFESTS_DIR)
            .join(format!("{instance_id}.json"));
        crate::artifact::write_atomic(&manifest_path, &serde_json::to_vec_pretty(&config_snapshot)?)
            .await?;

        instance.manifest_hash = manifest_hash;
        instance.config_snapshot = config_snapshot;
        instance.lineage_chain.push(entry);
        instance.state = InstanceState::Retained;
        self.save(&instance).await?;
        info!(
            instance_id = %instance_id,
            chain_len = instance.lineage_chain.len(),
            "Instance configuration updated"
        );
        Ok(instance)
    }

    /// Number of valid leading lineage entries for an instance.
    pub async fn verify_lineage(&self, instance_id: SpicaId) -> anyhow::Result<(usize, usize)> {
        let key = self.signing_key()?;
        let instance = self
            .get(instance_id)
            .await?
            .ok_or_else(|| SpicaError::Internal(format!("unknown instance {instance_id}")))?;
        let valid = sign::verify_lineage_chain(key, &instance.lineage_chain)?;
        if valid != instance.lineage_chain.len() {
            warn!(
                instance_id = %instance_id,
                valid = valid,
                total = instance.lineage_chain.len(),
                "Lineage chain partially invalid"
            );
        }
        Ok((valid, instance.lineage_chain.len()))
    }

    // ── Telemetry ──

    /// Append one JSON line to the instance's telemetry file. Append-only;
    /// nothing ever rewrites earlier lines.
    pub async fn append_telemetry(
        &self,
        instance_id: SpicaId,
        record: &serde_json::Value,
    ) -> anyhow::Result<()> {
        let instance = self
            .get(instance_id)
            .await?
            .ok_or_else(|| SpicaError::Internal(format!("unknown instance {instance_id}")))?;
        let path = self.cfg.data_dir.join(&instance.telemetry_ref);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        Ok(())
    }

    // ── Pruning ──

    /// Prune instances older than the retention window, oldest first, never
    /// dropping below the configured floor. Pruned instances keep their
    /// manifests and telemetry; only the state flips.
    pub async fn prune_stale(&self) -> anyhow::Result<Vec<SpicaEventData>> {
        let cutoff = Utc::now() - Duration::days(self.cfg.prune_after_days);
        let instances = self.list().await?;
        let mut alive: Vec<&SpicaInstance> = instances
            .iter()
            .filter(|i| i.state != InstanceState::Pruned)
            .collect();
        // list() orders by (created_at, instance_id), oldest first.
        let mut events = Vec::new();
        while alive.len() > self.cfg.min_instances {
            let oldest = alive[0];
            if oldest.created_at >= cutoff {
                break;
            }
            let mut pruned = oldest.clone();
            pruned.state = InstanceState::Pruned;
            self.save(&pruned).await?;
            info!(instance_id = %pruned.instance_id, "Instance pruned");
            events.push(SpicaEventData::InstancePruned {
                instance_id: pruned.instance_id,
            });
            alive.remove(0);
        }
        Ok(events)
    }

    async fn save(&self, instance: &SpicaInstance) -> anyhow::Result<()> {
        self.store
            .set_json(
                INSTANCE_STORE_NS,
                &key_instance(instance.instance_id),
                serde_json::to_value(instance)?,
            )
            .await
    }
}

fn make_entry(key: &[u8], parent_hash: &str, entry_hash: &str) -> anyhow::Result<LineageEntry> {
    let hmac_signature = sign::sign_lineage_entry(key, parent_hash, entry_hash)?;
    Ok(LineageEntry {
        parent_hash: parent_hash.to_string(),
        entry_hash: entry_hash.to_string(),
        hmac_signature,
        timestamp: Utc::now(),
    })
}
