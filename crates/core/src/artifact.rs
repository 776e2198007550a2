//! Durable artifacts under the data directory: candidate packs, promotion
//! bundles, batch signal markers, and the batch report.
//!
//! Every write goes through a temp-file-and-rename so readers never observe
//! a half-written artifact. Packs are verified against their content hash on
//! read; a mismatch rejects the artifact instead of repairing it.

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use spica_shared::model::{AckStatus, BatchReport, CandidatePack, PromotionBundle};
use spica_shared::{SpicaError, SpicaId};

pub const PACKS_DIR: &str = "packs";
pub const PROMOTIONS_DIR: &str = "promotions";
pub const SIGNALS_DIR: &str = "signals";
pub const BATCH_DONE_SIGNAL: &str = "batch_done.signal";
pub const BATCH_REPORT_FILE: &str = "batch_report.json";

pub struct ArtifactStore {
    data_dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub async fn init(&self) -> anyhow::Result<()> {
        for dir in [PACKS_DIR, PROMOTIONS_DIR, SIGNALS_DIR] {
            tokio::fs::create_dir_all(self.data_dir.join(dir))
                .await
                .with_context(|| format!("Failed to create artifact dir '{dir}'"))?;
        }
        Ok(())
    }

    fn pack_path(&self, genome_id: SpicaId) -> PathBuf {
        self.data_dir.join(PACKS_DIR).join(format!("{genome_id}.json"))
    }

    fn promotion_path(&self, tournament_id: SpicaId) -> PathBuf {
        self.data_dir
            .join(PROMOTIONS_DIR)
            .join(format!("{tournament_id}.json"))
    }

    // ── Candidate packs ──

    /// Persist a sealed pack. The content hash must already be in place.
    pub async fn write_pack(&self, pack: &CandidatePack) -> anyhow::Result<()> {
        if !pack.verify_content_hash()? {
            return Err(SpicaError::Integrity(format!(
                "refusing to write pack for genome {} with a stale content hash",
                pack.genome.id
            ))
            .into());
        }
        write_atomic(&self.pack_path(pack.genome.id), &serde_json::to_vec_pretty(pack)?).await
    }

    /// Read a pack back, verifying its content hash.
    pub async fn read_pack(&self, genome_id: SpicaId) -> anyhow::Result<CandidatePack> {
        let path = self.pack_path(genome_id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read pack {}", path.display()))?;
        let pack: CandidatePack = serde_json::from_slice(&bytes)?;
        if !pack.verify_content_hash()? {
            return Err(SpicaError::Integrity(format!(
                "content hash mismatch in pack {}",
                path.display()
            ))
            .into());
        }
        Ok(pack)
    }

    /// Genome ids of every stored pack.
    pub async fn list_packs(&self) -> anyhow::Result<Vec<SpicaId>> {
        let dir = self.data_dir.join(PACKS_DIR);
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = Path::new(&name).file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(id) = stem.parse::<SpicaId>() {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    // ── Promotion bundles ──

    /// Write-once: a bundle for an already-promoted tournament is an error.
    pub async fn write_promotion(&self, bundle: &PromotionBundle) -> anyhow::Result<()> {
        let path = self.promotion_path(bundle.tournament_id);
        if tokio::fs::try_exists(&path).await? {
            anyhow::bail!(
                "promotion bundle for tournament {} already exists",
                bundle.tournament_id
            );
        }
        write_atomic(&path, &serde_json::to_vec_pretty(bundle)?).await
    }

    pub async fn read_promotion(&self, tournament_id: SpicaId) -> anyhow::Result<PromotionBundle> {
        let path = self.promotion_path(tournament_id);
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read promotion {}", path.display()))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// `ack_status` is the one mutable field of a promotion bundle. The
    /// signed payload stays untouched.
    pub async fn update_ack_status(
        &self,
        tournament_id: SpicaId,
        status: AckStatus,
    ) -> anyhow::Result<PromotionBundle> {
        let mut bundle = self.read_promotion(tournament_id).await?;
        bundle.ack_status = status;
        write_atomic(
            &self.promotion_path(tournament_id),
            &serde_json::to_vec_pretty(&bundle)?,
        )
        .await?;
        Ok(bundle)
    }

    pub async fn list_promotions(&self) -> anyhow::Result<Vec<PromotionBundle>> {
        let dir = self.data_dir.join(PROMOTIONS_DIR);
        let mut bundles = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(entry.path()).await?;
            match serde_json::from_slice(&bytes) {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => warn!(
                    path = %entry.path().display(),
                    error = %e,
                    "Skipping unparseable promotion bundle"
                ),
            }
        }
        bundles.sort_by_key(|b: &PromotionBundle| b.created_at);
        Ok(bundles)
    }

    // ── Batch signal & report ──

    /// True if the nightly batch evaluator has signalled completion.
    pub async fn batch_signal_present(&self) -> anyhow::Result<bool> {
        let path = self.data_dir.join(SIGNALS_DIR).join(BATCH_DONE_SIGNAL);
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Consume the completion signal exactly once: the marker is renamed to
    /// `.consumed`, so a crash between read and resume cannot double-ingest.
    pub async fn consume_batch_signal(&self) -> anyhow::Result<bool> {
        let path = self.data_dir.join(SIGNALS_DIR).join(BATCH_DONE_SIGNAL);
        let consumed = path.with_extension("signal.consumed");
        match tokio::fs::rename(&path, &consumed).await {
            Ok(()) => {
                info!("Batch completion signal consumed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// The batch report, or None when it is missing or unparseable. Either
    /// way the caller resumes; a bad report only degrades ingestion.
    pub async fn read_batch_report(&self) -> Option<BatchReport> {
        let path = self.data_dir.join(SIGNALS_DIR).join(BATCH_REPORT_FILE);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Batch report unavailable");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Batch report unparseable");
                None
            }
        }
    }
}

/// Write bytes to `path` through a temp file in the same directory, then
/// rename into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("Artifact path {} has no parent", path.display()))?;
    let tmp = parent.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact")
    ));
    tokio::fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move {} into place", path.display()))?;
    Ok(())
}
