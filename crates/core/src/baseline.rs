//! Per-(domain, regime) baseline tracking: exactly one current baseline per
//! pair, superseded atomically, with a bounded history so a promotion
//! rollback can restore the previous reference.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use spica_shared::model::Baseline;
use spica_shared::{OptimizerStore, SpicaId};

const BASELINE_STORE_NS: &str = "core.baseline";

/// Baselines kept per (domain, regime) after supersession.
const MAX_BASELINE_HISTORY: usize = 20;

pub struct BaselineTracker {
    store: Arc<dyn OptimizerStore>,
}

impl BaselineTracker {
    #[must_use]
    pub fn new(store: Arc<dyn OptimizerStore>) -> Self {
        Self { store }
    }

    fn key_current(domain: &str, regime: &str) -> String {
        format!("baseline:{domain}:{regime}:current")
    }

    fn key_history(domain: &str, regime: &str) -> String {
        format!("baseline:{domain}:{regime}:history")
    }

    pub async fn current(&self, domain: &str, regime: &str) -> anyhow::Result<Option<Baseline>> {
        let key = Self::key_current(domain, regime);
        match self.store.get_json(BASELINE_STORE_NS, &key).await? {
            Some(val) => Ok(Some(serde_json::from_value(val)?)),
            None => Ok(None),
        }
    }

    /// First successful trial set for a pair becomes the baseline (missing
    /// baseline is not an error). Returns the established baseline.
    pub async fn establish(
        &self,
        domain: &str,
        regime: &str,
        metric_means: BTreeMap<String, f64>,
        source_genome_id: SpicaId,
    ) -> anyhow::Result<Baseline> {
        let baseline = Baseline {
            baseline_id: SpicaId::new(),
            domain: domain.to_string(),
            regime: regime.to_string(),
            metric_means,
            established_at: Utc::now(),
            source_genome_id,
        };
        let key = Self::key_current(domain, regime);
        self.store
            .set_json(BASELINE_STORE_NS, &key, serde_json::to_value(&baseline)?)
            .await?;
        info!(
            domain = %domain,
            regime = %regime,
            baseline_id = %baseline.baseline_id,
            "Baseline established"
        );
        Ok(baseline)
    }

    /// Atomically supersede the current baseline with a confirmed
    /// improvement, pushing the old one onto the history.
    pub async fn promote(&self, new_baseline: Baseline) -> anyhow::Result<()> {
        let domain = new_baseline.domain.clone();
        let regime = new_baseline.regime.clone();

        if let Some(old) = self.current(&domain, &regime).await? {
            let key = Self::key_history(&domain, &regime);
            let mut history: Vec<Baseline> = match self.store.get_json(BASELINE_STORE_NS, &key).await? {
                Some(val) => serde_json::from_value(val)?,
                None => vec![],
            };
            history.push(old);
            if history.len() > MAX_BASELINE_HISTORY {
                history = history.split_off(history.len() - MAX_BASELINE_HISTORY);
            }
            self.store
                .set_json(BASELINE_STORE_NS, &key, serde_json::to_value(&history)?)
                .await?;
        }

        let key = Self::key_current(&domain, &regime);
        self.store
            .set_json(BASELINE_STORE_NS, &key, serde_json::to_value(&new_baseline)?)
            .await?;
        info!(
            domain = %domain,
            regime = %regime,
            baseline_id = %new_baseline.baseline_id,
            "📈 Baseline promoted"
        );
        Ok(())
    }

    /// Restore the most recently superseded baseline (promotion rollback).
    /// Returns the restored baseline, or None if no history exists.
    pub async fn restore_previous(
        &self,
        domain: &str,
        regime: &str,
    ) -> anyhow::Result<Option<Baseline>> {
        let key = Self::key_history(domain, regime);
        let mut history: Vec<Baseline> = match self.store.get_json(BASELINE_STORE_NS, &key).await? {
            Some(val) => serde_json::from_value(val)?,
            None => return Ok(None),
        };
        let Some(previous) = history.pop() else {
            return Ok(None);
        };
        self.store
            .set_json(BASELINE_STORE_NS, &key, serde_json::to_value(&history)?)
            .await?;
        let current_key = Self::key_current(domain, regime);
        self.store
            .set_json(
                BASELINE_STORE_NS,
                &current_key,
                serde_json::to_value(&previous)?,
            )
            .await?;
        info!(
            domain = %domain,
            regime = %regime,
            baseline_id = %previous.baseline_id,
            "🔄 Previous baseline restored"
        );
        Ok(Some(previous))
    }

    /// All current baselines, for status reporting.
    pub async fn list_current(&self) -> anyhow::Result<Vec<Baseline>> {
        let rows = self.store.get_prefix(BASELINE_STORE_NS, "baseline:").await?;
        let mut baselines = Vec::new();
        for (key, val) in rows {
            if key.ends_with(":current") {
                baselines.push(serde_json::from_value(val)?);
            }
        }
        Ok(baselines)
    }
}

/// Improvement deltas of a trial batch against a baseline. Metrics missing
/// from the baseline report a delta of zero.
#[must_use]
pub fn deltas_against(
    baseline: &Baseline,
    metric_means: &BTreeMap<String, f64>,
) -> BTreeMap<String, f64> {
    metric_means
        .iter()
        .map(|(name, mean)| {
            let reference = baseline.metric_means.get(name).copied().unwrap_or(*mean);
            (name.clone(), mean - reference)
        })
        .collect()
}
