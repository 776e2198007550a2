//! Ingestion bridge between the nightly batch evaluator's report and the
//! optimizer's own state: the batch KPI means refresh per-regime baselines
//! and feed the novelty archive a coarse behavior descriptor.

use chrono::Utc;
use std::collections::BTreeMap;
use tracing::{info, warn};

use spica_shared::model::{
    Baseline, BatchRegimeReport, BatchReport, FitnessVector, NoveltyRecord, PRIMARY_METRIC,
};
use spica_shared::{SpicaEventData, SpicaId};

use crate::baseline::BaselineTracker;
use crate::novelty::NoveltyArchive;
use crate::stats;

/// Map one batch regime block onto the six fitness dimensions. The batch
/// evaluator reports the same KPI vocabulary the workloads do; anything it
/// leaves out lands at the dimension's neutral value.
#[must_use]
pub fn report_to_dimensions(report: &BatchRegimeReport) -> FitnessVector {
    let get = |k: &str| report.kpi_means.get(k).copied().unwrap_or(0.0);
    FitnessVector {
        performance: stats::regime_composite(&report.kpi_means).clamp(0.0, 1.0),
        stability: report
            .kpi_means
            .get("stability")
            .copied()
            .unwrap_or(1.0)
            .clamp(0.0, 1.0),
        drawdown: get("drawdown"),
        turnover: get("turnover"),
        correlation: get("correlation"),
        risk: get("risk"),
    }
}

/// Ingest a batch report: reconcile each (domain, regime) baseline against
/// the aggregate means and offer each block's descriptor to the novelty
/// archive. A block only displaces an existing baseline when its primary
/// metric mean is strictly better; the displaced baseline goes onto the
/// history stack. Individual bad blocks are skipped, never fatal.
pub async fn ingest_report(
    report: &BatchReport,
    baselines: &BaselineTracker,
    archive: &mut NoveltyArchive,
) -> anyhow::Result<Vec<SpicaEventData>> {
    let mut events = Vec::new();
    for block in &report.regimes {
        if block.sample_count == 0 || block.kpi_means.is_empty() {
            warn!(
                domain = %block.domain,
                regime = %block.regime,
                "Skipping empty batch report block"
            );
            continue;
        }

        let source_genome = block.source_genome_id.unwrap_or_else(SpicaId::new);
        let means: BTreeMap<String, f64> = block
            .kpi_means
            .iter()
            .filter(|(_, v)| v.is_finite())
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        match baselines.current(&block.domain, &block.regime).await? {
            None => {
                let baseline = baselines
                    .establish(&block.domain, &block.regime, means, source_genome)
                    .await?;
                events.push(SpicaEventData::BaselineEstablished {
                    domain: block.domain.clone(),
                    regime: block.regime.clone(),
                    baseline_id: baseline.baseline_id,
                });
            }
            Some(current) => {
                // Batch sample counts are large enough that comparing means
                // stands in for the per-trial confidence-interval check.
                let incumbent = current
                    .metric_means
                    .get(PRIMARY_METRIC)
                    .copied()
                    .unwrap_or(0.0);
                let candidate = means.get(PRIMARY_METRIC).copied().unwrap_or(0.0);
                if candidate > incumbent {
                    let baseline = Baseline {
                        baseline_id: SpicaId::new(),
                        domain: block.domain.clone(),
                        regime: block.regime.clone(),
                        metric_means: means,
                        established_at: Utc::now(),
                        source_genome_id: source_genome,
                    };
                    baselines.promote(baseline.clone()).await?;
                    events.push(SpicaEventData::BaselinePromoted {
                        domain: block.domain.clone(),
                        regime: block.regime.clone(),
                        baseline_id: baseline.baseline_id,
                    });
                }
            }
        }

        let dims = report_to_dimensions(block);
        let descriptor = dims.descriptor();
        let novelty_score = archive.score(&descriptor);
        archive.consider(NoveltyRecord {
            genome_id: source_genome,
            behavior_descriptor: descriptor,
            novelty_score,
            fitness: dims.performance,
            inserted_at: Utc::now(),
        });
    }
    info!(
        blocks = report.regimes.len(),
        baseline_updates = events.len(),
        "Batch report ingested"
    );
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_db, SqliteDataStore};
    use sqlx::SqlitePool;
    use std::sync::Arc;

    async fn tracker() -> BaselineTracker {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        init_db(&pool, "sqlite::memory:").await.unwrap();
        BaselineTracker::new(Arc::new(SqliteDataStore::new(pool)))
    }

    fn report(blocks: Vec<BatchRegimeReport>) -> BatchReport {
        BatchReport {
            schema_version: 1,
            completed_at: Utc::now(),
            regimes: blocks,
        }
    }

    fn block(performance: f64, samples: u64) -> BatchRegimeReport {
        let mut kpi_means = BTreeMap::new();
        kpi_means.insert("performance".to_string(), performance);
        kpi_means.insert("latency_p95".to_string(), 0.1);
        BatchRegimeReport {
            domain: "inference".to_string(),
            regime: "normal".to_string(),
            kpi_means,
            sample_count: samples,
            source_genome_id: None,
        }
    }

    #[test]
    fn test_dimensions_apply_latency_penalty() {
        let dims = report_to_dimensions(&block(0.8, 100));
        assert!((dims.performance - (0.8 - 0.3 * 0.1)).abs() < 1e-9);
        // No reported stability defaults to neutral.
        assert!((dims.stability - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_block_maps_to_zeroes() {
        let empty = BatchRegimeReport {
            domain: "inference".to_string(),
            regime: "normal".to_string(),
            kpi_means: BTreeMap::new(),
            sample_count: 0,
            source_genome_id: None,
        };
        let dims = report_to_dimensions(&empty);
        assert!((dims.performance - 0.0).abs() < f64::EPSILON);
        assert!((dims.risk - 0.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_first_report_establishes_baseline() {
        let baselines = tracker().await;
        let mut archive = NoveltyArchive::new(8, 2);
        let events = ingest_report(&report(vec![block(0.7, 100)]), &baselines, &mut archive)
            .await
            .unwrap();
        assert!(matches!(
            events[0],
            SpicaEventData::BaselineEstablished { .. }
        ));
        let current = baselines.current("inference", "normal").await.unwrap();
        assert!(current.is_some());
    }

    #[tokio::test]
    async fn test_worse_report_does_not_displace_baseline() {
        let baselines = tracker().await;
        let mut archive = NoveltyArchive::new(8, 2);
        let mut means = BTreeMap::new();
        means.insert("performance".to_string(), 0.9);
        baselines
            .establish("inference", "normal", means, SpicaId::new())
            .await
            .unwrap();

        let events = ingest_report(&report(vec![block(0.2, 100)]), &baselines, &mut archive)
            .await
            .unwrap();
        assert!(events.is_empty());
        let current = baselines
            .current("inference", "normal")
            .await
            .unwrap()
            .unwrap();
        assert!((current.metric_means["performance"] - 0.9).abs() < f64::EPSILON);
        // Nothing was pushed onto history either.
        assert!(baselines
            .restore_previous("inference", "normal")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_better_report_promotes_and_keeps_history() {
        let baselines = tracker().await;
        let mut archive = NoveltyArchive::new(8, 2);
        let mut means = BTreeMap::new();
        means.insert("performance".to_string(), 0.3);
        baselines
            .establish("inference", "normal", means, SpicaId::new())
            .await
            .unwrap();

        let events = ingest_report(&report(vec![block(0.8, 100)]), &baselines, &mut archive)
            .await
            .unwrap();
        assert!(matches!(events[0], SpicaEventData::BaselinePromoted { .. }));
        // The displaced 0.3 baseline is recoverable.
        let restored = baselines
            .restore_previous("inference", "normal")
            .await
            .unwrap()
            .unwrap();
        assert!((restored.metric_means["performance"] - 0.3).abs() < f64::EPSILON);
    }
}
