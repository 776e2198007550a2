//! Bounded novelty archive: k-nearest-neighbor diversity scoring with a
//! Pareto admission rule on (fitness, novelty). Advisory input to selection,
//! never a hard gate.

use tracing::debug;

use spica_shared::model::NoveltyRecord;

pub struct NoveltyArchive {
    capacity: usize,
    k: usize,
    records: Vec<NoveltyRecord>,
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// Pareto dominance on (fitness, novelty): `a` dominates `b` when it is at
/// least as good on both axes and strictly better on one.
fn dominates(a: &NoveltyRecord, b: &NoveltyRecord) -> bool {
    let ge = a.fitness >= b.fitness && a.novelty_score >= b.novelty_score;
    let gt = a.fitness > b.fitness || a.novelty_score > b.novelty_score;
    ge && gt
}

impl NoveltyArchive {
    #[must_use]
    pub fn new(capacity: usize, k: usize) -> Self {
        Self {
            capacity,
            k: k.max(1),
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mean Euclidean distance to the k nearest stored descriptors.
    /// 0.0 if the descriptor already exists verbatim; for an empty archive
    /// everything is maximally novel.
    #[must_use]
    pub fn score(&self, descriptor: &[f64]) -> f64 {
        if self.records.is_empty() {
            return 1.0;
        }
        if self
            .records
            .iter()
            .any(|r| r.behavior_descriptor == descriptor)
        {
            return 0.0;
        }
        let mut distances: Vec<f64> = self
            .records
            .iter()
            .map(|r| euclidean(&r.behavior_descriptor, descriptor))
            .collect();
        distances.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        distances.truncate(self.k);
        distances.iter().sum::<f64>() / distances.len() as f64
    }

    /// Members not dominated by any other member.
    #[must_use]
    pub fn pareto_frontier(&self) -> Vec<&NoveltyRecord> {
        self.records
            .iter()
            .filter(|r| !self.records.iter().any(|other| dominates(other, r)))
            .collect()
    }

    /// Insert if below capacity or non-dominated against the frontier; at
    /// capacity, evict the weakest dominated record (or the lowest-novelty
    /// record when nothing is dominated). Returns true when admitted.
    pub fn consider(&mut self, record: NoveltyRecord) -> bool {
        if self.records.len() < self.capacity {
            self.records.push(record);
            return true;
        }

        let dominated_by_frontier = self
            .pareto_frontier()
            .iter()
            .any(|member| dominates(member, &record));
        if dominated_by_frontier {
            debug!(genome_id = %record.genome_id, "Novelty record rejected (dominated)");
            return false;
        }

        // Prefer evicting something the newcomer dominates; otherwise drop
        // the globally least novel record.
        let victim = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| dominates(&record, r))
            .min_by(|(_, a), (_, b)| {
                a.novelty_score
                    .partial_cmp(&b.novelty_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|(i, _)| i)
            .or_else(|| {
                self.records
                    .iter()
                    .enumerate()
                    .min_by(|(_, a), (_, b)| {
                        a.novelty_score
                            .partial_cmp(&b.novelty_score)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .map(|(i, _)| i)
            });

        if let Some(i) = victim {
            self.records.swap_remove(i);
            self.records.push(record);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use spica_shared::SpicaId;

    fn record(descriptor: Vec<f64>, fitness: f64, novelty: f64) -> NoveltyRecord {
        NoveltyRecord {
            genome_id: SpicaId::new(),
            behavior_descriptor: descriptor,
            novelty_score: novelty,
            fitness,
            inserted_at: Utc::now(),
        }
    }

    #[test]
    fn test_verbatim_descriptor_scores_zero() {
        let mut archive = NoveltyArchive::new(10, 3);
        archive.consider(record(vec![0.1, 0.2], 0.5, 0.5));
        assert!((archive.score(&[0.1, 0.2]) - 0.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_archive_is_maximally_novel() {
        let archive = NoveltyArchive::new(10, 3);
        assert!((archive.score(&[0.5, 0.5]) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_score_is_mean_of_k_nearest() {
        let mut archive = NoveltyArchive::new(10, 2);
        archive.consider(record(vec![0.0], 0.5, 0.5));
        archive.consider(record(vec![1.0], 0.5, 0.5));
        archive.consider(record(vec![10.0], 0.5, 0.5));
        // Nearest two to 0.5 are 0.0 and 1.0, both at distance 0.5
        assert!((archive.score(&[0.5]) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_capacity_is_bounded() {
        let mut archive = NoveltyArchive::new(3, 2);
        for i in 0..10 {
            archive.consider(record(vec![i as f64], 0.5, i as f64 / 10.0));
        }
        assert_eq!(archive.len(), 3);
    }

    #[test]
    fn test_dominated_newcomer_rejected_at_capacity() {
        let mut archive = NoveltyArchive::new(2, 2);
        archive.consider(record(vec![0.0], 0.9, 0.9));
        archive.consider(record(vec![1.0], 0.8, 0.8));
        // Strictly worse than both members on both axes
        assert!(!archive.consider(record(vec![2.0], 0.1, 0.1)));
        assert_eq!(archive.len(), 2);
    }

    #[test]
    fn test_dominating_newcomer_evicts_weakest() {
        let mut archive = NoveltyArchive::new(2, 2);
        archive.consider(record(vec![0.0], 0.9, 0.9));
        archive.consider(record(vec![1.0], 0.2, 0.2));
        assert!(archive.consider(record(vec![2.0], 0.95, 0.95)));
        assert_eq!(archive.len(), 2);
        // The weak (0.2, 0.2) record is the one that went
        assert!(archive
            .records
            .iter()
            .all(|r| r.fitness > 0.5 && r.novelty_score > 0.5));
    }
}
