//! Node scoring for stand placement
//!
//! Higher scores mean more headroom. The score of a node only depends on its
//! (possibly projected) [`NodeMetrics`], so the greedy assignment can
//! re-score a node after every placement without asking the cluster again.

use super::metrics::NodeMetrics;

/// Weight configuration for node scoring
///
/// Weights should sum to approximately 1.0.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    /// Weight for the inverse VM count (default: 0.30)
    pub vm_count: f64,
    /// Weight for CPU headroom (default: 0.25)
    pub cpu: f64,
    /// Weight for memory headroom (default: 0.25)
    pub memory: f64,
    /// Weight for available storage (default: 0.20)
    pub storage: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            vm_count: 0.30,
            cpu: 0.25,
            memory: 0.25,
            storage: 0.20,
        }
    }
}

impl ScoringWeights {
    pub fn new(vm_count: f64, cpu: f64, memory: f64, storage: f64) -> Self {
        Self {
            vm_count,
            cpu,
            memory,
            storage,
        }
    }
}

/// Raw score of a node: `w_vm/(1+vm) + w_cpu/(1+cpu) + w_mem/(1+mem) + w_sto*storage/100`
pub fn calculate_node_score(metrics: &NodeMetrics, weights: &ScoringWeights) -> f64 {
    weights.vm_count / (1.0 + metrics.vm_count as f64)
        + weights.cpu / (1.0 + metrics.cpu)
        + weights.memory / (1.0 + metrics.memory)
        + weights.storage * metrics.storage / 100.0
}

/// Scale scores so they sum to 1.0. All-zero input is returned unchanged.
pub fn normalize(scores: &[f64]) -> Vec<f64> {
    let total: f64 = scores.iter().sum();
    if total <= 0.0 {
        return scores.to_vec();
    }
    scores.iter().map(|s| s / total).collect()
}

/// Index of the best eligible score; ties go to the earliest index
pub fn best_candidate(scores: &[f64], eligible: &[bool]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, score) in scores.iter().enumerate() {
        if !eligible.get(i).copied().unwrap_or(false) {
            continue;
        }
        match best {
            Some(b) if scores[b] >= *score => {}
            _ => best = Some(i),
        }
    }
    best
}
