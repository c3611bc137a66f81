//! Reciprocal Rank Fusion (RRF) for hybrid search.
//!
//! RRF aggregates ranked lists from multiple retrieval systems without score
//! normalization:
//!
//! ```text
//! RRF_score(d) = sum(1 / (k + rank_r(d)))
//! ```
//!
//! where `k` dampens the contribution of top ranks (60 is the standard
//! constant from Cormack, Clarke & Buettcher 2009) and `rank_r(d)` is the
//! 1-indexed position of `d` in ranking `r`.

use crate::models::ObservationId;
use std::collections::HashMap;

/// Configuration for RRF fusion.
#[derive(Debug, Clone, Copy)]
pub struct RrfConfig {
    /// The k constant; higher values flatten rank differences.
    pub k: f32,
    /// Maximum fused results returned.
    pub limit: usize,
}

impl Default for RrfConfig {
    fn default() -> Self {
        Self { k: 60.0, limit: 10 }
    }
}

impl RrfConfig {
    /// Creates a configuration with the specified limit.
    #[must_use]
    pub const fn with_limit(limit: usize) -> Self {
        Self { k: 60.0, limit }
    }
}

/// Fuses ranked id lists; ties broken by `recency` (higher wins).
///
/// Each input list is ordered best-first. The output is ordered by fused
/// score descending, then recency descending.
#[must_use]
pub fn fuse(
    rankings: &[Vec<ObservationId>],
    recency: &HashMap<ObservationId, i64>,
    config: RrfConfig,
) -> Vec<(ObservationId, f32)> {
    let mut scores: HashMap<ObservationId, f32> = HashMap::new();
    for ranking in rankings {
        for (index, id) in ranking.iter().enumerate() {
            let rank = index as f32 + 1.0;
            *scores.entry(id.clone()).or_insert(0.0) += 1.0 / (config.k + rank);
        }
    }

    let mut fused: Vec<(ObservationId, f32)> = scores.into_iter().collect();
    fused.sort_by(|a, b| {
        b.1.total_cmp(&a.1).then_with(|| {
            let ra = recency.get(&a.0).copied().unwrap_or(0);
            let rb = recency.get(&b.0).copied().unwrap_or(0);
            rb.cmp(&ra)
        })
    });
    fused.truncate(config.limit);
    fused
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ObservationId {
        ObservationId::from(s)
    }

    #[test]
    fn document_in_both_rankings_wins() {
        let keyword = vec![id("a"), id("b"), id("c")];
        let vector = vec![id("b"), id("d")];
        let fused = fuse(&[keyword, vector], &HashMap::new(), RrfConfig::default());
        assert_eq!(fused[0].0, id("b"));
    }

    #[test]
    fn ties_break_by_recency() {
        let keyword = vec![id("old")];
        let vector = vec![id("new")];
        let recency = HashMap::from([(id("old"), 100), (id("new"), 200)]);
        let fused = fuse(&[keyword, vector], &recency, RrfConfig::default());
        // Both rank 1 in one list each: identical score, newer first.
        assert_eq!(fused[0].0, id("new"));
    }

    #[test]
    fn limit_is_enforced() {
        let ranking: Vec<ObservationId> = (0..20).map(|i| id(&format!("d{i}"))).collect();
        let fused = fuse(&[ranking], &HashMap::new(), RrfConfig::with_limit(5));
        assert_eq!(fused.len(), 5);
    }

    #[test]
    fn scores_follow_the_formula() {
        let ranking = vec![id("a"), id("b")];
        let fused = fuse(&[ranking], &HashMap::new(), RrfConfig::default());
        assert!((fused[0].1 - 1.0 / 61.0).abs() < 1e-6);
        assert!((fused[1].1 - 1.0 / 62.0).abs() < 1e-6);
    }
}
