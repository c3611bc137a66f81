//! Curation agent: the periodic merge/dedup/decay/prune cycle.
//!
//! Each step is independently wrapped so a failure in one never prevents
//! later steps. Merges and prunes only ever soft-delete; staleness flags
//! are advisory and deprioritize without hiding.

use crate::embedding::{cosine_similarity, mean_vector};
use crate::models::{
    Classification, Kind, NewObservation, Observation, ObservationId,
};
use crate::storage::{
    DEGREE_HOTSPOT_FRACTION, DecayConfig, EmbeddingStore, GraphStore, ObservationStore, Storage,
    to_millis, token_jaccard,
};
use crate::{Error, Result};
use chrono::{Duration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;

/// Minimum contributing observations before a node's cluster is examined.
const MIN_CLUSTER_OBSERVATIONS: usize = 3;

/// Embedding cosine similarity for cluster membership.
const MERGE_COSINE_THRESHOLD: f32 = 0.95;

/// Token Jaccard fallback for cluster membership.
const MERGE_JACCARD_THRESHOLD: f32 = 0.85;

/// Observations shorter than this are low-value prune candidates.
const PRUNE_MIN_CONTENT_CHARS: usize = 20;

/// Age after which unlinked trivia is pruned.
const PRUNE_AGE_DAYS: i64 = 90;

/// Window of node updates examined for staleness.
const STALENESS_WINDOW_HOURS: i64 = 24;

/// Negation keywords marking a newer observation as superseding.
static NEGATION_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["not ", "no longer", "isn't", "doesn't", "won't", "never "]
});

/// Status-change keywords marking a newer observation as superseding.
static STATUS_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec!["removed", "deprecated", "deleted", "obsolete", "dropped", "retired"]
});

/// Explicit replacement phrasings.
static REPLACEMENT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"switched from .+ to ",
        r"migrated (from .+ )?to ",
        r"replaced .+ with ",
        r"moved (from .+ )?to ",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Per-cycle outcome counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct CurationStats {
    /// Observation clusters merged.
    pub clusters_merged: usize,
    /// Duplicate entity groups merged.
    pub entities_merged: usize,
    /// Edges pruned by degree enforcement.
    pub edges_pruned: usize,
    /// Staleness flags raised.
    pub staleness_flags: usize,
    /// Low-value observations soft-deleted.
    pub pruned: usize,
    /// Edges decayed or deleted.
    pub decayed: usize,
}

/// The periodic curation cycle.
pub struct CurationAgent {
    storage: Arc<Storage>,
    graph: GraphStore,
    embeddings: EmbeddingStore,
    decay: DecayConfig,
}

impl CurationAgent {
    /// Creates a curation agent.
    #[must_use]
    pub fn new(storage: Arc<Storage>, decay: DecayConfig) -> Self {
        Self {
            graph: GraphStore::new(Arc::clone(&storage)),
            embeddings: EmbeddingStore::new(Arc::clone(&storage)),
            storage,
            decay,
        }
    }

    /// Runs one curation cycle across every known project.
    ///
    /// Never fails: each step is wrapped, logged, and skipped on error.
    pub fn run_cycle(&self) -> CurationStats {
        let mut stats = CurationStats::default();
        let projects = match self.project_hashes() {
            Ok(projects) => projects,
            Err(e) => {
                tracing::warn!(error = %e, "curation project listing failed");
                return stats;
            },
        };

        for project in &projects {
            match self.merge_observation_clusters(project) {
                Ok(merged) => stats.clusters_merged += merged,
                Err(e) => tracing::warn!(project, error = %e, "cluster merge step failed"),
            }
            match self.dedupe_entities(project) {
                Ok(merged) => stats.entities_merged += merged,
                Err(e) => tracing::warn!(project, error = %e, "entity dedup step failed"),
            }
            match self.enforce_degree_caps(project) {
                Ok(pruned) => stats.edges_pruned += pruned,
                Err(e) => tracing::warn!(project, error = %e, "degree enforcement step failed"),
            }
            match self.flag_staleness(project) {
                Ok(flags) => stats.staleness_flags += flags,
                Err(e) => tracing::warn!(project, error = %e, "staleness step failed"),
            }
            match self.prune_low_value(project) {
                Ok(pruned) => stats.pruned += pruned,
                Err(e) => tracing::warn!(project, error = %e, "low-value prune step failed"),
            }
        }

        match self.graph.apply_temporal_decay(&self.decay) {
            Ok(decay) => stats.decayed = decay.updated + decay.deleted,
            Err(e) => tracing::warn!(error = %e, "temporal decay step failed"),
        }

        tracing::debug!(?stats, "curation cycle complete");
        stats
    }

    /// Step 1: merge near-identical observation clusters per graph node.
    ///
    /// Clusters require all-pairs similarity above the threshold; single
    /// linkage chains unrelated content together, so each candidate must
    /// match every existing member.
    fn merge_observation_clusters(&self, project: &str) -> Result<usize> {
        let mut merged_clusters = 0;
        for node in self
            .graph
            .nodes_with_min_observations(project, MIN_CLUSTER_OBSERVATIONS)?
        {
            let store = ObservationStore::new(Arc::clone(&self.storage), project.to_string());
            let mut alive: Vec<(Observation, Option<Vec<f32>>)> = Vec::new();
            for id in &node.observation_ids {
                if let Some(obs) = store.get(id)? {
                    let embedding = self.embeddings.get(id)?;
                    alive.push((obs, embedding));
                }
            }
            if alive.len() < MIN_CLUSTER_OBSERVATIONS {
                continue;
            }

            let Some(cluster) = find_cluster(&alive) else {
                continue;
            };
            let members: Vec<&(Observation, Option<Vec<f32>>)> =
                cluster.iter().map(|&i| &alive[i]).collect();

            let merged_id = self.write_merged(&store, &members)?;

            // The node keeps its other contributors plus the new summary row.
            let cluster_ids: Vec<&ObservationId> =
                members.iter().map(|(obs, _)| &obs.id).collect();
            let mut remaining: Vec<ObservationId> = node
                .observation_ids
                .iter()
                .filter(|id| !cluster_ids.contains(id))
                .cloned()
                .collect();
            remaining.push(merged_id.clone());
            self.graph.set_observation_ids(&node.id, &remaining)?;

            for (obs, _) in &members {
                store.soft_delete(&obs.id)?;
            }
            merged_clusters += 1;
            tracing::info!(
                node = node.name,
                merged = members.len(),
                into = %merged_id,
                "observation cluster merged"
            );
        }
        Ok(merged_clusters)
    }

    /// Writes the merged observation: concatenated summary, mean embedding,
    /// the merged ids recorded in the content trailer.
    fn write_merged(
        &self,
        store: &ObservationStore,
        members: &[&(Observation, Option<Vec<f32>>)],
    ) -> Result<ObservationId> {
        let summary: Vec<&str> = members.iter().map(|(obs, _)| obs.content.as_str()).collect();
        let ids: Vec<&str> = members.iter().map(|(obs, _)| obs.id.as_str()).collect();
        let content = format!(
            "{}\n\nMerged from: {}",
            summary.join("\n---\n"),
            ids.join(", ")
        );

        let merged = store.create_classified(
            NewObservation {
                session_id: None,
                title: members.iter().find_map(|(obs, _)| obs.title.clone()),
                content,
                source: "curation:merge".to_string(),
                kind: Some(members.first().map_or(Kind::Finding, |(obs, _)| obs.kind)),
            },
            Classification::Discovery,
        )?;

        let vectors: Vec<Vec<f32>> = members
            .iter()
            .filter_map(|(_, embedding)| embedding.clone())
            .collect();
        if let Some(mean) = mean_vector(&vectors) {
            self.embeddings.store(&merged.id, &mean)?;
            let model = members
                .iter()
                .find_map(|(obs, _)| obs.embedding_model.clone())
                .unwrap_or_else(|| "curation".to_string());
            ObservationStore::mark_embedded(&self.storage, &merged.id, &model)?;
        }
        Ok(merged.id)
    }

    /// Step 2: merge duplicate entity groups, keeping the node with the most
    /// contributing observations.
    fn dedupe_entities(&self, project: &str) -> Result<usize> {
        let mut merged = 0;
        for group in self.graph.find_duplicate_entities(project, None)? {
            let mut nodes = Vec::new();
            for id in &group.node_ids {
                if let Some(node) = self.graph.node_by_id(id)? {
                    nodes.push(node);
                }
            }
            if nodes.len() < 2 {
                continue;
            }
            nodes.sort_by_key(|n| std::cmp::Reverse(n.observation_ids.len()));
            let keep = nodes[0].id.clone();
            for node in &nodes[1..] {
                self.graph.merge_entities(&keep, &node.id)?;
                merged += 1;
            }
        }
        Ok(merged)
    }

    /// Step 3: prune nodes that crept above 90% of the degree cap.
    fn enforce_degree_caps(&self, project: &str) -> Result<usize> {
        let mut pruned = 0;
        for (node, _degree) in self
            .graph
            .nodes_near_cap(project, DEGREE_HOTSPOT_FRACTION)?
        {
            pruned += self
                .graph
                .enforce_max_degree(&node.id, crate::models::MAX_NODE_DEGREE)?;
        }
        Ok(pruned)
    }

    /// Step 4: advisory staleness flags on superseded observations.
    fn flag_staleness(&self, project: &str) -> Result<usize> {
        let since = Utc::now() - Duration::hours(STALENESS_WINDOW_HOURS);
        let store = ObservationStore::new(Arc::clone(&self.storage), project.to_string());
        let mut flags = 0;

        for node in self.graph.list_nodes(project, None, 10_000)? {
            if node.updated_at < since {
                continue;
            }
            let mut linked: Vec<Observation> = Vec::new();
            for id in &node.observation_ids {
                if let Some(obs) = store.get(id)? {
                    linked.push(obs);
                }
            }
            linked.sort_by_key(|obs| obs.created_at);

            for pair in linked.windows(2) {
                let (older, newer) = (&pair[0], &pair[1]);
                if let Some(reason) = supersedes(&older.content, &newer.content) {
                    if !self.graph.is_stale(&older.id)? {
                        self.graph.flag_stale(&older.id, &node.id, &newer.id, reason)?;
                        flags += 1;
                    }
                }
            }
        }
        Ok(flags)
    }

    /// Step 5: soft-delete short, old, unlinked, hook-captured trivia.
    fn prune_low_value(&self, project: &str) -> Result<usize> {
        let store = ObservationStore::new(Arc::clone(&self.storage), project.to_string());
        let cutoff = Utc::now() - Duration::days(PRUNE_AGE_DAYS);

        let linked = self.linked_observation_ids(project)?;
        let candidates = self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT id, content FROM observations
                     WHERE project_hash = ?1 AND deleted_at IS NULL
                       AND created_at < ?2 AND source LIKE 'hook:%'",
                )
                .map_err(|e| Error::storage("prepare_prune_candidates", e))?;
            let rows = stmt
                .query_map(
                    rusqlite::params![project, to_millis(cutoff)],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .map_err(|e| Error::storage("prune_candidates", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("prune_candidates", e))
        })?;

        let mut pruned = 0;
        for (id, content) in candidates {
            if content.chars().count() >= PRUNE_MIN_CONTENT_CHARS {
                continue;
            }
            let id = ObservationId::from(id);
            if linked.contains(&id) {
                continue;
            }
            if store.soft_delete(&id)? {
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    fn linked_observation_ids(&self, project: &str) -> Result<Vec<ObservationId>> {
        let mut linked = Vec::new();
        for node in self.graph.list_nodes(project, None, 10_000)? {
            linked.extend(node.observation_ids);
        }
        Ok(linked)
    }

    fn project_hashes(&self) -> Result<Vec<String>> {
        self.storage.with_conn(|conn| {
            let mut stmt = conn
                .prepare_cached("SELECT DISTINCT project_hash FROM observations")
                .map_err(|e| Error::storage("prepare_project_hashes", e))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| Error::storage("project_hashes", e))?;
            rows.collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::storage("project_hashes", e))
        })
    }
}

/// Finds one all-pairs-similar cluster among a node's observations.
///
/// Greedy: seed with each observation in turn and admit candidates similar
/// to every current member, by embedding cosine when both sides have
/// vectors, else token Jaccard.
fn find_cluster(observations: &[(Observation, Option<Vec<f32>>)]) -> Option<Vec<usize>> {
    for seed in 0..observations.len() {
        let mut cluster = vec![seed];
        for candidate in 0..observations.len() {
            if candidate == seed || cluster.contains(&candidate) {
                continue;
            }
            let matches_all = cluster
                .iter()
                .all(|&member| similar(&observations[member], &observations[candidate]));
            if matches_all {
                cluster.push(candidate);
            }
        }
        if cluster.len() >= MIN_CLUSTER_OBSERVATIONS {
            cluster.sort_unstable();
            return Some(cluster);
        }
    }
    None
}

fn similar(a: &(Observation, Option<Vec<f32>>), b: &(Observation, Option<Vec<f32>>)) -> bool {
    match (&a.1, &b.1) {
        (Some(va), Some(vb)) => cosine_similarity(va, vb) >= MERGE_COSINE_THRESHOLD,
        _ => token_jaccard(&a.0.content, &b.0.content) >= MERGE_JACCARD_THRESHOLD,
    }
}

/// Decides whether `newer` supersedes `older`; returns the reason.
fn supersedes(older: &str, newer: &str) -> Option<&'static str> {
    let older_lower = older.to_lowercase();
    let newer_lower = newer.to_lowercase();

    if REPLACEMENT_PATTERNS.iter().any(|p| p.is_match(&newer_lower)) {
        return Some("replacement pattern");
    }
    for keyword in STATUS_KEYWORDS.iter() {
        if newer_lower.contains(keyword) && !older_lower.contains(keyword) {
            return Some("status change");
        }
    }
    for keyword in NEGATION_KEYWORDS.iter() {
        if newer_lower.contains(keyword) && !older_lower.contains(keyword) {
            return Some("negation");
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeType;

    fn fixtures() -> (Arc<Storage>, CurationAgent, ObservationStore, GraphStore) {
        let storage = Storage::in_memory().unwrap();
        let agent = CurationAgent::new(Arc::clone(&storage), DecayConfig::default());
        let store = ObservationStore::new(Arc::clone(&storage), "p");
        let graph = GraphStore::new(Arc::clone(&storage));
        (storage, agent, store, graph)
    }

    fn seed_observation(store: &ObservationStore, content: &str) -> Observation {
        store
            .create(NewObservation {
                content: content.to_string(),
                source: "hook:Edit".to_string(),
                kind: Some(Kind::Change),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn cluster_merge_replaces_originals_with_summary() {
        let (storage, agent, store, graph) = fixtures();
        let embeddings = EmbeddingStore::new(Arc::clone(&storage));

        let mut ids = Vec::new();
        for i in 0..3 {
            let obs = seed_observation(&store, &format!("updated the retry limit, pass {i}"));
            embeddings.store(&obs.id, &[1.0, 0.0, 0.0]).unwrap();
            ids.push(obs.id);
        }
        graph
            .upsert_node("p", NodeType::File, "src/retry.rs", serde_json::json!({}), &ids)
            .unwrap();

        let stats = agent.run_cycle();
        assert_eq!(stats.clusters_merged, 1);

        for id in &ids {
            assert!(store.get(id).unwrap().is_none(), "original should be soft-deleted");
        }
        let merged = store
            .list(&crate::storage::ListOptions::default())
            .unwrap()
            .into_iter()
            .find(|o| o.source == "curation:merge")
            .unwrap();
        assert!(merged.content.contains("Merged from:"));
        assert!(embeddings.get(&merged.id).unwrap().is_some());

        let node = graph.get_node("p", NodeType::File, "src/retry.rs").unwrap().unwrap();
        assert_eq!(node.observation_ids, vec![merged.id]);
    }

    #[test]
    fn dissimilar_observations_do_not_merge() {
        let (storage, agent, store, graph) = fixtures();
        let embeddings = EmbeddingStore::new(Arc::clone(&storage));

        let vectors = [[1.0f32, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let mut ids = Vec::new();
        for (i, v) in vectors.iter().enumerate() {
            let obs = seed_observation(&store, &format!("unrelated topic number {i}"));
            embeddings.store(&obs.id, v).unwrap();
            ids.push(obs.id);
        }
        graph
            .upsert_node("p", NodeType::File, "src/lib.rs", serde_json::json!({}), &ids)
            .unwrap();

        let stats = agent.run_cycle();
        assert_eq!(stats.clusters_merged, 0);
        assert_eq!(store.list(&crate::storage::ListOptions::default()).unwrap().len(), 3);
    }

    #[test]
    fn staleness_flags_are_advisory() {
        let (_storage, agent, store, graph) = fixtures();
        let old = seed_observation(&store, "we use the legacy token cache");
        let new = seed_observation(&store, "removed the legacy token cache");
        graph
            .upsert_node(
                "p",
                NodeType::Decision,
                "token cache approach",
                serde_json::json!({}),
                &[old.id.clone(), new.id.clone()],
            )
            .unwrap();

        let stats = agent.run_cycle();
        assert_eq!(stats.staleness_flags, 1);
        assert!(graph.is_stale(&old.id).unwrap());
        assert!(!graph.is_stale(&new.id).unwrap());
        // Flagged rows stay visible.
        assert!(store.get(&old.id).unwrap().is_some());

        // A second cycle does not double-flag.
        let stats = agent.run_cycle();
        assert_eq!(stats.staleness_flags, 0);
    }

    #[test]
    fn low_value_prune_requires_all_conditions() {
        let (storage, agent, store, _graph) = fixtures();
        let short_old = seed_observation(&store, "tiny note");
        let long_old = seed_observation(&store, "a longer observation that carries real content");
        let short_new = seed_observation(&store, "fresh note");

        // Age two of them past the cutoff by hand.
        let old_millis =
            to_millis(Utc::now() - Duration::days(PRUNE_AGE_DAYS + 1));
        for id in [&short_old.id, &long_old.id] {
            storage
                .with_conn(|conn| {
                    conn.execute(
                        "UPDATE observations SET created_at = ?1 WHERE id = ?2",
                        rusqlite::params![old_millis, id.as_str()],
                    )
                    .map_err(|e| Error::storage("test_age", e))
                })
                .unwrap();
        }

        let stats = agent.run_cycle();
        assert_eq!(stats.pruned, 1);
        assert!(store.get(&short_old.id).unwrap().is_none());
        assert!(store.get(&long_old.id).unwrap().is_some());
        assert!(store.get(&short_new.id).unwrap().is_some());
    }

    #[test]
    fn supersedes_patterns() {
        assert_eq!(
            supersedes("uses redis", "switched from redis to memcached"),
            Some("replacement pattern")
        );
        assert_eq!(supersedes("cache exists", "cache removed"), Some("status change"));
        assert_eq!(
            supersedes("retries are enabled", "retries are not enabled anymore"),
            Some("negation")
        );
        assert_eq!(supersedes("all good", "still all good"), None);
    }
}
