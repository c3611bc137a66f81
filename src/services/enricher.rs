//! Classifier / enricher: the periodic batch that labels observations and
//! grows the knowledge graph.
//!
//! Each cycle selects up to B unclassified observations (newest first,
//! project-agnostic), classifies them with up to C concurrent LLM calls,
//! forwards debug signals and classified observations to the trackers,
//! pushes surviving entities through the quality gate into the graph, and
//! finishes with branch maintenance. Any adapter failure leaves the row
//! unclassified for the next cycle.

use crate::config::GraphExtractionConfig;
use crate::llm::{ClassificationOutcome, EntityCandidate, LlmProvider, SignalVerdict};
use crate::models::{
    Classification, GraphNode, Kind, NodeType, Observation, ObservationPatch, normalize_name,
};
use crate::storage::{GraphStore, ObservationStore, Storage};
use crate::Result;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::branch_tracker::BranchTracker;
use super::debug_tracker::DebugTracker;

/// First tokens that mark an entity name as too vague to keep.
static VAGUE_PREFIXES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from(["the", "this", "it", "here", "that", "a", "an", "some", "these", "those"])
});

/// Name length bounds for entity candidates.
const MIN_NAME_CHARS: usize = 3;
const MAX_NAME_CHARS: usize = 200;

/// Per-cycle outcome counts.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnricherStats {
    /// Observations pulled this cycle.
    pub processed: usize,
    /// Classified as signal.
    pub classified: usize,
    /// Classified as noise and soft-deleted.
    pub noise: usize,
    /// Entities surviving the quality gate.
    pub entities: usize,
    /// Relationship edges inserted.
    pub edges: usize,
    /// Rows left unclassified for retry.
    pub failed: usize,
}

/// Work computed off-thread per observation (LLM calls only).
struct LlmWork {
    outcome: ClassificationOutcome,
    entities: Vec<EntityCandidate>,
}

/// The periodic classification and graph-growth batch.
pub struct Enricher {
    storage: Arc<Storage>,
    graph: GraphStore,
    llm: Option<Arc<dyn LlmProvider>>,
    branch_tracker: Arc<Mutex<BranchTracker>>,
    debug_tracker: Arc<Mutex<DebugTracker>>,
    extraction: GraphExtractionConfig,
    batch: usize,
    concurrency: usize,
}

impl Enricher {
    /// Creates an enricher.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        storage: Arc<Storage>,
        llm: Option<Arc<dyn LlmProvider>>,
        branch_tracker: Arc<Mutex<BranchTracker>>,
        debug_tracker: Arc<Mutex<DebugTracker>>,
        extraction: GraphExtractionConfig,
        batch: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            graph: GraphStore::new(Arc::clone(&storage)),
            storage,
            llm,
            branch_tracker,
            debug_tracker,
            extraction,
            batch,
            concurrency: concurrency.max(1),
        }
    }

    /// Runs one enrichment cycle.
    ///
    /// Never fails: every error is logged and converted into a retry next
    /// cycle.
    pub fn run_cycle(&self) -> EnricherStats {
        let mut stats = EnricherStats::default();

        if let Some(llm) = self.llm.clone() {
            let batch = match ObservationStore::unclassified_batch(&self.storage, self.batch) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "enricher batch selection failed");
                    return stats;
                },
            };
            stats.processed = batch.len();

            for chunk in batch.chunks(self.concurrency) {
                let work = classify_chunk(&llm, chunk);
                for (observation, result) in chunk.iter().zip(work) {
                    match result {
                        Ok(work) => self.apply(observation, work, &mut stats),
                        Err(e) => {
                            stats.failed += 1;
                            tracing::debug!(
                                observation = %observation.id,
                                error = %e,
                                "classification deferred to next cycle"
                            );
                        },
                    }
                }
            }
        }

        if let Ok(mut tracker) = self.branch_tracker.lock() {
            if let Err(e) = tracker.maintenance() {
                tracing::warn!(error = %e, "branch maintenance failed");
            }
        }

        stats
    }

    /// Applies one observation's LLM work to storage and the trackers.
    fn apply(&self, observation: &Observation, work: LlmWork, stats: &mut EnricherStats) {
        let store = ObservationStore::new(
            Arc::clone(&self.storage),
            observation.project_hash.clone(),
        );

        let classification = match work.outcome.signal {
            SignalVerdict::Noise => Classification::Noise,
            SignalVerdict::Signal => work
                .outcome
                .classification
                .filter(|c| c.is_set())
                .unwrap_or(Classification::Discovery),
        };

        let patch = ObservationPatch {
            classification: Some(classification),
            ..Default::default()
        };
        if let Err(e) = store.update(&observation.id, &patch) {
            tracing::warn!(observation = %observation.id, error = %e, "classification write failed");
            stats.failed += 1;
            return;
        }

        if classification == Classification::Noise {
            stats.noise += 1;
            if let Err(e) = store.soft_delete(&observation.id) {
                tracing::warn!(observation = %observation.id, error = %e, "noise soft-delete failed");
            }
            return;
        }
        stats.classified += 1;

        // Forward the debug signal, then the classified observation, in
        // classifier-batch order.
        if let Ok(mut tracker) = self.debug_tracker.lock() {
            if let Err(e) = tracker.on_signal(
                &observation.project_hash,
                observation.session_id.as_deref(),
                &observation.content,
                &work.outcome.debug_signal,
            ) {
                tracing::warn!(error = %e, "debug tracker update failed");
            }
        }

        let mut classified = observation.clone();
        classified.classification = classification;
        if let Ok(mut tracker) = self.branch_tracker.lock() {
            if let Err(e) = tracker.on_classified(&classified) {
                tracing::warn!(error = %e, "branch tracker update failed");
            }
        }

        let survivors = apply_quality_gate(work.entities, observation.kind, &self.extraction);
        stats.entities += survivors.len();
        let nodes = self.upsert_entities(observation, &survivors);

        if nodes.len() >= 2 {
            stats.edges += self.infer_edges(observation, &nodes);
        }
    }

    fn upsert_entities(
        &self,
        observation: &Observation,
        survivors: &[EntityCandidate],
    ) -> Vec<GraphNode> {
        let mut nodes = Vec::with_capacity(survivors.len());
        for candidate in survivors {
            match self.graph.upsert_node(
                &observation.project_hash,
                candidate.entity_type,
                &candidate.name,
                serde_json::json!({ "confidence": candidate.confidence }),
                std::slice::from_ref(&observation.id),
            ) {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    tracing::warn!(entity = candidate.name, error = %e, "entity upsert failed");
                },
            }
        }
        nodes
    }

    /// Relationship inference across the surviving nodes; unknown names are
    /// dropped silently.
    fn infer_edges(&self, observation: &Observation, nodes: &[GraphNode]) -> usize {
        let Some(llm) = &self.llm else { return 0 };
        let names: Vec<String> = nodes.iter().map(|n| n.name.clone()).collect();
        let candidates = match llm.infer_relationships(&names, &observation.content) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!(error = %e, "relationship inference deferred");
                return 0;
            },
        };

        let by_name: HashMap<String, &GraphNode> = nodes
            .iter()
            .map(|n| (n.name.clone(), n))
            .collect();

        let mut inserted = 0;
        for candidate in candidates {
            let source = by_name.get(&normalize_loose(&candidate.source));
            let target = by_name.get(&normalize_loose(&candidate.target));
            let (Some(source), Some(target)) = (source, target) else {
                continue;
            };
            match self.graph.insert_edge(
                &source.id,
                &target.id,
                candidate.relationship,
                candidate.weight,
                serde_json::json!({ "observation": observation.id.as_str() }),
            ) {
                Ok(true) => inserted += 1,
                Ok(false) => {},
                Err(e) => tracing::warn!(error = %e, "edge insert failed"),
            }
        }
        inserted
    }
}

/// Runs the LLM calls for a chunk concurrently (one thread per observation).
fn classify_chunk(
    llm: &Arc<dyn LlmProvider>,
    chunk: &[Observation],
) -> Vec<Result<LlmWork>> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = chunk
            .iter()
            .map(|observation| {
                let llm = Arc::clone(llm);
                scope.spawn(move || classify_one(&llm, observation))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(crate::Error::AdapterUnavailable {
                        adapter: "llm".to_string(),
                        cause: "classification worker panicked".to_string(),
                    })
                })
            })
            .collect()
    })
}

fn classify_one(llm: &Arc<dyn LlmProvider>, observation: &Observation) -> Result<LlmWork> {
    let outcome = llm.classify_observation(&observation.source, &observation.content)?;
    let entities = if outcome.signal == SignalVerdict::Signal {
        llm.extract_entities(&observation.content)?
    } else {
        Vec::new()
    };
    Ok(LlmWork { outcome, entities })
}

/// The entity quality gate.
///
/// Rejects short/long and vague names, applies per-type confidence
/// thresholds, penalizes file entities on non-change observations, and caps
/// file entities per observation keeping the highest confidence.
#[must_use]
pub fn apply_quality_gate(
    candidates: Vec<EntityCandidate>,
    kind: Kind,
    config: &GraphExtractionConfig,
) -> Vec<EntityCandidate> {
    let mut survivors: Vec<EntityCandidate> = Vec::new();
    for mut candidate in candidates {
        candidate.name = candidate.name.trim().to_string();
        let chars = candidate.name.chars().count();
        if chars < MIN_NAME_CHARS || chars > MAX_NAME_CHARS {
            continue;
        }
        let first_token = candidate
            .name
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();
        if VAGUE_PREFIXES.contains(first_token.as_str()) {
            continue;
        }
        if candidate.entity_type == NodeType::File && kind != Kind::Change {
            candidate.confidence *= config.non_change_file_factor;
        }
        if candidate.confidence < config.threshold_for(candidate.entity_type) {
            continue;
        }
        candidate.name = normalize_loose(&candidate.name);
        survivors.push(candidate);
    }

    // Cap file entities, keeping the highest confidence.
    let mut files: Vec<&EntityCandidate> = survivors
        .iter()
        .filter(|c| c.entity_type == NodeType::File)
        .collect();
    if files.len() > config.max_file_entities {
        files.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let dropped: HashSet<String> = files[config.max_file_entities..]
            .iter()
            .map(|c| c.name.clone())
            .collect();
        survivors.retain(|c| c.entity_type != NodeType::File || !dropped.contains(&c.name));
    }
    survivors
}

/// Name normalization matching the graph store's identity rules, typeless.
fn normalize_loose(name: &str) -> String {
    normalize_name(NodeType::Decision, name)
}
