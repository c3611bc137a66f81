//! Engine: wires the pipeline together and owns the periodic tasks.
//!
//! One engine instance per process owns the database handle, the embedding
//! worker, and the four cooperative periodic tasks (embedding 5 s,
//! enrichment 30 s, curation 5 min, status refresh). The hook surface and
//! the MCP tool surface both drive the same engine.

use crate::config::{LaminarkConfig, TopicDetectionConfig, load_project_config};
use crate::embedding::EmbeddingHandle;
use crate::llm::{AnthropicClient, LlmProvider};
use crate::models::{
    Classification, Kind, NewObservation, Observation, ProjectRef, ToolEvent,
};
use crate::search::SearchEngine;
use crate::services::{
    Admission, AdmissionFilter, BranchTracker, ContextInjector, CurationAgent, DebugTracker,
    Enricher, RoutingContext, RoutingEngine, SaveGuard, StatusCache, TopicShiftDetector,
};
use crate::storage::{
    BranchStore, DecayConfig, EmbeddingStore, GraphStore, ListOptions, ObservationStore,
    PathStore, SessionStore, Storage, ToolingStore,
};
use crate::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Research-buffer window consulted for provenance context.
const RESEARCH_WINDOW_MINUTES: i64 = 30;

/// The assembled knowledge pipeline.
pub struct Engine {
    config: LaminarkConfig,
    storage: Arc<Storage>,
    handle: Arc<EmbeddingHandle>,
    embeddings: EmbeddingStore,
    search: SearchEngine,
    sessions: SessionStore,
    tooling: ToolingStore,
    graph: GraphStore,
    paths: PathStore,
    branches: BranchStore,
    guard: SaveGuard,
    detector: Mutex<TopicShiftDetector>,
    branch_tracker: Arc<Mutex<BranchTracker>>,
    debug_tracker: Arc<Mutex<DebugTracker>>,
    enricher: Enricher,
    curation: CurationAgent,
    injector: ContextInjector,
    routing: RoutingEngine,
    status: StatusCache,
}

impl Engine {
    /// Builds the engine from configuration: opens (and migrates) the
    /// database, spawns the embedding worker, and configures the LLM
    /// adapter when an API key is present.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::StorageOpen`] or [`crate::Error::Migration`]
    /// when the database cannot be prepared.
    pub fn new(config: LaminarkConfig) -> Result<Self> {
        let storage = Storage::open(&config.db_path)?;
        let handle = Arc::new(EmbeddingHandle::spawn());
        let client = AnthropicClient::new();
        let llm: Option<Arc<dyn LlmProvider>> = if client.is_configured() {
            Some(Arc::new(client))
        } else {
            tracing::info!("no LLM adapter configured; observations stay unclassified");
            None
        };
        Ok(Self::assemble(config, storage, handle, llm))
    }

    /// Builds the engine over existing parts (tests and embedding-less
    /// setups).
    #[must_use]
    pub fn assemble(
        config: LaminarkConfig,
        storage: Arc<Storage>,
        handle: Arc<EmbeddingHandle>,
        llm: Option<Arc<dyn LlmProvider>>,
    ) -> Self {
        let embeddings = EmbeddingStore::new(Arc::clone(&storage));
        let search = SearchEngine::new(
            Arc::clone(&storage),
            embeddings.clone(),
            Arc::clone(&handle),
        );
        let sessions = SessionStore::new(Arc::clone(&storage));
        let tooling = ToolingStore::new(Arc::clone(&storage));

        let topic_config: TopicDetectionConfig =
            load_project_config(&config.data_dir, "topic-detection.json");
        let extraction = load_project_config(&config.data_dir, "graph-extraction.json");

        let branch_tracker = Arc::new(Mutex::new(BranchTracker::new(
            Arc::clone(&storage),
            llm.clone(),
        )));
        let debug_tracker = Arc::new(Mutex::new(DebugTracker::new(
            PathStore::new(Arc::clone(&storage)),
            llm.clone(),
        )));

        let enricher = Enricher::new(
            Arc::clone(&storage),
            llm.clone(),
            Arc::clone(&branch_tracker),
            Arc::clone(&debug_tracker),
            extraction,
            config.enrichment_batch,
            config.enrichment_concurrency,
        );

        Self {
            guard: SaveGuard::new(
                embeddings.clone(),
                Arc::clone(&handle),
                config.near_duplicate_threshold,
            ),
            detector: Mutex::new(TopicShiftDetector::new(
                sessions.clone(),
                tooling.clone(),
                topic_config,
            )),
            curation: CurationAgent::new(Arc::clone(&storage), DecayConfig::default()),
            injector: ContextInjector::new(Arc::clone(&storage), search.clone()),
            routing: RoutingEngine::new(tooling.clone()),
            status: StatusCache::new(Arc::clone(&storage), Arc::clone(&handle)),
            graph: GraphStore::new(Arc::clone(&storage)),
            paths: PathStore::new(Arc::clone(&storage)),
            branches: BranchStore::new(Arc::clone(&storage)),
            branch_tracker,
            debug_tracker,
            enricher,
            search,
            sessions,
            tooling,
            embeddings,
            handle,
            storage,
            config,
        }
    }

    // --- accessors ---------------------------------------------------------

    /// The engine configuration.
    #[must_use]
    pub const fn config(&self) -> &LaminarkConfig {
        &self.config
    }

    /// The shared storage handle.
    #[must_use]
    pub const fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The search engine.
    #[must_use]
    pub const fn search(&self) -> &SearchEngine {
        &self.search
    }

    /// The session store.
    #[must_use]
    pub const fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The tool registry and ephemera store.
    #[must_use]
    pub const fn tooling(&self) -> &ToolingStore {
        &self.tooling
    }

    /// The graph store.
    #[must_use]
    pub const fn graph(&self) -> &GraphStore {
        &self.graph
    }

    /// The debug-path store.
    #[must_use]
    pub const fn paths(&self) -> &PathStore {
        &self.paths
    }

    /// The thought-branch store.
    #[must_use]
    pub const fn branches(&self) -> &BranchStore {
        &self.branches
    }

    /// The vector index.
    #[must_use]
    pub const fn embeddings(&self) -> &EmbeddingStore {
        &self.embeddings
    }

    /// The embedding worker handle.
    #[must_use]
    pub const fn embedding_handle(&self) -> &Arc<EmbeddingHandle> {
        &self.handle
    }

    /// The debug tracker (manual path controls).
    #[must_use]
    pub const fn debug_tracker(&self) -> &Arc<Mutex<DebugTracker>> {
        &self.debug_tracker
    }

    /// The status cache.
    #[must_use]
    pub const fn status(&self) -> &StatusCache {
        &self.status
    }

    /// A project-bound observation store.
    #[must_use]
    pub fn observations(&self, project_hash: &str) -> ObservationStore {
        ObservationStore::new(Arc::clone(&self.storage), project_hash.to_string())
    }

    // --- capture path ------------------------------------------------------

    /// Captures one hook event: admission, research routing, save guard,
    /// usage accounting, and routing evaluation.
    ///
    /// # Errors
    ///
    /// Returns a storage error when writes fail. Duplicate and validation
    /// rejections are reported as `Ok(None)`: a dropped event is normal.
    pub fn capture_event(
        &self,
        project: &ProjectRef,
        event: &ToolEvent,
    ) -> Result<Option<Observation>> {
        let session_id = event.session_id.as_deref();
        self.tooling
            .record_tool_use(&project.hash, session_id, &event.tool_name)?;

        let captured = match AdmissionFilter::evaluate(event) {
            Admission::Admit(mut input) => {
                let store = self.observations(&project.hash);
                input.content = self.annotate_with_research(&project.hash, &input);
                match self.guard.check(&store, &input.content) {
                    Ok(()) => {
                        let observation = store.create(input)?;
                        self.guard
                            .remember(&store, &observation.content, &observation.id);
                        Some(observation)
                    },
                    Err(e) if e.is_rejection() => {
                        tracing::debug!(tool = event.tool_name, reason = %e, "capture dropped");
                        None
                    },
                    Err(e) => return Err(e),
                }
            },
            Admission::Research { query } => {
                self.tooling
                    .push_research(&project.hash, session_id, &event.tool_name, &query)?;
                None
            },
            Admission::Reject(reason) => {
                tracing::debug!(tool = event.tool_name, reason, "event not admitted");
                None
            },
        };

        self.evaluate_routing(project, session_id);
        Ok(captured)
    }

    /// Explicit save through the guard.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Duplicate`] on guard rejection and
    /// [`crate::Error::ValidationRejected`] on bound violations.
    pub fn save_observation(
        &self,
        project_hash: &str,
        input: NewObservation,
    ) -> Result<Observation> {
        let store = self.observations(project_hash);
        self.guard.check(&store, &input.content)?;
        let observation = store.create(input)?;
        self.guard
            .remember(&store, &observation.content, &observation.id);
        Ok(observation)
    }

    // --- session lifecycle -------------------------------------------------

    /// Handles session start: registers the project, seeds the detector,
    /// recovers debug state, mines routing patterns, opens a branch, and
    /// returns the injected context document.
    ///
    /// # Errors
    ///
    /// Returns a storage error when reads or writes fail.
    pub fn session_started(&self, project: &ProjectRef, session_id: &str) -> Result<String> {
        self.sessions.register_project(
            &project.hash,
            &project.root.to_string_lossy(),
            &project.name,
        )?;
        self.sessions.start_session(session_id, &project.hash)?;

        if let Ok(mut detector) = self.detector.lock() {
            detector.set_session(Some(session_id.to_string()));
            if let Err(e) = detector.seed_from_history(&project.hash) {
                tracing::warn!(error = %e, "detector seeding failed");
            }
        }
        if let Ok(mut tracker) = self.debug_tracker.lock() {
            if let Err(e) = tracker.recover(&project.hash) {
                tracing::warn!(error = %e, "debug path recovery failed");
            }
        }
        if let Ok(mut tracker) = self.branch_tracker.lock() {
            if let Err(e) = tracker.on_session_start(&project.hash, session_id) {
                tracing::warn!(error = %e, "branch session start failed");
            }
        }
        self.routing.precompute_patterns(&project.hash);

        self.injector.session_start(&project.hash)
    }

    /// Handles session stop: generates the summary, closes the session row,
    /// persists the detector seed, and flushes the research buffer.
    ///
    /// # Errors
    ///
    /// Returns a storage error when writes fail.
    pub fn session_ended(&self, project_hash: &str, session_id: &str) -> Result<()> {
        let summary = self.build_session_summary(project_hash, session_id)?;
        self.sessions.end_session(session_id, summary.as_deref())?;

        if let Ok(mut detector) = self.detector.lock() {
            if let Err(e) = detector.session_end(project_hash) {
                tracing::warn!(error = %e, "threshold persistence failed");
            }
        }
        self.tooling.flush_research(
            project_hash,
            Utc::now() - ChronoDuration::minutes(RESEARCH_WINDOW_MINUTES),
        )?;
        Ok(())
    }

    /// Pre-tool context for the synchronous hook.
    ///
    /// # Errors
    ///
    /// Returns a storage error when reads fail.
    pub fn pre_tool_context(
        &self,
        project_hash: &str,
        tool_name: &str,
        tool_input: &serde_json::Value,
    ) -> Result<String> {
        self.injector.pre_tool(project_hash, tool_name, tool_input)
    }

    // --- periodic cycles ---------------------------------------------------

    /// One embedding cycle: drain the unembedded queue, store vectors, and
    /// feed the topic-shift detector. Returns the number embedded.
    pub fn run_embedding_cycle(&self) -> usize {
        if let Ok(mut detector) = self.detector.lock() {
            detector.begin_cycle();
        }
        if !self.handle.is_ready() {
            return 0;
        }

        let pending = match self.embeddings.find_unembedded(self.config.embedding_batch) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(error = %e, "unembedded scan failed");
                return 0;
            },
        };
        if pending.is_empty() {
            return 0;
        }

        let texts: Vec<String> = pending.iter().map(Observation::embedding_text).collect();
        let Some(vectors) = self.handle.embed_batch(&texts) else {
            // Worker timeout or failure; rows retry next cycle indefinitely.
            return 0;
        };
        let model = self
            .handle
            .model_name()
            .unwrap_or_else(|| "unknown".to_string());

        let mut embedded = 0;
        for (observation, vector) in pending.iter().zip(vectors) {
            if let Err(e) = self.embeddings.store(&observation.id, &vector) {
                tracing::warn!(observation = %observation.id, error = %e, "vector store failed");
                continue;
            }
            if let Err(e) =
                ObservationStore::mark_embedded(&self.storage, &observation.id, &model)
            {
                tracing::warn!(observation = %observation.id, error = %e, "embedding mark failed");
                continue;
            }
            embedded += 1;

            self.feed_detector(observation, &vector);
        }
        embedded
    }

    /// One enrichment cycle.
    pub fn run_enrichment_cycle(&self) -> crate::services::EnricherStats {
        self.enricher.run_cycle()
    }

    /// One curation cycle.
    pub fn run_curation_cycle(&self) -> crate::services::CurationStats {
        self.curation.run_cycle()
    }

    /// One status-cache refresh.
    pub fn refresh_status(&self) {
        if let Err(e) = self.status.refresh() {
            tracing::warn!(error = %e, "status refresh failed");
        }
    }

    /// Spawns the periodic tasks onto the current tokio runtime. Tasks stop
    /// at the next tick after `shutdown` flips to true; in-flight ticks are
    /// not re-entered after stop.
    pub fn spawn_periodic_tasks(
        self: &Arc<Self>,
        shutdown: &watch::Sender<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        let intervals = [
            (self.config.embedding_interval, CycleKind::Embedding),
            (self.config.enrichment_interval, CycleKind::Enrichment),
            (self.config.curation_interval, CycleKind::Curation),
            (self.config.status_interval, CycleKind::Status),
        ];
        for (period, kind) in intervals {
            let engine = Arc::clone(self);
            let mut stop = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let engine = Arc::clone(&engine);
                            let run = tokio::task::spawn_blocking(move || engine.run_cycle(kind));
                            if run.await.is_err() {
                                tracing::warn!(?kind, "periodic cycle panicked");
                            }
                        },
                        _ = stop.changed() => break,
                    }
                }
            }));
        }
        handles
    }

    fn run_cycle(&self, kind: CycleKind) {
        match kind {
            CycleKind::Embedding => {
                self.run_embedding_cycle();
            },
            CycleKind::Enrichment => {
                self.run_enrichment_cycle();
            },
            CycleKind::Curation => {
                self.run_curation_cycle();
            },
            CycleKind::Status => self.refresh_status(),
        }
    }

    /// Stops the embedding worker (5 s grace, then detach).
    pub fn shutdown(&self) {
        self.handle.shutdown();
    }

    // --- internals ---------------------------------------------------------

    /// Runs the detector for one freshly embedded observation and closes
    /// the current branch on a confirmed stash.
    fn feed_detector(&self, observation: &Observation, vector: &[f32]) {
        if !TopicShiftDetector::is_user_directed(&observation.source) {
            return;
        }
        let recent = self.recent_with_embeddings(observation);
        let stashed = match self.detector.lock() {
            Ok(mut detector) => detector
                .process(observation, vector, &recent)
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "shift evaluation failed");
                    None
                }),
            Err(_) => None,
        };
        if stashed.is_some() {
            if let Ok(mut tracker) = self.branch_tracker.lock() {
                if let Err(e) = tracker.on_topic_shift() {
                    tracing::warn!(error = %e, "branch close on shift failed");
                }
            }
        }
    }

    /// The previous-topic observations (≤20, oldest first) with embeddings.
    fn recent_with_embeddings(
        &self,
        current: &Observation,
    ) -> Vec<(Observation, Option<Vec<f32>>)> {
        let store = self.observations(&current.project_hash);
        let rows = store
            .list(&ListOptions {
                limit: crate::services::topic_shift::STASH_LIMIT + 1,
                ..Default::default()
            })
            .unwrap_or_default();
        let mut out: Vec<(Observation, Option<Vec<f32>>)> = rows
            .into_iter()
            .filter(|obs| obs.id != current.id)
            .take(crate::services::topic_shift::STASH_LIMIT)
            .map(|obs| {
                let embedding = self.embeddings.get(&obs.id).ok().flatten();
                (obs, embedding)
            })
            .collect();
        out.reverse();
        out
    }

    /// Appends recent exploration provenance to admitted change content.
    fn annotate_with_research(&self, project_hash: &str, input: &NewObservation) -> String {
        if input.kind != Some(Kind::Change) {
            return input.content.clone();
        }
        let since = Utc::now() - ChronoDuration::minutes(RESEARCH_WINDOW_MINUTES);
        let entries = self
            .tooling
            .recent_research(project_hash, since, 5)
            .unwrap_or_default();
        if entries.is_empty() {
            return input.content.clone();
        }
        let lines: Vec<String> = entries
            .iter()
            .map(|e| format!("{} {}", e.tool_name, e.query))
            .collect();
        format!("{}\n\nRecently explored: {}", input.content, lines.join("; "))
    }

    /// Routing evaluation; exceptions are swallowed and suggestions land in
    /// the notification queue.
    fn evaluate_routing(&self, project: &ProjectRef, session_id: Option<&str>) {
        let Some(session_id) = session_id else { return };
        let context = self.routing_context(&project.hash);
        if let Some(suggestion) = self.routing.evaluate(&project.hash, session_id, &context) {
            if let Err(e) = self.tooling.enqueue_notification(&project.hash, &suggestion) {
                tracing::debug!(error = %e, "suggestion enqueue failed");
            }
        }
    }

    fn routing_context(&self, project_hash: &str) -> RoutingContext {
        let arc_stage = self
            .branch_tracker
            .lock()
            .ok()
            .and_then(|tracker| tracker.current_branch_id().map(ToString::to_string))
            .and_then(|id| self.branches.get(&id).ok().flatten())
            .map(|branch| branch.arc_stage);

        let store = self.observations(project_hash);
        let recent = store
            .list(&ListOptions { limit: 3, ..Default::default() })
            .unwrap_or_default();
        let last_classification = recent
            .iter()
            .map(|obs| obs.classification)
            .find(|c| c.is_set())
            .unwrap_or(Classification::Unset);
        let has_active_debug_path = self
            .debug_tracker
            .lock()
            .ok()
            .is_some_and(|tracker| tracker.active_path_id().is_some());

        RoutingContext {
            arc_stage,
            last_classification,
            has_active_debug_path,
            recent_contents: recent.into_iter().map(|obs| obs.content).collect(),
        }
    }

    /// Kind-grouped compression of a session's observations, optionally
    /// polished by the LLM adapter.
    fn build_session_summary(
        &self,
        project_hash: &str,
        session_id: &str,
    ) -> Result<Option<String>> {
        let store = self.observations(project_hash);
        let rows = store.list(&ListOptions { limit: 200, ..Default::default() })?;
        let session_rows: Vec<&Observation> = rows
            .iter()
            .filter(|obs| obs.session_id.as_deref() == Some(session_id))
            .collect();
        if session_rows.is_empty() {
            return Ok(None);
        }

        let mut grouped = String::new();
        for kind in Kind::ALL {
            let of_kind: Vec<&&Observation> = session_rows
                .iter()
                .filter(|obs| obs.kind == kind)
                .collect();
            if of_kind.is_empty() {
                continue;
            }
            grouped.push_str(&format!("{} ({}):\n", kind, of_kind.len()));
            for obs in of_kind.iter().take(5) {
                let label = obs
                    .title
                    .clone()
                    .unwrap_or_else(|| crate::rendering::first_line(&obs.content).to_string());
                grouped.push_str(&format!("- {}\n", crate::rendering::clip_chars(&label, 90)));
            }
        }
        Ok(Some(grouped.trim_end().to_string()))
    }
}

/// Which periodic cycle a task runs.
#[derive(Debug, Clone, Copy)]
enum CycleKind {
    Embedding,
    Enrichment,
    Curation,
    Status,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> Engine {
        let dir = std::env::temp_dir().join(format!("laminark-test-{}", crate::models::new_id()));
        let config = LaminarkConfig::with_data_dir(dir);
        Engine::assemble(
            config,
            Storage::in_memory().unwrap(),
            Arc::new(EmbeddingHandle::disabled()),
            None,
        )
    }

    fn project() -> ProjectRef {
        ProjectRef {
            hash: "proj-a".to_string(),
            root: std::path::PathBuf::from("/tmp/proj-a"),
            name: "proj-a".to_string(),
        }
    }

    fn edit_event() -> ToolEvent {
        ToolEvent {
            tool_name: "Edit".to_string(),
            tool_input: json!({"file_path": "src/a.ts", "old_string": "x", "new_string": "y"}),
            tool_response: None,
            session_id: Some("s1".to_string()),
        }
    }

    #[test]
    fn edit_event_becomes_change_observation() {
        let engine = engine();
        let observation = engine
            .capture_event(&project(), &edit_event())
            .unwrap()
            .unwrap();
        assert_eq!(observation.kind, Kind::Change);
        assert_eq!(observation.source, "hook:Edit");
        assert!(observation
            .content
            .starts_with("[Edit] Modified src/a.ts: replaced \"x\" with \"y\""));
    }

    #[test]
    fn duplicate_capture_is_dropped_silently() {
        let engine = engine();
        assert!(engine.capture_event(&project(), &edit_event()).unwrap().is_some());
        assert!(engine.capture_event(&project(), &edit_event()).unwrap().is_none());
    }

    #[test]
    fn read_event_lands_in_research_buffer() {
        let engine = engine();
        let event = ToolEvent {
            tool_name: "Read".to_string(),
            tool_input: json!({"file_path": "src/lib.rs"}),
            tool_response: None,
            session_id: Some("s1".to_string()),
        };
        assert!(engine.capture_event(&project(), &event).unwrap().is_none());
        let entries = engine
            .tooling()
            .recent_research("proj-a", Utc::now() - ChronoDuration::minutes(5), 10)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].query, "src/lib.rs");
    }

    #[test]
    fn change_capture_carries_research_provenance() {
        let engine = engine();
        let read = ToolEvent {
            tool_name: "Read".to_string(),
            tool_input: json!({"file_path": "src/auth.rs"}),
            tool_response: None,
            session_id: Some("s1".to_string()),
        };
        engine.capture_event(&project(), &read).unwrap();
        let observation = engine
            .capture_event(&project(), &edit_event())
            .unwrap()
            .unwrap();
        assert!(observation.content.contains("Recently explored: Read src/auth.rs"));
    }

    #[test]
    fn explicit_save_rejects_duplicates() {
        let engine = engine();
        let input = NewObservation {
            content: "remember this".to_string(),
            source: "manual".to_string(),
            ..Default::default()
        };
        engine.save_observation("proj-a", input.clone()).unwrap();
        let err = engine.save_observation("proj-a", input).unwrap_err();
        assert!(matches!(err, crate::Error::Duplicate { .. }));
    }

    #[test]
    fn session_lifecycle_produces_context_and_summary() {
        let engine = engine();
        let document = engine.session_started(&project(), "s1").unwrap();
        assert!(document.contains("## Previous session"));

        engine.capture_event(&project(), &edit_event()).unwrap();
        engine.session_ended("proj-a", "s1").unwrap();

        let session = engine.sessions().get("s1").unwrap().unwrap();
        assert!(!session.is_open());
        assert!(session.summary.unwrap().contains("change (1):"));
    }

    #[test]
    fn embedding_cycle_is_a_noop_without_worker() {
        let engine = engine();
        engine.capture_event(&project(), &edit_event()).unwrap();
        assert_eq!(engine.run_embedding_cycle(), 0);
        // The row stays queued for when the worker recovers.
        assert_eq!(engine.embeddings().find_unembedded(10).unwrap().len(), 1);
    }
}
