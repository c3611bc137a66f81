//! Branch tracker: segments the observation stream into coherent work units.
//!
//! A new branch starts when the project or session changes, after a 15-minute
//! gap, on a topic-shift notification, or on session start from idle. Each
//! classified observation is appended with its tool name and the arc stage
//! inferred from the branch's tool histogram at that moment.

use crate::llm::LlmProvider;
use crate::models::{
    ArcStage, BranchState, Classification, Observation, ObservationId, ThoughtBranch,
};
use crate::storage::{BranchStore, ObservationStore, Storage, ToolingStore};
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Arc;

/// Gap that closes a branch.
pub const BRANCH_GAP_MINUTES: i64 = 15;

/// Active branches older than this are abandoned on maintenance.
const STALE_BRANCH_HOURS: i64 = 24;

/// Observation count after which the branch gets an LLM type and title.
const CLASSIFY_AFTER_OBSERVATIONS: usize = 3;

/// Recent contents kept in memory for best-effort LLM calls.
const ASSESS_CONTEXT_LIMIT: usize = 10;

/// Functional category of a tool, for arc-stage inference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCategory {
    /// Reading and searching.
    Investigation,
    /// Mutating files.
    Write,
    /// Organizing work.
    Planning,
    /// Running checks.
    Verification,
}

/// Keyword map used to categorize unknown tools. Order matters: the first
/// category with a keyword hit wins.
static CATEGORY_KEYWORDS: Lazy<Vec<(ToolCategory, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (
            ToolCategory::Verification,
            vec!["test", "check", "lint", "build", "verify", "validate", "compile"],
        ),
        (
            ToolCategory::Write,
            vec!["write", "edit", "patch", "create", "apply", "modify", "update"],
        ),
        (
            ToolCategory::Planning,
            vec!["todo", "plan", "task", "organize", "outline"],
        ),
        (
            ToolCategory::Investigation,
            vec!["read", "search", "grep", "glob", "find", "fetch", "browse", "list", "inspect"],
        ),
    ]
});

/// Categorizes a tool from its description (preferred) or name tokens.
///
/// Returns `None` for tools that match no keyword; uncategorized tools are
/// excluded from arc-stage denominators.
#[must_use]
pub fn categorize_tool(name: &str, description: Option<&str>) -> Option<ToolCategory> {
    if let Some(description) = description {
        if let Some(category) = match_keywords(&description.to_lowercase()) {
            return Some(category);
        }
    }
    match_keywords(&name.to_lowercase())
}

fn match_keywords(text: &str) -> Option<ToolCategory> {
    for (category, keywords) in CATEGORY_KEYWORDS.iter() {
        if keywords.iter().any(|k| text.contains(k)) {
            return Some(*category);
        }
    }
    None
}

/// Per-category counts over a branch's categorized tools.
#[derive(Debug, Clone, Copy, Default)]
pub struct CategoryCounts {
    /// Reading and searching tool uses.
    pub investigation: u32,
    /// File-mutating tool uses.
    pub write: u32,
    /// Work-organizing tool uses.
    pub planning: u32,
    /// Check-running tool uses.
    pub verification: u32,
}

impl CategoryCounts {
    /// Adds one categorized use.
    pub fn add(&mut self, category: ToolCategory, count: u32) {
        match category {
            ToolCategory::Investigation => self.investigation += count,
            ToolCategory::Write => self.write += count,
            ToolCategory::Planning => self.planning += count,
            ToolCategory::Verification => self.verification += count,
        }
    }

    /// Total categorized uses.
    #[must_use]
    pub const fn total(&self) -> u32 {
        self.investigation + self.write + self.planning + self.verification
    }
}

/// Infers the current arc stage from the categorized tool histogram and the
/// latest classification.
#[must_use]
pub fn infer_arc_stage(counts: &CategoryCounts, latest: Classification) -> ArcStage {
    let total = counts.total();
    if total == 0 {
        return ArcStage::Investigation;
    }
    let share = |n: u32| n as f32 / total as f32;

    if counts.verification > 0 && share(counts.verification) >= 0.2 {
        ArcStage::Verification
    } else if share(counts.write) >= 0.4 {
        ArcStage::Execution
    } else if share(counts.planning) >= 0.1 {
        ArcStage::Planning
    } else if latest == Classification::Problem && counts.write > 0 && counts.investigation > 0 {
        ArcStage::Diagnosis
    } else {
        ArcStage::Investigation
    }
}

struct CurrentBranch {
    id: String,
    project_hash: String,
    session_id: Option<String>,
    last_at: DateTime<Utc>,
    histogram: HashMap<String, u32>,
    count: usize,
    recent_contents: Vec<String>,
}

/// Stateful tracker over the classified observation stream.
pub struct BranchTracker {
    storage: Arc<Storage>,
    branches: BranchStore,
    tooling: ToolingStore,
    llm: Option<Arc<dyn LlmProvider>>,
    current: Option<CurrentBranch>,
}

impl BranchTracker {
    /// Creates an idle tracker.
    #[must_use]
    pub fn new(storage: Arc<Storage>, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            branches: BranchStore::new(Arc::clone(&storage)),
            tooling: ToolingStore::new(Arc::clone(&storage)),
            storage,
            llm,
            current: None,
        }
    }

    /// The current branch id while tracking.
    #[must_use]
    pub fn current_branch_id(&self) -> Option<&str> {
        self.current.as_ref().map(|c| c.id.as_str())
    }

    /// Handles one classified observation in classifier-batch order.
    ///
    /// # Errors
    ///
    /// Returns a storage error when branch writes fail; LLM failures are
    /// swallowed.
    pub fn on_classified(&mut self, observation: &Observation) -> Result<()> {
        if self.needs_new_branch(observation) {
            self.finish_current(BranchState::Completed)?;
            let branch = self
                .branches
                .create(&observation.project_hash, observation.session_id.as_deref())?;
            self.current = Some(CurrentBranch {
                id: branch.id,
                project_hash: observation.project_hash.clone(),
                session_id: observation.session_id.clone(),
                last_at: observation.created_at,
                histogram: HashMap::new(),
                count: 0,
                recent_contents: Vec::new(),
            });
        }

        let tool_name = observation.hook_tool().map(ToString::to_string);
        let Some(current) = self.current.as_mut() else {
            return Ok(());
        };

        if let Some(tool) = &tool_name {
            *current.histogram.entry(tool.clone()).or_insert(0) += 1;
        }
        current.last_at = observation.created_at;
        current.count += 1;
        current.recent_contents.push(observation.content.clone());
        if current.recent_contents.len() > ASSESS_CONTEXT_LIMIT {
            current.recent_contents.remove(0);
        }

        let counts = self.categorized_counts(&self.current_histogram());
        let stage = infer_arc_stage(&counts, observation.classification);

        let Some(current) = self.current.as_ref() else {
            return Ok(());
        };
        self.branches.append_observation(
            &current.id,
            &observation.id,
            stage,
            tool_name.as_deref(),
            &current.histogram,
        )?;

        if current.count == CLASSIFY_AFTER_OBSERVATIONS {
            self.assess_current();
        }
        Ok(())
    }

    /// Closes the current branch on a confirmed topic shift.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the close fails.
    pub fn on_topic_shift(&mut self) -> Result<()> {
        self.finish_current(BranchState::Completed)
    }

    /// Starts tracking from idle at session start.
    ///
    /// # Errors
    ///
    /// Returns a storage error when branch creation fails.
    pub fn on_session_start(&mut self, project_hash: &str, session_id: &str) -> Result<()> {
        if self.current.is_some() {
            return Ok(());
        }
        let branch = self.branches.create(project_hash, Some(session_id))?;
        self.current = Some(CurrentBranch {
            id: branch.id,
            project_hash: project_hash.to_string(),
            session_id: Some(session_id.to_string()),
            last_at: Utc::now(),
            histogram: HashMap::new(),
            count: 0,
            recent_contents: Vec::new(),
        });
        Ok(())
    }

    /// Periodic upkeep: abandon stale branches, classify unclassified ones,
    /// summarize recently finished ones. All LLM calls are best-effort.
    ///
    /// # Errors
    ///
    /// Returns a storage error when branch reads or writes fail.
    pub fn maintenance(&mut self) -> Result<()> {
        let cutoff = Utc::now() - Duration::hours(STALE_BRANCH_HOURS);
        for branch in self.branches.stale_active(cutoff)? {
            self.branches.finish(&branch.id, BranchState::Abandoned)?;
            if self.current.as_ref().is_some_and(|c| c.id == branch.id) {
                self.current = None;
            }
            tracing::info!(branch = branch.id, "stale branch abandoned");
        }

        if let Some(llm) = self.llm.clone() {
            for branch in self.branches.unclassified_finished(5)? {
                let contents = self.branch_contents(&branch)?;
                if contents.is_empty() {
                    continue;
                }
                match llm.assess_branch(&contents) {
                    Ok(assessment) => {
                        self.branches
                            .classify(&branch.id, assessment.branch_type, &assessment.title)?;
                    },
                    Err(e) => tracing::debug!(error = %e, "branch classification deferred"),
                }
            }
            for branch in self.branches.unsummarized_finished(5)? {
                let contents = self.branch_contents(&branch)?;
                if contents.is_empty() {
                    continue;
                }
                match llm.summarize_branch(&contents) {
                    Ok(summary) => self.branches.set_summary(&branch.id, &summary)?,
                    Err(e) => tracing::debug!(error = %e, "branch summary deferred"),
                }
            }
        }
        Ok(())
    }

    fn needs_new_branch(&self, observation: &Observation) -> bool {
        let Some(current) = &self.current else {
            return true;
        };
        if current.project_hash != observation.project_hash {
            return true;
        }
        if current.session_id != observation.session_id {
            return true;
        }
        observation.created_at - current.last_at >= Duration::minutes(BRANCH_GAP_MINUTES)
    }

    fn finish_current(&mut self, state: BranchState) -> Result<()> {
        if let Some(current) = self.current.take() {
            self.branches.finish(&current.id, state)?;
        }
        Ok(())
    }

    fn current_histogram(&self) -> HashMap<String, u32> {
        self.current
            .as_ref()
            .map(|c| c.histogram.clone())
            .unwrap_or_default()
    }

    /// Builds category counts, preferring registry descriptions over names.
    fn categorized_counts(&self, histogram: &HashMap<String, u32>) -> CategoryCounts {
        let mut counts = CategoryCounts::default();
        for (tool, uses) in histogram {
            let description = self
                .tooling
                .get_tool(tool)
                .ok()
                .flatten()
                .and_then(|t| t.description);
            if let Some(category) = categorize_tool(tool, description.as_deref()) {
                counts.add(category, *uses);
            }
        }
        counts
    }

    /// Assigns a type and title once the branch has enough context.
    fn assess_current(&self) {
        let Some(llm) = self.llm.clone() else { return };
        let Some(current) = self.current.as_ref() else { return };
        match llm.assess_branch(&current.recent_contents) {
            Ok(assessment) => {
                if let Err(e) =
                    self.branches
                        .classify(&current.id, assessment.branch_type, &assessment.title)
                {
                    tracing::warn!(error = %e, "branch classification write failed");
                }
            },
            Err(e) => tracing::debug!(error = %e, "branch assessment deferred"),
        }
    }

    /// Loads member observation contents for LLM calls.
    fn branch_contents(&self, branch: &ThoughtBranch) -> Result<Vec<String>> {
        let store = ObservationStore::new(Arc::clone(&self.storage), branch.project_hash.clone());
        let ids: Vec<ObservationId> = self
            .branches
            .observations(&branch.id)?
            .into_iter()
            .map(|m| m.observation_id)
            .collect();
        let mut contents = Vec::with_capacity(ids.len());
        for id in ids.iter().take(ASSESS_CONTEXT_LIMIT) {
            if let Some(observation) = store.get_any(id)? {
                contents.push(observation.content);
            }
        }
        Ok(contents)
    }
}
