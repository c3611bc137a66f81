//! Debug-path tracker: turns error bursts into structured debugging arcs.
//!
//! States: idle → potential (buffering errors in a sliding window) →
//! active (appending waypoints) → resolved (three consecutive successes)
//! → idle. Manual path controls mirror the automatic transitions, and an
//! active path found in storage on restart is adopted as live state.

use crate::llm::LlmProvider;
use crate::models::{DebugPath, DebugSignal, WaypointKind};
use crate::storage::PathStore;
use crate::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Sliding window for buffered errors.
const ERROR_WINDOW_MINUTES: i64 = 5;

/// Buffered errors needed to open a path.
const ERROR_THRESHOLD: usize = 3;

/// Maximum waypoints persisted per path.
const WAYPOINT_CAP: usize = 30;

/// Consecutive successes that resolve a path.
const SUCCESSES_TO_RESOLVE: u32 = 3;

/// Minimum classifier confidence for an error signal to count.
const MIN_ERROR_CONFIDENCE: f32 = 0.5;

#[derive(Debug)]
enum Phase {
    Idle,
    Potential,
    Active { path_id: String },
}

/// Stateful tracker over debug signals.
pub struct DebugTracker {
    paths: PathStore,
    llm: Option<Arc<dyn LlmProvider>>,
    phase: Phase,
    error_buffer: Vec<(DateTime<Utc>, String)>,
    consecutive_successes: u32,
}

impl DebugTracker {
    /// Creates an idle tracker.
    #[must_use]
    pub fn new(paths: PathStore, llm: Option<Arc<dyn LlmProvider>>) -> Self {
        Self {
            paths,
            llm,
            phase: Phase::Idle,
            error_buffer: Vec::new(),
            consecutive_successes: 0,
        }
    }

    /// Adopts an active path left in storage by a previous process.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the lookup fails.
    pub fn recover(&mut self, project_hash: &str) -> Result<()> {
        if let Some(path) = self.paths.active(project_hash)? {
            tracing::info!(path = path.id, "recovered active debug path");
            self.phase = Phase::Active { path_id: path.id };
            self.consecutive_successes = 0;
        }
        Ok(())
    }

    /// The active path id, when debugging.
    #[must_use]
    pub fn active_path_id(&self) -> Option<&str> {
        match &self.phase {
            Phase::Active { path_id } => Some(path_id),
            _ => None,
        }
    }

    /// Handles one debug signal in classifier-batch order.
    ///
    /// # Errors
    ///
    /// Returns a storage error when path writes fail; LLM failures are
    /// swallowed.
    pub fn on_signal(
        &mut self,
        project_hash: &str,
        session_id: Option<&str>,
        summary: &str,
        signal: &DebugSignal,
    ) -> Result<()> {
        match &self.phase {
            Phase::Idle => {
                if is_countable_error(signal) {
                    self.error_buffer.push((Utc::now(), summarize(summary)));
                    self.phase = Phase::Potential;
                }
            },
            Phase::Potential => {
                self.prune_window();
                if is_countable_error(signal) {
                    self.error_buffer.push((Utc::now(), summarize(summary)));
                }
                if self.error_buffer.len() >= ERROR_THRESHOLD {
                    self.open_path(project_hash, session_id)?;
                } else if self.error_buffer.is_empty() {
                    self.phase = Phase::Idle;
                }
            },
            Phase::Active { path_id } => {
                let path_id = path_id.clone();
                self.append_signal(&path_id, summary, signal)?;
            },
        }
        Ok(())
    }

    /// Manually opens a path, mirroring the automatic transition.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the path cannot be created.
    pub fn start_manual(
        &mut self,
        project_hash: &str,
        session_id: Option<&str>,
        trigger: &str,
    ) -> Result<DebugPath> {
        let path = self.paths.create(project_hash, session_id, trigger)?;
        self.phase = Phase::Active { path_id: path.id.clone() };
        self.error_buffer.clear();
        self.consecutive_successes = 0;
        Ok(path)
    }

    /// Manually resolves the active path, mirroring the automatic
    /// transition. Returns the resolved path, or `None` when idle.
    ///
    /// # Errors
    ///
    /// Returns a storage error when path writes fail.
    pub fn resolve_manual(&mut self, resolution: &str) -> Result<Option<DebugPath>> {
        let Phase::Active { path_id } = &self.phase else {
            return Ok(None);
        };
        let path_id = path_id.clone();
        self.resolve_path(&path_id, resolution)?;
        Ok(self.paths.get(&path_id)?)
    }

    fn open_path(&mut self, project_hash: &str, session_id: Option<&str>) -> Result<()> {
        let trigger = self
            .error_buffer
            .first()
            .map(|(_, s)| s.clone())
            .unwrap_or_else(|| "repeated errors".to_string());
        let path = self.paths.create(project_hash, session_id, &trigger)?;
        for (_, error_summary) in self.error_buffer.drain(..) {
            self.paths
                .append_waypoint(&path.id, WaypointKind::Error, &error_summary)?;
        }
        tracing::info!(path = path.id, "debug path opened");
        metrics::counter!("laminark_debug_paths_opened_total").increment(1);
        self.phase = Phase::Active { path_id: path.id };
        self.consecutive_successes = 0;
        Ok(())
    }

    fn append_signal(&mut self, path_id: &str, summary: &str, signal: &DebugSignal) -> Result<()> {
        let kind = waypoint_kind(signal);

        // The cap bounds persistence, not the success counter.
        if self.paths.waypoint_count(path_id)? < WAYPOINT_CAP {
            self.paths.append_waypoint(path_id, kind, &summarize(summary))?;
        }

        if is_success(kind) {
            self.consecutive_successes += 1;
        } else {
            self.consecutive_successes = 0;
        }

        if self.consecutive_successes >= SUCCESSES_TO_RESOLVE {
            self.resolve_path(path_id, &summarize(summary))?;
        }
        Ok(())
    }

    fn resolve_path(&mut self, path_id: &str, resolution: &str) -> Result<()> {
        self.paths.resolve(path_id, resolution)?;
        if self.paths.waypoint_count(path_id)? < WAYPOINT_CAP {
            self.paths
                .append_waypoint(path_id, WaypointKind::Resolution, resolution)?;
        }
        tracing::info!(path = path_id, "debug path resolved");
        metrics::counter!("laminark_debug_paths_resolved_total").increment(1);

        self.generate_kiss_summary(path_id);

        self.phase = Phase::Idle;
        self.error_buffer.clear();
        self.consecutive_successes = 0;
        Ok(())
    }

    /// Best-effort structured summary; failures leave the path resolved
    /// without one.
    fn generate_kiss_summary(&self, path_id: &str) {
        let Some(llm) = &self.llm else { return };
        let Ok(Some(path)) = self.paths.get(path_id) else { return };
        let Ok(waypoints) = self.paths.waypoints(path_id) else { return };
        let lines: Vec<String> = waypoints
            .iter()
            .map(|w| format!("{}: {}", w.kind, w.summary))
            .collect();
        match llm.summarize_debug_path(&path.trigger, &lines) {
            Ok(summary) => {
                if let Err(e) = self.paths.set_kiss_summary(path_id, &summary) {
                    tracing::warn!(error = %e, "kiss summary write failed");
                }
            },
            Err(e) => tracing::debug!(error = %e, "kiss summary deferred"),
        }
    }

    fn prune_window(&mut self) {
        let cutoff = Utc::now() - Duration::minutes(ERROR_WINDOW_MINUTES);
        self.error_buffer.retain(|(at, _)| *at >= cutoff);
    }
}

fn is_countable_error(signal: &DebugSignal) -> bool {
    signal.is_error && signal.confidence >= MIN_ERROR_CONFIDENCE
}

fn waypoint_kind(signal: &DebugSignal) -> WaypointKind {
    if let Some(hint) = signal.waypoint_hint {
        return hint;
    }
    if signal.is_error {
        WaypointKind::Error
    } else if signal.is_resolution {
        WaypointKind::Success
    } else {
        WaypointKind::Attempt
    }
}

const fn is_success(kind: WaypointKind) -> bool {
    matches!(kind, WaypointKind::Success | WaypointKind::Resolution)
}

fn summarize(content: &str) -> String {
    crate::rendering::clip_chars(crate::rendering::first_line(content), 120)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PathState;
    use crate::storage::Storage;

    fn tracker() -> DebugTracker {
        DebugTracker::new(PathStore::new(Storage::in_memory().unwrap()), None)
    }

    fn error_signal() -> DebugSignal {
        DebugSignal {
            is_error: true,
            is_resolution: false,
            waypoint_hint: None,
            confidence: 0.9,
        }
    }

    fn resolution_signal() -> DebugSignal {
        DebugSignal {
            is_error: false,
            is_resolution: true,
            waypoint_hint: None,
            confidence: 0.9,
        }
    }

    #[test]
    fn three_errors_open_a_path_with_waypoints() {
        let mut tracker = tracker();
        for i in 0..3 {
            tracker
                .on_signal("p", Some("s1"), &format!("error {i}"), &error_signal())
                .unwrap();
        }
        let path_id = tracker.active_path_id().unwrap().to_string();
        let path = tracker.paths.get(&path_id).unwrap().unwrap();
        assert_eq!(path.state, PathState::Active);
        assert_eq!(path.trigger, "error 0");

        let waypoints = tracker.paths.waypoints(&path_id).unwrap();
        assert_eq!(waypoints.len(), 3);
        assert!(waypoints.iter().all(|w| w.kind == WaypointKind::Error));
    }

    #[test]
    fn low_confidence_errors_do_not_count() {
        let mut tracker = tracker();
        let weak = DebugSignal { confidence: 0.3, ..error_signal() };
        for _ in 0..5 {
            tracker.on_signal("p", None, "maybe error", &weak).unwrap();
        }
        assert!(tracker.active_path_id().is_none());
    }

    #[test]
    fn three_successes_resolve_and_append_resolution() {
        let mut tracker = tracker();
        for i in 0..3 {
            tracker
                .on_signal("p", None, &format!("error {i}"), &error_signal())
                .unwrap();
        }
        let path_id = tracker.active_path_id().unwrap().to_string();

        // A failure in between resets the counter.
        tracker.on_signal("p", None, "tests pass", &resolution_signal()).unwrap();
        tracker.on_signal("p", None, "another error", &error_signal()).unwrap();
        for _ in 0..3 {
            tracker.on_signal("p", None, "tests green", &resolution_signal()).unwrap();
        }

        assert!(tracker.active_path_id().is_none());
        let path = tracker.paths.get(&path_id).unwrap().unwrap();
        assert_eq!(path.state, PathState::Resolved);
        let waypoints = tracker.paths.waypoints(&path_id).unwrap();
        assert_eq!(waypoints.last().unwrap().kind, WaypointKind::Resolution);
    }

    #[test]
    fn waypoint_cap_bounds_persistence_not_counting() {
        let mut tracker = tracker();
        for i in 0..3 {
            tracker
                .on_signal("p", None, &format!("error {i}"), &error_signal())
                .unwrap();
        }
        let path_id = tracker.active_path_id().unwrap().to_string();

        // Flood with attempts far past the cap.
        let attempt = DebugSignal { is_error: false, ..error_signal() };
        for i in 0..40 {
            tracker.on_signal("p", None, &format!("attempt {i}"), &attempt).unwrap();
        }
        assert!(tracker.paths.waypoint_count(&path_id).unwrap() <= 30);

        // Successes past the cap still resolve the path.
        for _ in 0..3 {
            tracker.on_signal("p", None, "green", &resolution_signal()).unwrap();
        }
        assert_eq!(
            tracker.paths.get(&path_id).unwrap().unwrap().state,
            PathState::Resolved
        );
    }

    #[test]
    fn manual_controls_mirror_automatic() {
        let mut tracker = tracker();
        let path = tracker.start_manual("p", Some("s1"), "debugging flaky test").unwrap();
        assert_eq!(tracker.active_path_id(), Some(path.id.as_str()));

        let resolved = tracker.resolve_manual("pinned the clock").unwrap().unwrap();
        assert_eq!(resolved.state, PathState::Resolved);
        assert!(tracker.active_path_id().is_none());
        assert!(tracker.resolve_manual("again").unwrap().is_none());
    }

    #[test]
    fn recover_adopts_active_path() {
        let storage = Storage::in_memory().unwrap();
        let paths = PathStore::new(Arc::clone(&storage));
        let path = paths.create("p", None, "left behind").unwrap();

        let mut tracker = DebugTracker::new(paths, None);
        tracker.recover("p").unwrap();
        assert_eq!(tracker.active_path_id(), Some(path.id.as_str()));
    }

    #[test]
    fn waypoint_hint_overrides_booleans() {
        let signal = DebugSignal {
            is_error: true,
            is_resolution: false,
            waypoint_hint: Some(WaypointKind::Pivot),
            confidence: 0.8,
        };
        assert_eq!(waypoint_kind(&signal), WaypointKind::Pivot);
    }
}
