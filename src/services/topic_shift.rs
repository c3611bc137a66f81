//! Topic-shift detector: EWMA-adaptive cosine-distance detection with
//! automatic context stashing.
//!
//! Only user-directed sources (Write/Edit/Bash/manual) are evaluated. Every
//! evaluation is logged as a shift decision; at most one stash is produced
//! per embedding processing cycle so a burst of qualifying observations
//! cannot rapid-fire stashes.

use crate::config::TopicDetectionConfig;
use crate::embedding::cosine_distance;
use crate::models::{
    ContextStash, Observation, ObservationSnapshot, ShiftDecision, StashStatus, ThresholdSeed,
};
use crate::rendering::{clip_chars, first_line};
use crate::storage::{SessionStore, ToolingStore};
use crate::Result;
use chrono::Utc;

/// Clamp bounds for the adaptive threshold.
const THRESHOLD_MIN: f32 = 0.15;
const THRESHOLD_MAX: f32 = 0.6;

/// Maximum observations captured into one stash.
pub const STASH_LIMIT: usize = 20;

/// Topic label length cap.
const TOPIC_CHARS: usize = 80;

/// Stash summary length cap.
const SUMMARY_CHARS: usize = 200;

/// Default EWMA state before any history exists.
const DEFAULT_MEAN: f32 = 0.25;
const DEFAULT_VARIANCE: f32 = 0.0025;

/// The adaptive detector. One instance per engine process.
pub struct TopicShiftDetector {
    sessions: SessionStore,
    tooling: ToolingStore,
    config: TopicDetectionConfig,
    prev_embedding: Option<Vec<f32>>,
    ewma_mean: f32,
    ewma_variance: f32,
    stashed_this_cycle: bool,
    session_id: Option<String>,
}

impl TopicShiftDetector {
    /// Creates a detector with default EWMA state.
    #[must_use]
    pub const fn new(
        sessions: SessionStore,
        tooling: ToolingStore,
        config: TopicDetectionConfig,
    ) -> Self {
        Self {
            sessions,
            tooling,
            config,
            prev_embedding: None,
            ewma_mean: DEFAULT_MEAN,
            ewma_variance: DEFAULT_VARIANCE,
            stashed_this_cycle: false,
            session_id: None,
        }
    }

    /// Seeds the EWMA state from historical session averages, when any.
    ///
    /// # Errors
    ///
    /// Returns a storage error when history cannot be read.
    pub fn seed_from_history(&mut self, project_hash: &str) -> Result<()> {
        if let Some(seed) = self.sessions.threshold_seed(project_hash)? {
            self.ewma_mean = seed.ewma_mean;
            self.ewma_variance = seed.ewma_variance;
            tracing::debug!(
                mean = seed.ewma_mean,
                variance = seed.ewma_variance,
                "topic detector seeded from history"
            );
        }
        Ok(())
    }

    /// Associates subsequent decisions with a session.
    pub fn set_session(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    /// Resets the per-cycle stash budget. Called at the top of each
    /// embedding processing cycle.
    pub fn begin_cycle(&mut self) {
        self.stashed_this_cycle = false;
    }

    /// The threshold currently in effect.
    #[must_use]
    pub fn threshold(&self) -> f32 {
        self.config.manual_threshold.map_or_else(
            || {
                let k = self.config.sensitivity.multiplier();
                (k.mul_add(self.ewma_variance.max(0.0).sqrt(), self.ewma_mean))
                    .clamp(THRESHOLD_MIN, THRESHOLD_MAX)
            },
            |manual| manual,
        )
    }

    /// Returns true for sources the user directly steered.
    #[must_use]
    pub fn is_user_directed(source: &str) -> bool {
        matches!(source, "manual" | "hook:Write" | "hook:Edit" | "hook:Bash")
    }

    /// Evaluates one freshly embedded observation.
    ///
    /// Returns the stash id when this evaluation produced one. The first
    /// observation only records state. Every later evaluation logs a shift
    /// decision, confirmed or not.
    ///
    /// # Errors
    ///
    /// Returns a storage error when decision or stash writes fail.
    pub fn process(
        &mut self,
        observation: &Observation,
        embedding: &[f32],
        recent: &[(Observation, Option<Vec<f32>>)],
    ) -> Result<Option<String>> {
        if !Self::is_user_directed(&observation.source) {
            return Ok(None);
        }
        let Some(prev) = self.prev_embedding.replace(embedding.to_vec()) else {
            return Ok(None);
        };

        let distance = cosine_distance(&prev, embedding);
        let threshold = self.threshold();
        let shifted = distance > threshold;
        let confidence = if shifted && threshold > 0.0 {
            ((distance - threshold) / threshold).min(1.0)
        } else {
            0.0
        };

        if self.config.manual_threshold.is_none() {
            let alpha = self.config.alpha;
            self.ewma_mean = alpha.mul_add(distance, (1.0 - alpha) * self.ewma_mean);
            let deviation = distance - self.ewma_mean;
            self.ewma_variance =
                alpha.mul_add(deviation * deviation, (1.0 - alpha) * self.ewma_variance);
        }

        let stash_id = if shifted && !self.stashed_this_cycle {
            let id = self.stash(observation, recent)?;
            self.stashed_this_cycle = true;
            Some(id)
        } else {
            None
        };

        self.sessions.record_shift_decision(&ShiftDecision {
            project_hash: observation.project_hash.clone(),
            session_id: self.session_id.clone(),
            distance,
            threshold,
            ewma_mean: self.ewma_mean,
            ewma_variance: self.ewma_variance,
            shifted,
            confidence,
            stash_id: stash_id.clone(),
            created_at: Utc::now(),
        })?;

        Ok(stash_id)
    }

    /// Persists the final EWMA state at session end.
    ///
    /// # Errors
    ///
    /// Returns a storage error when the write fails.
    pub fn session_end(&mut self, project_hash: &str) -> Result<()> {
        self.sessions.record_threshold(
            project_hash,
            self.session_id.as_deref(),
            ThresholdSeed {
                ewma_mean: self.ewma_mean,
                ewma_variance: self.ewma_variance,
                threshold: self.threshold(),
            },
        )?;
        self.prev_embedding = None;
        Ok(())
    }

    /// Builds and persists a context stash plus its notification.
    fn stash(
        &self,
        trigger: &Observation,
        recent: &[(Observation, Option<Vec<f32>>)],
    ) -> Result<String> {
        let snapshots: Vec<ObservationSnapshot> = recent
            .iter()
            .take(STASH_LIMIT)
            .map(|(obs, embedding)| ObservationSnapshot {
                id: obs.id.clone(),
                content: obs.content.clone(),
                kind: obs.kind,
                timestamp: obs.created_at,
                embedding: embedding.clone(),
            })
            .collect();

        let topic = recent
            .iter()
            .find_map(|(obs, _)| obs.title.clone().filter(|t| !t.is_empty()))
            .unwrap_or_else(|| {
                recent
                    .last()
                    .map_or_else(String::new, |(obs, _)| first_line(&obs.content).to_string())
            });
        let topic = clip_chars(&topic, TOPIC_CHARS);

        let contents: Vec<&str> = recent
            .iter()
            .rev()
            .take(3)
            .map(|(obs, _)| obs.content.as_str())
            .collect();
        let summary = clip_chars(&contents.join(" | "), SUMMARY_CHARS);

        let stash = ContextStash {
            id: crate::models::new_id(),
            project_hash: trigger.project_hash.clone(),
            topic: topic.clone(),
            summary,
            status: StashStatus::Stashed,
            snapshots,
            created_at: Utc::now(),
            resumed_at: None,
        };
        self.sessions.insert_stash(&stash)?;

        let count = stash.snapshots.len();
        self.tooling.enqueue_notification(
            &trigger.project_hash,
            &format!("Topic shift detected. Stashed {count} observations about \"{topic}\"."),
        )?;
        metrics::counter!("laminark_topic_stashes_total").increment(1);
        tracing::info!(stash = stash.id, topic, "topic shift stashed");
        Ok(stash.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Classification, Kind, ObservationId};
    use crate::storage::Storage;
    use std::sync::Arc;

    fn observation(source: &str, title: Option<&str>, content: &str) -> Observation {
        Observation {
            id: ObservationId::random(),
            project_hash: "p".to_string(),
            session_id: Some("s1".to_string()),
            title: title.map(ToString::to_string),
            content: content.to_string(),
            source: source.to_string(),
            kind: Kind::Change,
            classification: Classification::Unset,
            embedding_model: None,
            embedding_version: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn detector(storage: &Arc<Storage>, config: TopicDetectionConfig) -> TopicShiftDetector {
        TopicShiftDetector::new(
            SessionStore::new(Arc::clone(storage)),
            ToolingStore::new(Arc::clone(storage)),
            config,
        )
    }

    fn manual_config(threshold: f32) -> TopicDetectionConfig {
        TopicDetectionConfig {
            manual_threshold: Some(threshold),
            ..Default::default()
        }
    }

    #[test]
    fn first_observation_records_without_decision() {
        let storage = Storage::in_memory().unwrap();
        let mut detector = detector(&storage, TopicDetectionConfig::default());
        detector.begin_cycle();

        let result = detector
            .process(&observation("hook:Edit", None, "start"), &[1.0, 0.0], &[])
            .unwrap();
        assert!(result.is_none());
        let sessions = SessionStore::new(Arc::clone(&storage));
        assert_eq!(sessions.count_shift_decisions("p", false).unwrap(), 0);
    }

    #[test]
    fn assistant_directed_sources_are_ignored() {
        let storage = Storage::in_memory().unwrap();
        let mut detector = detector(&storage, manual_config(0.2));
        detector.begin_cycle();
        detector
            .process(&observation("hook:Edit", None, "a"), &[1.0, 0.0], &[])
            .unwrap();
        // An orthogonal embedding from a non-user source must not evaluate.
        let result = detector
            .process(&observation("hook:WebFetch", None, "b"), &[0.0, 1.0], &[])
            .unwrap();
        assert!(result.is_none());
        let sessions = SessionStore::new(Arc::clone(&storage));
        assert_eq!(sessions.count_shift_decisions("p", false).unwrap(), 0);
    }

    #[test]
    fn orthogonal_jump_produces_one_stash_per_cycle() {
        let storage = Storage::in_memory().unwrap();
        let mut detector = detector(&storage, manual_config(0.3));
        detector.begin_cycle();

        detector
            .process(&observation("hook:Edit", None, "topic A work"), &[1.0, 0.0], &[])
            .unwrap();

        let prior = vec![(observation("hook:Edit", Some("topic A"), "topic A work"), None)];
        let first = detector
            .process(&observation("hook:Edit", None, "topic B begins"), &[0.0, 1.0], &prior)
            .unwrap();
        assert!(first.is_some());

        // A second qualifying jump in the same cycle: decision logged,
        // shifted, but no second stash.
        let second = detector
            .process(&observation("hook:Edit", None, "topic C begins"), &[1.0, 0.0], &prior)
            .unwrap();
        assert!(second.is_none());

        let sessions = SessionStore::new(Arc::clone(&storage));
        assert_eq!(sessions.count_shift_decisions("p", true).unwrap(), 2);
        assert_eq!(sessions.recent_stashes("p", 10).unwrap().len(), 1);

        // Next cycle allows stashing again.
        detector.begin_cycle();
        let third = detector
            .process(&observation("hook:Edit", None, "topic D begins"), &[0.0, 1.0], &prior)
            .unwrap();
        assert!(third.is_some());
    }

    #[test]
    fn stash_carries_topic_label_and_notification() {
        let storage = Storage::in_memory().unwrap();
        let mut detector = detector(&storage, manual_config(0.3));
        detector.begin_cycle();

        detector
            .process(&observation("hook:Edit", None, "auth work"), &[1.0, 0.0], &[])
            .unwrap();
        let prior = vec![
            (observation("hook:Edit", Some("auth refactor"), "auth file edit"), None),
            (observation("hook:Bash", None, "cargo test auth"), None),
        ];
        detector
            .process(&observation("hook:Edit", None, "docs now"), &[0.0, 1.0], &prior)
            .unwrap();

        let sessions = SessionStore::new(Arc::clone(&storage));
        let stashes = sessions.recent_stashes("p", 10).unwrap();
        assert_eq!(stashes.len(), 1);
        assert_eq!(stashes[0].topic, "auth refactor");
        assert_eq!(stashes[0].snapshots.len(), 2);

        let tooling = ToolingStore::new(Arc::clone(&storage));
        let notifications = tooling.consume_notifications("p").unwrap();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].message.starts_with("Topic shift detected."));
    }

    #[test]
    fn adaptive_threshold_clamps_and_adapts() {
        let storage = Storage::in_memory().unwrap();
        let mut detector = detector(&storage, TopicDetectionConfig::default());
        let initial = detector.threshold();
        assert!((THRESHOLD_MIN..=THRESHOLD_MAX).contains(&initial));

        detector.begin_cycle();
        detector
            .process(&observation("hook:Edit", None, "a"), &[1.0, 0.0], &[])
            .unwrap();
        // A run of small distances drags the mean (and threshold) down.
        for _ in 0..20 {
            detector
                .process(&observation("hook:Edit", None, "a"), &[1.0, 0.001], &[])
                .unwrap();
        }
        assert!(detector.threshold() < initial);
        assert!(detector.threshold() >= THRESHOLD_MIN);
    }

    #[test]
    fn manual_override_freezes_threshold() {
        let storage = Storage::in_memory().unwrap();
        let mut detector = detector(&storage, manual_config(0.42));
        detector.begin_cycle();
        detector
            .process(&observation("hook:Edit", None, "a"), &[1.0, 0.0], &[])
            .unwrap();
        for _ in 0..10 {
            detector
                .process(&observation("hook:Edit", None, "a"), &[0.0, 1.0], &[])
                .unwrap();
        }
        assert!((detector.threshold() - 0.42).abs() < f32::EPSILON);
    }

    #[test]
    fn session_end_persists_seed() {
        let storage = Storage::in_memory().unwrap();
        let mut detector = detector(&storage, TopicDetectionConfig::default());
        detector.set_session(Some("s1".to_string()));
        detector.session_end("p").unwrap();

        let sessions = SessionStore::new(Arc::clone(&storage));
        let seed = sessions.threshold_seed("p").unwrap().unwrap();
        assert!(seed.threshold > 0.0);

        let mut next = detector_with_seed(&storage);
        next.seed_from_history("p").unwrap();
        assert!((next.ewma_mean - seed.ewma_mean).abs() < 1e-6);
    }

    fn detector_with_seed(storage: &Arc<Storage>) -> TopicShiftDetector {
        detector(storage, TopicDetectionConfig::default())
    }
}
