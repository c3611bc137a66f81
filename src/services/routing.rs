//! Routing / suggestion engine.
//!
//! Evaluated after each captured tool-use event. Three tiers run in order
//! (proactive rules, learned N-gram patterns, keyword fallback); the first
//! suggestion above the confidence threshold wins. Routing is strictly
//! supplementary: every internal failure is swallowed, and rate limits keep
//! suggestions rare.

use crate::models::{ArcStage, Classification, RegisteredTool, ToolStatus};
use crate::storage::ToolingStore;
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};

/// Suggestions allowed per session.
const MAX_SUGGESTIONS_PER_SESSION: u32 = 2;

/// Tool calls between suggestions.
const COOLDOWN_CALLS: u32 = 5;

/// No suggestions before this many tool calls.
const MIN_CALLS_BEFORE_SUGGESTING: u32 = 3;

/// Confidence floor for any tier to fire.
const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// Sliding-window sizes mined from the usage log.
const PATTERN_WINDOWS: [usize; 2] = [2, 3];

/// Minimum pattern frequency to store.
const MIN_PATTERN_FREQUENCY: u32 = 2;

/// Snapshot of the pipeline state routing decisions read.
#[derive(Debug, Clone, Default)]
pub struct RoutingContext {
    /// Current branch arc stage, when tracking.
    pub arc_stage: Option<ArcStage>,
    /// Classification of the latest observation.
    pub last_classification: Classification,
    /// Whether a debug path is active.
    pub has_active_debug_path: bool,
    /// Contents of the last few observations (keyword fallback input).
    pub recent_contents: Vec<String>,
}

/// A fixed context-pattern rule.
struct ProactiveRule {
    stage: Option<ArcStage>,
    classification: Option<Classification>,
    requires_active_path: bool,
    keywords: &'static [&'static str],
    confidence: f32,
}

static PROACTIVE_RULES: Lazy<Vec<ProactiveRule>> = Lazy::new(|| {
    vec![
        ProactiveRule {
            stage: None,
            classification: None,
            requires_active_path: true,
            keywords: &["debug", "log", "trace"],
            confidence: 0.8,
        },
        ProactiveRule {
            stage: Some(ArcStage::Verification),
            classification: None,
            requires_active_path: false,
            keywords: &["test", "coverage", "check"],
            confidence: 0.75,
        },
        ProactiveRule {
            stage: None,
            classification: Some(Classification::Problem),
            requires_active_path: false,
            keywords: &["debug", "search", "history"],
            confidence: 0.7,
        },
        ProactiveRule {
            stage: Some(ArcStage::Execution),
            classification: None,
            requires_active_path: false,
            keywords: &["format", "lint", "refactor"],
            confidence: 0.6,
        },
    ]
});

/// The suggestion engine. Stateless apart from persisted routing state.
pub struct RoutingEngine {
    tooling: ToolingStore,
}

impl RoutingEngine {
    /// Creates a routing engine.
    #[must_use]
    pub const fn new(tooling: ToolingStore) -> Self {
        Self { tooling }
    }

    /// Mines sliding-window N-gram patterns from the usage log. Called once
    /// at session start; returns the number of patterns stored.
    pub fn precompute_patterns(&self, project_hash: &str) -> usize {
        let sequences = match self.tooling.recent_tool_sequences(project_hash, 500) {
            Ok(sequences) => sequences,
            Err(e) => {
                tracing::debug!(error = %e, "pattern mining skipped");
                return 0;
            },
        };

        let mut frequencies: HashMap<(Vec<String>, String), u32> = HashMap::new();
        for sequence in &sequences {
            for window_size in PATTERN_WINDOWS {
                for window in sequence.windows(window_size) {
                    let (preceding, target) = window.split_at(window_size - 1);
                    let key = (preceding.to_vec(), target[0].clone());
                    *frequencies.entry(key).or_insert(0) += 1;
                }
            }
        }

        let mut stored = 0;
        for ((preceding, target), frequency) in frequencies {
            if frequency < MIN_PATTERN_FREQUENCY {
                continue;
            }
            match self
                .tooling
                .upsert_routing_pattern(project_hash, &preceding, &target, frequency)
            {
                Ok(()) => stored += 1,
                Err(e) => tracing::debug!(error = %e, "pattern store failed"),
            }
        }
        stored
    }

    /// Evaluates the tiers after one captured tool event.
    ///
    /// Returns a user-visible suggestion message, or `None`. Never fails:
    /// routing must not affect the capture path.
    pub fn evaluate(
        &self,
        project_hash: &str,
        session_id: &str,
        context: &RoutingContext,
    ) -> Option<String> {
        let (mut calls, suggestions, last_at) =
            self.tooling.routing_state(session_id).ok()?;
        calls += 1;

        let allowed = calls > MIN_CALLS_BEFORE_SUGGESTING
            && suggestions < MAX_SUGGESTIONS_PER_SESSION
            && last_at.is_none_or(|at| calls >= at + COOLDOWN_CALLS);

        let suggestion = if allowed { self.pick(project_hash, session_id, context) } else { None };

        let (new_suggestions, new_last) = if suggestion.is_some() {
            (suggestions + 1, Some(calls))
        } else {
            (suggestions, last_at)
        };
        if let Err(e) = self.tooling.save_routing_state(
            session_id,
            project_hash,
            calls,
            new_suggestions,
            new_last,
        ) {
            tracing::debug!(error = %e, "routing state save failed");
        }

        suggestion.map(|(tool, reason)| format!("Consider using {tool}: {reason}"))
    }

    /// Runs the three tiers in order.
    fn pick(
        &self,
        project_hash: &str,
        session_id: &str,
        context: &RoutingContext,
    ) -> Option<(String, String)> {
        let tools = self.tooling.active_tools(50).ok()?;
        let usable: Vec<&RegisteredTool> = tools
            .iter()
            .filter(|t| t.status == ToolStatus::Active)
            .collect();
        if usable.is_empty() {
            return None;
        }

        if let Some(hit) = self.tier_rules(context, &usable) {
            return Some(hit);
        }
        if let Some(hit) = self.tier_patterns(project_hash, session_id, &usable) {
            return Some(hit);
        }
        self.tier_keywords(context, &usable)
    }

    /// Tier 1: fixed context-pattern rules against trigger hints.
    fn tier_rules(
        &self,
        context: &RoutingContext,
        tools: &[&RegisteredTool],
    ) -> Option<(String, String)> {
        let mut best: Option<(f32, String)> = None;
        for rule in PROACTIVE_RULES.iter() {
            if rule.requires_active_path && !context.has_active_debug_path {
                continue;
            }
            if let Some(stage) = rule.stage {
                if context.arc_stage != Some(stage) {
                    continue;
                }
            }
            if let Some(classification) = rule.classification {
                if context.last_classification != classification {
                    continue;
                }
            }

            for tool in tools {
                let quality = keyword_match_quality(tool, rule.keywords);
                let score = rule.confidence * quality;
                if score >= CONFIDENCE_THRESHOLD
                    && best.as_ref().is_none_or(|(s, _)| score > *s)
                {
                    best = Some((score, tool.name.clone()));
                }
            }
        }
        best.map(|(_, name)| (name, "it matches the current work context".to_string()))
    }

    /// Tier 2: learned preceding-tools patterns by set overlap.
    fn tier_patterns(
        &self,
        project_hash: &str,
        session_id: &str,
        tools: &[&RegisteredTool],
    ) -> Option<(String, String)> {
        let recent = self.tooling.session_tool_sequence(session_id).ok()?;
        if recent.is_empty() {
            return None;
        }
        let recent_set: HashSet<&str> = recent
            .iter()
            .rev()
            .take(3)
            .map(String::as_str)
            .collect();
        let last_tool = recent.last().map(String::as_str).unwrap_or_default();

        let patterns = self.tooling.routing_patterns(project_hash).ok()?;
        let mut best: Option<(f32, String)> = None;
        for (preceding, target, frequency) in patterns {
            if preceding.is_empty() || target == last_tool {
                continue;
            }
            if !tools.iter().any(|t| t.name == target) {
                continue;
            }
            let overlap = preceding
                .iter()
                .filter(|p| recent_set.contains(p.as_str()))
                .count() as f32
                / preceding.len() as f32;
            let score = overlap * (frequency as f32 / 3.0).min(1.0);
            if score >= CONFIDENCE_THRESHOLD && best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, target));
            }
        }
        best.map(|(_, name)| (name, "it usually follows your recent tools".to_string()))
    }

    /// Tier 3: keyword overlap between recent contents and descriptions.
    fn tier_keywords(
        &self,
        context: &RoutingContext,
        tools: &[&RegisteredTool],
    ) -> Option<(String, String)> {
        let tokens: HashSet<String> = context
            .recent_contents
            .iter()
            .rev()
            .take(3)
            .flat_map(|content| {
                content
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| t.len() > 3)
                    .map(str::to_lowercase)
                    .collect::<Vec<_>>()
            })
            .collect();
        if tokens.is_empty() {
            return None;
        }

        let mut best: Option<(f32, String)> = None;
        for tool in tools {
            let haystack = format!(
                "{} {}",
                tool.description.as_deref().unwrap_or_default(),
                tool.trigger_hints.join(" ")
            )
            .to_lowercase();
            let matched = tokens.iter().filter(|t| haystack.contains(*t)).count();
            let score = (matched as f32 / 4.0).min(1.0);
            if score >= 0.6 && best.as_ref().is_none_or(|(s, _)| score > *s) {
                best = Some((score, tool.name.clone()));
            }
        }
        best.map(|(_, name)| (name, "its description matches your recent work".to_string()))
    }
}

/// Fraction of rule keywords present in a tool's hints and description.
fn keyword_match_quality(tool: &RegisteredTool, keywords: &[&str]) -> f32 {
    let haystack = format!(
        "{} {}",
        tool.description.as_deref().unwrap_or_default(),
        tool.trigger_hints.join(" ")
    )
    .to_lowercase();
    let matched = keywords.iter().filter(|k| haystack.contains(*k)).count();
    matched as f32 / keywords.len() as f32
}
