//! LLM adapter seam.
//!
//! The classifier agent is optional: every call site tolerates an absent or
//! failing provider by leaving rows unclassified and retrying next cycle.
//! [`LlmProvider`] keeps the seam narrow: one `complete` primitive per
//! provider, with the typed enrichment calls implemented on top of it as
//! default methods that build prompts and parse JSON responses.

mod anthropic;

pub use anthropic::AnthropicClient;

use crate::models::{BranchType, Classification, DebugSignal, KissSummary, NodeType};
use crate::{Error, Result};
use serde::Deserialize;

/// Coarse verdict from classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalVerdict {
    /// Worth keeping and enriching.
    Signal,
    /// Low-value; soft-deleted after classification.
    Noise,
}

/// Structured result of an observation classification call.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationOutcome {
    /// Noise-or-signal verdict.
    pub signal: SignalVerdict,
    /// Fine classification when the verdict is signal.
    #[serde(default)]
    pub classification: Option<Classification>,
    /// One-line rationale.
    #[serde(default)]
    pub reason: String,
    /// Debug-relevant signal forwarded to the debug-path tracker.
    #[serde(default)]
    pub debug_signal: DebugSignal,
}

/// One extracted entity candidate, pre quality gate.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityCandidate {
    /// Entity name as extracted.
    pub name: String,
    /// Entity type.
    #[serde(rename = "type")]
    pub entity_type: NodeType,
    /// Extraction confidence in `[0, 1]`.
    pub confidence: f32,
}

/// One inferred relationship between extracted entities.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationshipCandidate {
    /// Source entity name.
    pub source: String,
    /// Target entity name.
    pub target: String,
    /// Relationship type.
    #[serde(rename = "type")]
    pub relationship: crate::models::EdgeType,
    /// Association strength in `[0, 1]`.
    #[serde(default = "default_weight")]
    pub weight: f32,
}

const fn default_weight() -> f32 {
    0.5
}

/// Type and title assigned to a thought branch.
#[derive(Debug, Clone, Deserialize)]
pub struct BranchAssessment {
    /// Work-unit category.
    #[serde(rename = "type")]
    pub branch_type: BranchType,
    /// Short title.
    pub title: String,
}

const CLASSIFY_SYSTEM: &str = "You label observations captured from a coding session. \
Respond with JSON only: {\"signal\": \"signal\"|\"noise\", \
\"classification\": \"discovery\"|\"problem\"|\"solution\"|null, \
\"reason\": string, \
\"debug_signal\": {\"is_error\": bool, \"is_resolution\": bool, \
\"waypoint_hint\": \"error\"|\"attempt\"|\"failure\"|\"success\"|\"pivot\"|\"revert\"|\"discovery\"|\"resolution\"|null, \
\"confidence\": number}}";

const ENTITIES_SYSTEM: &str = "You extract entities from a coding-session observation. \
Types: file, project, decision, problem, solution, reference. \
Respond with a JSON array only: \
[{\"name\": string, \"type\": string, \"confidence\": number}]";

const RELATIONSHIPS_SYSTEM: &str = "You infer relationships between named entities based on an \
observation. Types: related_to, solved_by, caused_by, modifies, informed_by, references, \
verified_by, preceded_by. Respond with a JSON array only: \
[{\"source\": string, \"target\": string, \"type\": string, \"weight\": number}]";

const BRANCH_SYSTEM: &str = "You classify a unit of coding work from its observations. \
Types: investigation, bug_fix, feature, refactor, research, unknown. \
Respond with JSON only: {\"type\": string, \"title\": string (max 60 chars)}";

const KISS_SYSTEM: &str = "You summarize a resolved debugging arc so the lesson is reusable. \
Respond with JSON only: {\"kiss_summary\": string, \"root_cause\": string, \
\"what_fixed_it\": string, \"dimensions\": {\"logical\": string, \
\"programmatic\": string, \"development\": string}}";

const SESSION_SYSTEM: &str = "You compress a coding session's observations, already grouped by \
kind, into a short plain-text summary (max 120 words). Keep concrete names and decisions.";

/// Unified interface to LLM providers.
pub trait LlmProvider: Send + Sync {
    /// Returns the provider identifier (e.g. `anthropic`).
    fn name(&self) -> &'static str;

    /// Generates a completion for a prompt under a system instruction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterUnavailable`] when the service is down or
    /// unconfigured and [`Error::AdapterTimeout`] on wall-clock expiry.
    fn complete(&self, system: &str, prompt: &str) -> Result<String>;

    /// Classifies one observation, returning the noise/signal verdict, the
    /// fine label, and the debug signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the call or response parsing fails; the caller
    /// leaves the row unclassified and retries next cycle.
    fn classify_observation(&self, source: &str, content: &str) -> Result<ClassificationOutcome> {
        let prompt = format!("Source: {source}\n\nObservation:\n{content}");
        let response = self.complete(CLASSIFY_SYSTEM, &prompt)?;
        parse_json(self.name(), &response)
    }

    /// Extracts entity candidates from an observation.
    ///
    /// # Errors
    ///
    /// Returns an error if the call or response parsing fails.
    fn extract_entities(&self, content: &str) -> Result<Vec<EntityCandidate>> {
        let response = self.complete(ENTITIES_SYSTEM, content)?;
        parse_json(self.name(), &response)
    }

    /// Infers typed relationships among surviving entities.
    ///
    /// # Errors
    ///
    /// Returns an error if the call or response parsing fails.
    fn infer_relationships(
        &self,
        entities: &[String],
        content: &str,
    ) -> Result<Vec<RelationshipCandidate>> {
        let prompt = format!("Entities: {}\n\nObservation:\n{content}", entities.join(", "));
        let response = self.complete(RELATIONSHIPS_SYSTEM, &prompt)?;
        parse_json(self.name(), &response)
    }

    /// Assigns a type and short title to a thought branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the call or response parsing fails.
    fn assess_branch(&self, observations: &[String]) -> Result<BranchAssessment> {
        let response = self.complete(BRANCH_SYSTEM, &observations.join("\n---\n"))?;
        parse_json(self.name(), &response)
    }

    /// Generates a free-text summary for a finished branch.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    fn summarize_branch(&self, observations: &[String]) -> Result<String> {
        let response = self.complete(
            "Summarize this unit of coding work in at most 50 words. Plain text only.",
            &observations.join("\n---\n"),
        )?;
        Ok(response.trim().to_string())
    }

    /// Generates the structured KISS summary for a resolved debug path.
    ///
    /// # Errors
    ///
    /// Returns an error if the call or response parsing fails.
    fn summarize_debug_path(&self, trigger: &str, waypoints: &[String]) -> Result<KissSummary> {
        let prompt = format!("Trigger: {trigger}\n\nWaypoints:\n{}", waypoints.join("\n"));
        let response = self.complete(KISS_SYSTEM, &prompt)?;
        parse_json(self.name(), &response)
    }

    /// Polishes a kind-grouped session rendering into a summary.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails.
    fn summarize_session(&self, grouped: &str) -> Result<String> {
        let response = self.complete(SESSION_SYSTEM, grouped)?;
        Ok(response.trim().to_string())
    }
}

/// Strips a markdown code fence wrapper when present.
///
/// Providers occasionally wrap JSON in ```json fences despite instructions;
/// tolerating that beats a retry cycle.
#[must_use]
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

fn parse_json<T: serde::de::DeserializeOwned>(provider: &str, response: &str) -> Result<T> {
    serde_json::from_str(strip_code_fences(response)).map_err(|e| Error::AdapterUnavailable {
        adapter: provider.to_string(),
        cause: format!("unparseable response: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CannedProvider(&'static str);

    impl LlmProvider for CannedProvider {
        fn name(&self) -> &'static str {
            "canned"
        }

        fn complete(&self, _system: &str, _prompt: &str) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    #[test]
    fn strip_code_fences_variants() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n[]\n```"), "[]");
    }

    #[test]
    fn classify_parses_full_payload() {
        let provider = CannedProvider(
            r#"{"signal": "signal", "classification": "problem",
                "reason": "stack trace present",
                "debug_signal": {"is_error": true, "is_resolution": false,
                                 "waypoint_hint": "error", "confidence": 0.9}}"#,
        );
        let outcome = provider.classify_observation("hook:Bash", "panic at src/x.rs").unwrap();
        assert_eq!(outcome.signal, SignalVerdict::Signal);
        assert_eq!(outcome.classification, Some(Classification::Problem));
        assert!(outcome.debug_signal.is_error);
        assert_eq!(
            outcome.debug_signal.waypoint_hint,
            Some(crate::models::WaypointKind::Error)
        );
    }

    #[test]
    fn classify_tolerates_fenced_and_sparse_payload() {
        let provider = CannedProvider("```json\n{\"signal\": \"noise\"}\n```");
        let outcome = provider.classify_observation("hook:Bash", "ls output").unwrap();
        assert_eq!(outcome.signal, SignalVerdict::Noise);
        assert!(outcome.classification.is_none());
        assert!(!outcome.debug_signal.is_error);
    }

    #[test]
    fn entities_parse_with_type_rename() {
        let provider = CannedProvider(
            r#"[{"name": "src/auth.rs", "type": "file", "confidence": 0.97},
                {"name": "use sqlite", "type": "decision", "confidence": 0.7}]"#,
        );
        let entities = provider.extract_entities("edited src/auth.rs").unwrap();
        assert_eq!(entities.len(), 2);
        assert_eq!(entities[0].entity_type, NodeType::File);
    }

    #[test]
    fn malformed_response_is_adapter_error() {
        let provider = CannedProvider("I think this is a discovery!");
        let err = provider.classify_observation("manual", "text").unwrap_err();
        assert!(matches!(err, Error::AdapterUnavailable { .. }));
    }

    #[test]
    fn relationship_weight_defaults() {
        let provider = CannedProvider(
            r#"[{"source": "flaky test", "target": "mock clock", "type": "caused_by"}]"#,
        );
        let rels = provider.infer_relationships(&[], "text").unwrap();
        assert!((rels[0].weight - 0.5).abs() < f32::EPSILON);
    }
}
