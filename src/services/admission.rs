//! Admission filter for hook-captured tool events.
//!
//! Decides whether an event becomes an observation, lands in the research
//! buffer, or is dropped. High-signal write tools are always admitted;
//! exploration tools never create observations; bash commands must clear a
//! meaningful/navigation keyword gate.

use crate::models::{Kind, NewObservation, ToolEvent};
use crate::rendering::clip_chars;
use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Content above this length must carry a decision/error indicator.
const LONG_CONTENT_CHARS: usize = 5_000;

/// Maximum bash output excerpt appended to an observation.
const BASH_OUTPUT_EXCERPT_CHARS: usize = 400;

/// Tools that are always admitted regardless of content.
static HIGH_SIGNAL_TOOLS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["Write", "Edit", "WebFetch", "WebSearch"]));

/// Exploration tools routed to the research buffer.
static RESEARCH_TOOLS: Lazy<HashSet<&'static str>> =
    Lazy::new(|| HashSet::from(["Read", "Glob", "Grep"]));

/// Command prefixes that make a bash event worth keeping.
static MEANINGFUL_BASH: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "cargo build", "cargo test", "cargo run", "cargo check", "cargo clippy",
        "npm install", "npm test", "npm run", "pnpm", "yarn",
        "make", "pytest", "go build", "go test",
        "git commit", "git merge", "git rebase", "git push", "git revert",
        "git cherry-pick", "git reset", "git stash",
        "docker build", "docker run", "docker compose", "podman",
        "pip install", "apt install", "apt-get install", "brew install",
    ]
});

/// Command prefixes that are pure navigation.
static NAVIGATION_BASH: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "ls", "cd", "pwd", "echo", "cat", "which", "env", "whoami",
        "git status", "git log", "git diff", "git branch", "git show",
    ]
});

/// Indicator keywords that admit very long content.
static INDICATOR_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "error", "fail", "panic", "exception", "traceback",
        "decided", "decision", "because", "fix", "bug", "regression",
    ]
});

/// The engine's own tool names; capturing them would echo forever.
static OWN_TOOLS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "save_memory", "recall", "ingest_knowledge", "topic_context", "query_graph",
        "graph_stats", "hygiene", "status", "discover_tools", "report_available_tools",
        "path_start", "path_resolve", "path_show", "path_list",
        "query_branches", "show_branch", "branch_summary",
    ])
});

/// Outcome of evaluating one hook event.
#[derive(Debug, Clone)]
pub enum Admission {
    /// Create an observation.
    Admit(NewObservation),
    /// Record in the research buffer instead.
    Research {
        /// What was explored (path, pattern, query).
        query: String,
    },
    /// Drop the event.
    Reject(String),
}

/// Stateless admission rule set.
pub struct AdmissionFilter;

impl AdmissionFilter {
    /// Evaluates one tool event against the admission rules.
    #[must_use]
    pub fn evaluate(event: &ToolEvent) -> Admission {
        let tool = event.tool_name.as_str();

        if Self::is_own_tool(tool) {
            return Admission::Reject("engine-internal tool".to_string());
        }

        if RESEARCH_TOOLS.contains(tool) {
            let query = research_query(event);
            if query.is_empty() {
                return Admission::Reject("empty exploration query".to_string());
            }
            return Admission::Research { query };
        }

        if HIGH_SIGNAL_TOOLS.contains(tool) {
            return match format_event(event) {
                Some(input) => Admission::Admit(input),
                None => Admission::Reject("empty content".to_string()),
            };
        }

        if tool == "Bash" {
            let command = str_field(&event.tool_input, "command").unwrap_or_default();
            if command.is_empty() {
                return Admission::Reject("empty command".to_string());
            }
            if matches_prefix(&command, &NAVIGATION_BASH) {
                return Admission::Reject("navigation command".to_string());
            }
            if !matches_prefix(&command, &MEANINGFUL_BASH) {
                return Admission::Reject("command not in meaningful set".to_string());
            }
            return match format_event(event) {
                Some(input) => check_long_content(input),
                None => Admission::Reject("empty content".to_string()),
            };
        }

        // Unknown tools pass through the length gate as findings.
        match format_event(event) {
            Some(input) => check_long_content(input),
            None => Admission::Reject("empty content".to_string()),
        }
    }

    /// Returns true for the engine's own tool surface.
    #[must_use]
    pub fn is_own_tool(tool: &str) -> bool {
        OWN_TOOLS.contains(tool) || tool.starts_with("mcp__laminark")
    }
}

/// Rejects long content lacking any decision/error indicator.
fn check_long_content(input: NewObservation) -> Admission {
    if input.content.chars().count() > LONG_CONTENT_CHARS {
        let lowered = input.content.to_lowercase();
        if !INDICATOR_KEYWORDS.iter().any(|k| lowered.contains(k)) {
            return Admission::Reject("long content without indicators".to_string());
        }
    }
    Admission::Admit(input)
}

/// Formats a tool event into observation input. `None` when nothing useful
/// can be said about it.
fn format_event(event: &ToolEvent) -> Option<NewObservation> {
    let input = &event.tool_input;
    let (kind, title, content) = match event.tool_name.as_str() {
        "Edit" => {
            let file = str_field(input, "file_path")?;
            let old = str_field(input, "old_string").unwrap_or_default();
            let new = str_field(input, "new_string").unwrap_or_default();
            (
                Kind::Change,
                file_stem(&file),
                format!(
                    "[Edit] Modified {file}: replaced \"{}\" with \"{}\"",
                    clip_chars(&old, 120),
                    clip_chars(&new, 120)
                ),
            )
        },
        "Write" => {
            let file = str_field(input, "file_path")?;
            let len = str_field(input, "content").map_or(0, |c| c.len());
            (
                Kind::Change,
                file_stem(&file),
                format!("[Write] Wrote {file} ({len} bytes)"),
            )
        },
        "WebFetch" => {
            let url = str_field(input, "url")?;
            let prompt = str_field(input, "prompt").unwrap_or_default();
            let content = if prompt.is_empty() {
                format!("[WebFetch] Fetched {url}")
            } else {
                format!("[WebFetch] Fetched {url}: {}", clip_chars(&prompt, 200))
            };
            (Kind::Reference, host_of(&url), content)
        },
        "WebSearch" => {
            let query = str_field(input, "query")?;
            (
                Kind::Reference,
                Some(clip_chars(&query, 60)),
                format!("[WebSearch] Searched \"{query}\""),
            )
        },
        "Bash" => {
            let command = str_field(input, "command")?;
            let kind = if is_verification_command(&command) {
                Kind::Verification
            } else {
                Kind::Change
            };
            let mut content = format!("[Bash] $ {command}");
            if let Some(output) = response_excerpt(event.tool_response.as_ref()) {
                content.push('\n');
                content.push_str(&output);
            }
            (kind, Some(clip_chars(&command, 60)), content)
        },
        other => {
            let rendered = serde_json::to_string(input).unwrap_or_default();
            if rendered.is_empty() || rendered == "null" || rendered == "{}" {
                return None;
            }
            (
                Kind::Finding,
                None,
                format!("[{other}] {}", clip_chars(&rendered, 8_000)),
            )
        },
    };

    if content.is_empty() {
        return None;
    }
    Some(NewObservation {
        session_id: event.session_id.clone(),
        title,
        content,
        source: format!("hook:{}", event.tool_name),
        kind: Some(kind),
    })
}

/// Build/test commands count as verification evidence.
fn is_verification_command(command: &str) -> bool {
    ["cargo test", "cargo check", "cargo clippy", "npm test", "pytest", "go test", "make test"]
        .iter()
        .any(|p| command.starts_with(p))
}

fn research_query(event: &ToolEvent) -> String {
    let input = &event.tool_input;
    match event.tool_name.as_str() {
        "Read" => str_field(input, "file_path").unwrap_or_default(),
        "Glob" => str_field(input, "pattern").unwrap_or_default(),
        "Grep" => str_field(input, "pattern").unwrap_or_default(),
        _ => String::new(),
    }
}

fn matches_prefix(command: &str, prefixes: &[&str]) -> bool {
    let trimmed = command.trim_start();
    prefixes.iter().any(|p| {
        trimmed
            .strip_prefix(p)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(|c: char| c.is_whitespace()))
    })
}

fn str_field(value: &serde_json::Value, field: &str) -> Option<String> {
    value.get(field).and_then(|v| v.as_str()).map(ToString::to_string)
}

fn file_stem(path: &str) -> Option<String> {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
}

fn host_of(url: &str) -> Option<String> {
    url.split("//")
        .nth(1)
        .and_then(|rest| rest.split('/').next())
        .map(ToString::to_string)
}

fn response_excerpt(response: Option<&serde_json::Value>) -> Option<String> {
    let response = response?;
    let text = response
        .get("stdout")
        .or_else(|| response.get("output"))
        .and_then(|v| v.as_str())
        .or_else(|| response.as_str())?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(clip_chars(trimmed, BASH_OUTPUT_EXCERPT_CHARS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(tool: &str, input: serde_json::Value) -> ToolEvent {
        ToolEvent {
            tool_name: tool.to_string(),
            tool_input: input,
            tool_response: None,
            session_id: Some("s1".to_string()),
        }
    }

    #[test]
    fn edit_is_admitted_with_expected_content() {
        let admission = AdmissionFilter::evaluate(&event(
            "Edit",
            json!({"file_path": "src/a.ts", "old_string": "x", "new_string": "y"}),
        ));
        let Admission::Admit(input) = admission else {
            panic!("expected admit");
        };
        assert_eq!(input.kind, Some(Kind::Change));
        assert_eq!(input.source, "hook:Edit");
        assert!(input
            .content
            .starts_with("[Edit] Modified src/a.ts: replaced \"x\" with \"y\""));
    }

    #[test]
    fn read_routes_to_research_buffer() {
        let admission =
            AdmissionFilter::evaluate(&event("Read", json!({"file_path": "src/lib.rs"})));
        assert!(matches!(
            admission,
            Admission::Research { query } if query == "src/lib.rs"
        ));
    }

    #[test]
    fn navigation_bash_is_rejected() {
        for command in ["ls -la", "cd ..", "git status", "git log --oneline"] {
            let admission = AdmissionFilter::evaluate(&event("Bash", json!({"command": command})));
            assert!(matches!(admission, Admission::Reject(_)), "{command}");
        }
    }

    #[test]
    fn meaningful_bash_is_admitted_with_kind() {
        let admission =
            AdmissionFilter::evaluate(&event("Bash", json!({"command": "cargo test --lib"})));
        let Admission::Admit(input) = admission else {
            panic!("expected admit");
        };
        assert_eq!(input.kind, Some(Kind::Verification));

        let admission =
            AdmissionFilter::evaluate(&event("Bash", json!({"command": "git commit -m 'x'"})));
        let Admission::Admit(input) = admission else {
            panic!("expected admit");
        };
        assert_eq!(input.kind, Some(Kind::Change));
    }

    #[test]
    fn unlisted_bash_is_rejected() {
        let admission =
            AdmissionFilter::evaluate(&event("Bash", json!({"command": "sl --steam"})));
        assert!(matches!(admission, Admission::Reject(_)));
    }

    #[test]
    fn own_tools_are_rejected() {
        let admission = AdmissionFilter::evaluate(&event("recall", json!({"query": "x"})));
        assert!(matches!(admission, Admission::Reject(_)));
        assert!(AdmissionFilter::is_own_tool("mcp__laminark__save_memory"));
    }

    #[test]
    fn long_content_needs_indicator() {
        let long = "word ".repeat(1_500);
        let admission = AdmissionFilter::evaluate(&event("Task", json!({"notes": long})));
        assert!(matches!(admission, Admission::Reject(_)));

        let long_with_error = format!("{} error: broke", "word ".repeat(1_500));
        let admission =
            AdmissionFilter::evaluate(&event("Task", json!({"notes": long_with_error})));
        assert!(matches!(admission, Admission::Admit(_)));
    }

    #[test]
    fn high_signal_skips_length_gate() {
        let huge = "x".repeat(20_000);
        let admission = AdmissionFilter::evaluate(&event(
            "Write",
            json!({"file_path": "big.txt", "content": huge}),
        ));
        assert!(matches!(admission, Admission::Admit(_)));
    }

    #[test]
    fn bash_output_excerpt_is_appended() {
        let mut evt = event("Bash", json!({"command": "cargo test"}));
        evt.tool_response = Some(json!({"stdout": "test result: ok. 12 passed"}));
        let Admission::Admit(input) = AdmissionFilter::evaluate(&evt) else {
            panic!("expected admit");
        };
        assert!(input.content.contains("12 passed"));
    }
}
