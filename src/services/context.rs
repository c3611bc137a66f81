//! Context injector: assembles bounded context for session start and
//! pre-tool steps.
//!
//! Session-start output is a markdown document with fixed sections under a
//! hard 6000-character ceiling; over budget, sections are dropped in
//! priority order (references, findings, tools, changes). Pre-tool output
//! is a terse lookup capped at ~500 characters.

use crate::models::{Kind, ToolType};
use crate::rendering::{clip_chars, first_line};
use crate::search::{SearchEngine, SearchOptions};
use crate::services::admission::AdmissionFilter;
use crate::storage::{
    Direction, GraphStore, ListOptions, ObservationStore, PathStore, SessionStore, Storage,
    ToolingStore, token_jaccard,
};
use crate::Result;
use chrono::{Duration, Utc};
use std::collections::HashSet;
use std::sync::Arc;

/// Hard ceiling for the session-start document.
pub const SESSION_CONTEXT_CEILING: usize = 6_000;

/// Cap for pre-tool context.
pub const PRE_TOOL_CAP: usize = 500;

/// Jaccard threshold for "similar past debug path" matches.
const SIMILAR_PATH_JACCARD: f32 = 0.25;

/// Window within which an active debug path survives a restart.
const DEBUG_PATH_RESUME_HOURS: i64 = 24;

/// Tools whose pre-tool step is skipped entirely.
const SKIPPED_PRE_TOOL: &[&str] = &["Glob", "TodoWrite", "TodoRead", "Task", "NotebookEdit"];

/// Assembles injected context from every subsystem.
pub struct ContextInjector {
    storage: Arc<Storage>,
    search: SearchEngine,
}

impl ContextInjector {
    /// Creates an injector.
    #[must_use]
    pub const fn new(storage: Arc<Storage>, search: SearchEngine) -> Self {
        Self { storage, search }
    }

    /// Builds the session-start document.
    ///
    /// # Errors
    ///
    /// Returns a storage error when reads fail.
    pub fn session_start(&self, project_hash: &str) -> Result<String> {
        let sessions = SessionStore::new(Arc::clone(&self.storage));
        let store = ObservationStore::new(Arc::clone(&self.storage), project_hash.to_string());
        let tooling = ToolingStore::new(Arc::clone(&self.storage));
        let paths = PathStore::new(Arc::clone(&self.storage));

        let summary_section = sessions
            .last_completed(project_hash)?
            .and_then(|s| s.summary)
            .map_or_else(
                || "(no previous session)".to_string(),
                |summary| summary,
            );

        let changes = Self::render_observations(&store, Kind::Change, 24, 10)?;
        let decisions = Self::render_observations(&store, Kind::Decision, 24 * 7, 5)?;
        let references = Self::render_observations(&store, Kind::Reference, 24 * 3, 3)?;
        let findings = Self::render_observations(&store, Kind::Finding, 24 * 7, 5)?;
        let tools = Self::render_tools(&tooling)?;

        let debug_banner = self.debug_banner(&paths, project_hash)?;

        // Priority-ordered assembly: each entry is (section, droppable-rank).
        // Rank 0 sections never drop; higher ranks drop first.
        let mut sections: Vec<(String, u8)> = vec![
            (format!("## Previous session\n{summary_section}"), 0),
            (format!("## Recent changes\n{changes}"), 1),
            (format!("## Active decisions\n{decisions}"), 0),
            (format!("## Reference docs\n{references}"), 4),
            (format!("## Recent findings\n{findings}"), 3),
            (format!("## Available tools\n{tools}"), 2),
        ];
        if let Some(banner) = debug_banner {
            sections.push((banner, 0));
        }

        let render = |sections: &[(String, u8)]| {
            sections
                .iter()
                .map(|(text, _)| text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n")
        };

        let mut document = render(&sections);
        for drop_rank in [4u8, 3, 2, 1] {
            if document.len() <= SESSION_CONTEXT_CEILING {
                break;
            }
            sections.retain(|(_, rank)| *rank != drop_rank);
            document = render(&sections);
        }
        if document.len() > SESSION_CONTEXT_CEILING {
            document = clip_chars(&document, SESSION_CONTEXT_CEILING);
        }
        Ok(document)
    }

    /// Builds the pre-tool context, or an empty string for skipped tools.
    ///
    /// # Errors
    ///
    /// Returns a storage error when reads fail.
    pub fn pre_tool(
        &self,
        project_hash: &str,
        tool_name: &str,
        tool_input: &serde_json::Value,
    ) -> Result<String> {
        if SKIPPED_PRE_TOOL.contains(&tool_name) || AdmissionFilter::is_own_tool(tool_name) {
            return Ok(String::new());
        }
        let Some(query) = extract_query(tool_name, tool_input) else {
            return Ok(String::new());
        };

        let mut lines: Vec<String> = Vec::new();

        let hits = self.search.search_keyword(
            project_hash,
            &query,
            &SearchOptions { limit: 3, ..Default::default() },
        )?;
        for hit in &hits {
            let label = hit
                .observation
                .title
                .clone()
                .unwrap_or_else(|| first_line(&hit.observation.content).to_string());
            lines.push(format!("• {}", clip_chars(&label, 90)));
        }

        // One-hop neighbourhood when the tool targets a known file.
        if let Some(path) = file_target(tool_name, tool_input) {
            let graph = GraphStore::new(Arc::clone(&self.storage));
            if let Some(node) =
                graph.get_node(project_hash, crate::models::NodeType::File, &path)?
            {
                let hops = graph.traverse_from(&node.id, 1, None, Direction::Both)?;
                if !hops.is_empty() {
                    let names: Vec<String> = hops
                        .iter()
                        .take(4)
                        .map(|h| format!("{} ({})", h.node.name, h.edge.edge_type))
                        .collect();
                    lines.push(format!("Related: {}", names.join(", ")));
                }
            }
        }

        // Similar resolved debug paths.
        let paths = PathStore::new(Arc::clone(&self.storage));
        for path in paths.resolved(project_hash, 20)? {
            let haystack = format!(
                "{} {}",
                path.trigger,
                path.resolution.as_deref().unwrap_or_default()
            );
            if token_jaccard(&query, &haystack) >= SIMILAR_PATH_JACCARD {
                lines.push(format!(
                    "Past debug: {} → {}",
                    clip_chars(&path.trigger, 60),
                    clip_chars(path.resolution.as_deref().unwrap_or("resolved"), 60),
                ));
                break;
            }
        }

        if lines.is_empty() {
            return Ok(String::new());
        }
        Ok(clip_chars(&lines.join("\n"), PRE_TOOL_CAP))
    }

    fn render_observations(
        store: &ObservationStore,
        kind: Kind,
        window_hours: i64,
        limit: usize,
    ) -> Result<String> {
        let rows = store.list(&ListOptions {
            kind: Some(kind),
            since: Some(Utc::now() - Duration::hours(window_hours)),
            limit,
            ..Default::default()
        })?;
        if rows.is_empty() {
            return Ok("(none)".to_string());
        }
        Ok(rows
            .iter()
            .map(|obs| {
                let label = obs
                    .title
                    .clone()
                    .unwrap_or_else(|| first_line(&obs.content).to_string());
                format!("- {}", clip_chars(&label, 100))
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Ranked, deduplicated tool list; servers shadow their individual
    /// MCP tools.
    fn render_tools(tooling: &ToolingStore) -> Result<String> {
        let tools = tooling.active_tools(30)?;
        let servers: HashSet<&str> = tools
            .iter()
            .filter(|t| t.tool_type == ToolType::McpServer)
            .map(|t| t.name.as_str())
            .collect();

        let visible: Vec<String> = tools
            .iter()
            .filter(|t| {
                t.tool_type != ToolType::McpTool
                    || t.server_name
                        .as_deref()
                        .is_none_or(|server| !servers.contains(server))
            })
            .take(10)
            .map(|t| {
                let description = t
                    .description
                    .as_deref()
                    .map_or_else(String::new, |d| format!(" — {}", clip_chars(d, 60)));
                format!("- {}{description}", t.name)
            })
            .collect();

        if visible.is_empty() {
            Ok("(none reported)".to_string())
        } else {
            Ok(visible.join("\n"))
        }
    }

    /// Active-debug-path banner; stale paths are auto-abandoned instead.
    fn debug_banner(&self, paths: &PathStore, project_hash: &str) -> Result<Option<String>> {
        let Some(path) = paths.active(project_hash)? else {
            return Ok(None);
        };
        let age = Utc::now() - path.started_at;
        if age > Duration::hours(DEBUG_PATH_RESUME_HOURS) {
            paths.abandon(&path.id)?;
            return Ok(None);
        }
        Ok(Some(format!(
            "## Active debug path\nStill debugging: {}",
            clip_chars(&path.trigger, 120)
        )))
    }
}

/// Extracts the search query from a tool's inputs.
fn extract_query(tool_name: &str, input: &serde_json::Value) -> Option<String> {
    let get = |field: &str| {
        input
            .get(field)
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
    };
    let query = match tool_name {
        "Read" | "Write" | "Edit" => {
            let path = get("file_path")?;
            std::path::Path::new(&path)
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())?
        },
        "Bash" => {
            let command = get("command")?;
            command
                .split_whitespace()
                .filter(|t| !t.starts_with('-'))
                .take(2)
                .collect::<Vec<_>>()
                .join(" ")
        },
        "Grep" => get("pattern")?,
        "WebFetch" => {
            let url = get("url")?;
            url.split("//").nth(1)?.split('/').next()?.to_string()
        },
        "WebSearch" => get("query")?,
        _ => return None,
    };
    if query.trim().is_empty() {
        None
    } else {
        Some(query)
    }
}

/// The file path a tool targets, when it targets one.
fn file_target(tool_name: &str, input: &serde_json::Value) -> Option<String> {
    if !matches!(tool_name, "Read" | "Write" | "Edit") {
        return None;
    }
    input
        .get("file_path")
        .and_then(|v| v.as_str())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingHandle;
    use crate::models::NewObservation;
    use crate::storage::EmbeddingStore;
    use serde_json::json;

    fn injector() -> (ContextInjector, Arc<Storage>) {
        let storage = Storage::in_memory().unwrap();
        let search = SearchEngine::new(
            Arc::clone(&storage),
            EmbeddingStore::new(Arc::clone(&storage)),
            Arc::new(EmbeddingHandle::disabled()),
        );
        (ContextInjector::new(Arc::clone(&storage), search), storage)
    }

    fn seed(storage: &Arc<Storage>, kind: Kind, title: &str, content: &str) {
        ObservationStore::new(Arc::clone(storage), "p")
            .create(NewObservation {
                title: Some(title.to_string()),
                content: content.to_string(),
                source: "hook:Edit".to_string(),
                kind: Some(kind),
                ..Default::default()
            })
            .unwrap();
    }

    #[test]
    fn session_start_has_sections_in_order() {
        let (injector, storage) = injector();
        seed(&storage, Kind::Change, "edited auth", "[Edit] Modified auth.rs");
        seed(&storage, Kind::Decision, "use sqlite", "decided on sqlite");
        seed(&storage, Kind::Finding, "cache bug", "found stale cache reads");

        let document = injector.session_start("p").unwrap();
        let order: Vec<usize> = [
            "## Previous session",
            "## Recent changes",
            "## Active decisions",
            "## Reference docs",
            "## Recent findings",
            "## Available tools",
        ]
        .iter()
        .map(|header| document.find(header).unwrap())
        .collect();
        let mut sorted = order.clone();
        sorted.sort_unstable();
        assert_eq!(order, sorted, "sections out of order");
        assert!(document.contains("edited auth"));
        assert!(document.len() <= SESSION_CONTEXT_CEILING);
    }

    #[test]
    fn ceiling_drops_sections_in_priority_order() {
        let (injector, storage) = injector();
        // A huge previous-session summary plus full sections forces the
        // ceiling; the summary and decisions never drop.
        let sessions = SessionStore::new(Arc::clone(&storage));
        sessions.start_session("prev", "p").unwrap();
        sessions
            .end_session("prev", Some(&"s".repeat(4_600)))
            .unwrap();

        for i in 0..10 {
            let filler = format!("{i} {}", "needle ".repeat(24));
            seed(&storage, Kind::Change, &format!("change {filler}"), &filler);
            seed(&storage, Kind::Finding, &format!("finding {filler}"), &filler);
            seed(&storage, Kind::Reference, &format!("reference {filler}"), &filler);
            seed(&storage, Kind::Decision, &format!("decision {filler}"), &filler);
        }

        let document = injector.session_start("p").unwrap();
        assert!(document.len() <= SESSION_CONTEXT_CEILING);
        assert!(document.contains("## Previous session"));
        assert!(document.contains("## Active decisions"));
        // Trim order: references, findings, tools, then changes.
        assert!(!document.contains("## Reference docs"));
        assert!(!document.contains("## Recent findings"));
        assert!(!document.contains("## Recent changes"));
    }

    #[test]
    fn pre_tool_skips_noise_and_own_tools() {
        let (injector, _storage) = injector();
        assert!(injector
            .pre_tool("p", "Glob", &json!({"pattern": "*.rs"}))
            .unwrap()
            .is_empty());
        assert!(injector
            .pre_tool("p", "recall", &json!({"query": "x"}))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn pre_tool_surfaces_keyword_hits_within_cap() {
        let (injector, storage) = injector();
        seed(
            &storage,
            Kind::Finding,
            "auth token refresh",
            "the auth token refresh loop stalls",
        );

        let context = injector
            .pre_tool("p", "Edit", &json!({"file_path": "src/auth.rs"}))
            .unwrap();
        assert!(context.contains("auth"));
        assert!(context.chars().count() <= PRE_TOOL_CAP);
    }

    #[test]
    fn query_extraction_variants() {
        assert_eq!(
            extract_query("Read", &json!({"file_path": "src/worker/pool.rs"})),
            Some("pool".to_string())
        );
        assert_eq!(
            extract_query("Bash", &json!({"command": "cargo test --workspace"})),
            Some("cargo test".to_string())
        );
        assert_eq!(
            extract_query("WebFetch", &json!({"url": "https://docs.rs/rusqlite/latest"})),
            Some("docs.rs".to_string())
        );
        assert_eq!(extract_query("Mystery", &json!({})), None);
    }
}
