//! Core memory operations: save, recall, ingest, stashes, status, hygiene,
//! and the tool registry surface.

use super::{ToolContext, ToolOutput, bool_arg, require_str, str_arg, usize_arg};
use crate::config::{CrossAccessConfig, cross_access_file, load_project_config};
use crate::models::{
    Classification, Kind, NewObservation, Observation, ObservationId, RegisteredTool, ToolScope,
    ToolStatus, ToolType,
};
use crate::rendering::{
    DETAIL_VIEW_TOKENS, LIST_VIEW_TOKENS, LeveledResponse, clip_chars, enforce_token_budget,
    first_line,
};
use crate::search::SearchOptions;
use crate::storage::ListOptions;
use crate::Result;
use chrono::{Duration, Utc};
use serde_json::Value;

pub(super) fn save_memory(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let text = require_str(args, "text")?;
    let kind = str_arg(args, "kind").and_then(|k| Kind::parse(&k));
    let observation = ctx.engine.save_observation(
        &ctx.project.hash,
        NewObservation {
            session_id: None,
            title: str_arg(args, "title"),
            content: text,
            source: str_arg(args, "source").unwrap_or_else(|| "manual".to_string()),
            kind: Some(kind.unwrap_or(Kind::Finding)),
        },
    )?;

    let response = LeveledResponse {
        minimal: format!("Saved {}", observation.id),
        standard: format!(
            "Memory saved as {} ({}).",
            observation.id,
            observation.kind
        ),
        verbose: format!(
            "Memory saved as {} ({}, source {}, {} chars).",
            observation.id,
            observation.kind,
            observation.source,
            observation.content.len()
        ),
    };
    Ok(ToolOutput::ok(response.select(ctx.verbosity)))
}

pub(super) fn recall(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let action = str_arg(args, "action").unwrap_or_else(|| "view".to_string());
    let store = ctx.engine.observations(&ctx.project.hash);

    let explicit_ids: Vec<ObservationId> = collect_ids(args);
    match action.as_str() {
        "purge" => {
            let mut purged = 0;
            for id in &explicit_ids {
                if store.soft_delete(id)? {
                    purged += 1;
                }
            }
            return Ok(ToolOutput::ok(format!("Purged {purged} memories.")));
        },
        "restore" => {
            let mut restored = 0;
            for id in &explicit_ids {
                if store.restore(id)? {
                    restored += 1;
                }
            }
            return Ok(ToolOutput::ok(format!("Restored {restored} memories.")));
        },
        _ => {},
    }

    let detail = str_arg(args, "detail").unwrap_or_else(|| "compact".to_string());
    let limit = usize_arg(args, "limit", 10);
    let include_purged = bool_arg(args, "include_purged");
    let kind = str_arg(args, "kind").and_then(|k| Kind::parse(&k));

    // Single-id lookups get the detail budget.
    if !explicit_ids.is_empty() {
        let mut sections = Vec::new();
        for id in &explicit_ids {
            let observation = if include_purged {
                store.get_any(id)?
            } else {
                store.get(id)?
            };
            match observation {
                Some(observation) => sections.push(render_full(&observation)),
                None => sections.push(format!("{id}: not found")),
            }
        }
        let text = enforce_token_budget(&sections.join("\n\n"), DETAIL_VIEW_TOKENS);
        return Ok(ToolOutput::ok(text));
    }

    let rows = if let Some(query) = str_arg(args, "query").or_else(|| str_arg(args, "title")) {
        let options = SearchOptions {
            limit,
            kind,
            include_purged,
        };
        let mut lines: Vec<String> = ctx
            .engine
            .search()
            .search_hybrid(&ctx.project.hash, &query, &options)?
            .iter()
            .map(|hit| render_hit(&hit.observation, hit.snippet.as_deref(), &detail))
            .collect();

        // Cross-project reads are opt-in via the allow-list; results carry
        // the readable project name.
        let access: CrossAccessConfig = load_project_config(
            &ctx.engine.config().data_dir,
            &cross_access_file(&ctx.project.hash),
        );
        for other in &access.allow {
            let name = ctx
                .engine
                .sessions()
                .project_name(other)?
                .unwrap_or_else(|| other.clone());
            for hit in ctx.engine.search().search_keyword(other, &query, &options)? {
                lines.push(format!(
                    "[{name}] {}",
                    render_hit(&hit.observation, hit.snippet.as_deref(), &detail)
                ));
            }
        }
        lines
    } else {
        store
            .list(&ListOptions {
                kind,
                limit,
                include_purged,
                ..Default::default()
            })?
            .iter()
            .map(|observation| render_hit(observation, None, &detail))
            .collect()
    };

    if rows.is_empty() {
        return Ok(ToolOutput::ok("No matching memories."));
    }
    let body = rows.join("\n");
    let response = LeveledResponse {
        minimal: body.clone(),
        standard: format!("{} memories:\n{body}", rows.len()),
        verbose: format!(
            "{} memories (project {}):\n{body}",
            rows.len(),
            ctx.project.name
        ),
    };
    let text = enforce_token_budget(response.select(ctx.verbosity), LIST_VIEW_TOKENS * limit);
    Ok(ToolOutput::ok(text))
}

pub(super) fn ingest_knowledge(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let directory = str_arg(args, "directory")
        .map_or_else(|| ctx.project.root.clone(), std::path::PathBuf::from);
    let store = ctx.engine.observations(&ctx.project.hash);
    let report = crate::services::ingest_directory(&store, &directory)?;
    Ok(ToolOutput::ok(format!(
        "Ingested {} files: {} sections created, {} removed.",
        report.files_processed, report.sections_created, report.sections_removed
    )))
}

pub(super) fn topic_context(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let limit = usize_arg(args, "limit", 5);
    let query = str_arg(args, "query").map(|q| q.to_lowercase());
    let stashes = ctx.engine.sessions().recent_stashes(&ctx.project.hash, 50)?;

    let mut lines = Vec::new();
    for stash in stashes
        .iter()
        .filter(|stash| {
            query
                .as_ref()
                .is_none_or(|q| stash.topic.to_lowercase().contains(q))
        })
        .take(limit)
    {
        // Progressive disclosure: topic line first, summary indented under it.
        lines.push(format!(
            "{} [{}] {} ({} observations)",
            stash.created_at.format("%Y-%m-%d %H:%M"),
            stash.status.as_str(),
            stash.topic,
            stash.snapshots.len()
        ));
        if ctx.verbosity >= crate::models::Verbosity::Standard {
            lines.push(format!("  {}", clip_chars(&stash.summary, 160)));
        }
    }

    if lines.is_empty() {
        return Ok(ToolOutput::ok("No topic stashes yet."));
    }
    Ok(ToolOutput::ok(enforce_token_budget(
        &lines.join("\n"),
        LIST_VIEW_TOKENS * limit.max(1),
    )))
}

pub(super) fn status(ctx: &ToolContext<'_>) -> Result<ToolOutput> {
    let snapshot = ctx.engine.status().snapshot();
    let response = LeveledResponse {
        minimal: format!(
            "{} observations, embedding {}",
            snapshot.observations, snapshot.embedding
        ),
        standard: format!(
            "Uptime {}s · {} observations · backlog: {} unclassified, {} unembedded · graph {} nodes / {} edges · embedding {}",
            snapshot.uptime_secs,
            snapshot.observations,
            snapshot.unclassified_backlog,
            snapshot.unembedded_backlog,
            snapshot.graph_nodes,
            snapshot.graph_edges,
            snapshot.embedding
        ),
        verbose: serde_json::to_string_pretty(&snapshot)
            .unwrap_or_else(|_| "status unavailable".to_string()),
    };
    Ok(ToolOutput::ok(response.select(ctx.verbosity)))
}

pub(super) fn hygiene(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let mode = str_arg(args, "mode").unwrap_or_else(|| "simulate".to_string());
    let tier = str_arg(args, "tier").unwrap_or_else(|| "high".to_string());
    let limit = usize_arg(args, "limit", 50);
    let session_id = str_arg(args, "session_id");
    let store = ctx.engine.observations(&ctx.project.hash);

    // Tiered candidates: high = noise past grace, medium = short stale
    // hook trivia, all = both plus staleness-flagged rows.
    let mut candidates: Vec<(Observation, &'static str)> = Vec::new();

    if matches!(tier.as_str(), "high" | "all") {
        for observation in store.list(&ListOptions {
            classification: Some(Classification::Noise),
            limit,
            include_purged: true,
            ..Default::default()
        })? {
            candidates.push((observation, "noise"));
        }
    }
    if matches!(tier.as_str(), "medium" | "all") {
        let cutoff = Utc::now() - Duration::days(30);
        for observation in store.list(&ListOptions {
            source_prefix: Some("hook:".to_string()),
            limit: limit * 4,
            ..Default::default()
        })? {
            if observation.content.chars().count() < 40 && observation.created_at < cutoff {
                candidates.push((observation, "short stale capture"));
            }
        }
    }
    if tier == "all" {
        for observation in store.list(&ListOptions { limit: limit * 4, ..Default::default() })? {
            if ctx.engine.graph().is_stale(&observation.id)? {
                candidates.push((observation, "superseded"));
            }
        }
    }

    if let Some(session) = &session_id {
        candidates.retain(|(observation, _)| observation.session_id.as_deref() == Some(session));
    }
    candidates.truncate(limit);

    if candidates.is_empty() {
        return Ok(ToolOutput::ok("No hygiene candidates."));
    }

    if mode == "purge" {
        let mut purged = 0;
        for (observation, _) in &candidates {
            if store.soft_delete(&observation.id)? {
                purged += 1;
            }
        }
        return Ok(ToolOutput::ok(format!("Purged {purged} memories.")));
    }

    let lines: Vec<String> = candidates
        .iter()
        .map(|(observation, reason)| {
            format!(
                "- {} [{reason}] {}",
                observation.id,
                clip_chars(first_line(&observation.content), 80)
            )
        })
        .collect();
    Ok(ToolOutput::ok(enforce_token_budget(
        &format!("{} candidates (simulate):\n{}", lines.len(), lines.join("\n")),
        LIST_VIEW_TOKENS * 4,
    )))
}

pub(super) fn discover_tools(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let query = require_str(args, "query")?.to_lowercase();
    let scope = str_arg(args, "scope").and_then(|s| ToolScope::parse(&s));
    let limit = usize_arg(args, "limit", 20);

    let tokens: Vec<&str> = query.split_whitespace().collect();
    let mut scored: Vec<(usize, RegisteredTool)> = ctx
        .engine
        .tooling()
        .active_tools(200)?
        .into_iter()
        .filter(|tool| scope.is_none_or(|s| tool.scope == s))
        .filter_map(|tool| {
            let haystack = format!(
                "{} {} {}",
                tool.name.to_lowercase(),
                tool.description.as_deref().unwrap_or_default().to_lowercase(),
                tool.trigger_hints.join(" ").to_lowercase()
            );
            let score = tokens.iter().filter(|t| haystack.contains(**t)).count();
            (score > 0).then_some((score, tool))
        })
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(limit);

    if scored.is_empty() {
        return Ok(ToolOutput::ok("No matching tools."));
    }
    let lines: Vec<String> = scored
        .iter()
        .map(|(_, tool)| {
            format!(
                "- {} ({}){}",
                tool.name,
                tool.tool_type.as_str(),
                tool.description
                    .as_deref()
                    .map_or_else(String::new, |d| format!(": {}", clip_chars(d, 70)))
            )
        })
        .collect();
    Ok(ToolOutput::ok(lines.join("\n")))
}

pub(super) fn report_available_tools(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let Some(tools) = args.get("tools").and_then(Value::as_array) else {
        return Err(crate::Error::ValidationRejected("'tools' is required".to_string()));
    };

    let mut upserted = 0;
    for entry in tools {
        let Some(name) = entry.get("name").and_then(Value::as_str) else {
            continue;
        };
        let description = entry
            .get("description")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let (tool_type, server_name) = classify_tool_name(name);
        ctx.engine.tooling().upsert_tool(&RegisteredTool {
            name: name.to_string(),
            tool_type,
            scope: ToolScope::Global,
            status: ToolStatus::Active,
            usage_count: 0,
            last_used_at: None,
            description,
            server_name,
            trigger_hints: Vec::new(),
            embedding: None,
        })?;
        upserted += 1;
    }
    Ok(ToolOutput::ok(format!("Registered {upserted} tools.")))
}

/// Infers the registry type from the tool's fully-qualified name.
fn classify_tool_name(name: &str) -> (ToolType, Option<String>) {
    if let Some(rest) = name.strip_prefix("mcp__") {
        let mut parts = rest.splitn(2, "__");
        let server = parts.next().unwrap_or_default().to_string();
        return if parts.next().is_some() {
            (ToolType::McpTool, Some(server))
        } else {
            (ToolType::McpServer, None)
        };
    }
    if name.starts_with('/') {
        return (ToolType::SlashCommand, None);
    }
    (ToolType::Builtin, None)
}

fn collect_ids(args: &Value) -> Vec<ObservationId> {
    let mut ids = Vec::new();
    if let Some(id) = str_arg(args, "id") {
        ids.push(ObservationId::from(id.as_str()));
    }
    if let Some(list) = args.get("ids").and_then(Value::as_array) {
        for value in list {
            if let Some(id) = value.as_str() {
                ids.push(ObservationId::from(id));
            }
        }
    }
    ids
}

fn render_hit(observation: &Observation, snippet: Option<&str>, detail: &str) -> String {
    let label = observation
        .title
        .clone()
        .unwrap_or_else(|| first_line(&observation.content).to_string());
    match detail {
        "timeline" => format!(
            "{} [{}] {}",
            observation.created_at.format("%Y-%m-%d %H:%M"),
            observation.kind,
            clip_chars(&label, 80)
        ),
        "full" => render_full(observation),
        _ => {
            let snippet = snippet
                .map_or_else(String::new, |s| format!(" — {}", clip_chars(s, 80)));
            format!("{} [{}] {}{}", observation.id, observation.kind, clip_chars(&label, 80), snippet)
        },
    }
}

fn render_full(observation: &Observation) -> String {
    format!(
        "{} [{} / {}] {}\n{}",
        observation.id,
        observation.kind,
        observation.classification,
        observation.created_at.format("%Y-%m-%d %H:%M"),
        observation.content
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_name_classification() {
        assert_eq!(
            classify_tool_name("mcp__laminark__save_memory"),
            (ToolType::McpTool, Some("laminark".to_string()))
        );
        assert_eq!(classify_tool_name("mcp__laminark"), (ToolType::McpServer, None));
        assert_eq!(classify_tool_name("/review"), (ToolType::SlashCommand, None));
        assert_eq!(classify_tool_name("Edit"), (ToolType::Builtin, None));
    }
}
