//! Knowledge graph tools.

use super::{ToolContext, ToolOutput, require_str, str_arg, usize_arg};
use crate::models::{EdgeType, NodeType};
use crate::rendering::{LIST_VIEW_TOKENS, clip_chars, enforce_token_budget, first_line};
use crate::storage::Direction;
use crate::Result;
use serde_json::Value;

pub(super) fn query_graph(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let query = require_str(args, "query")?.to_lowercase();
    let entity_type = str_arg(args, "entity_type").and_then(|t| NodeType::parse(&t));
    let depth = usize_arg(args, "depth", 2) as u32;
    let limit = usize_arg(args, "limit", 20);
    let edge_filter: Option<Vec<EdgeType>> = args
        .get("relationship_types")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(Value::as_str)
                .filter_map(EdgeType::parse)
                .collect()
        });

    let graph = ctx.engine.graph();
    let matches: Vec<_> = graph
        .list_nodes(&ctx.project.hash, entity_type, 10_000)?
        .into_iter()
        .filter(|node| node.name.contains(&query))
        .take(limit)
        .collect();

    if matches.is_empty() {
        return Ok(ToolOutput::ok("No matching entities."));
    }

    let store = ctx.engine.observations(&ctx.project.hash);
    let mut lines = Vec::new();
    for node in &matches {
        lines.push(format!(
            "{} [{}] ({} observations)",
            node.name,
            node.node_type,
            node.observation_ids.len()
        ));

        let hops = graph.traverse_from(&node.id, depth, edge_filter.as_deref(), Direction::Both)?;
        for hop in hops.iter().take(8) {
            lines.push(format!(
                "  {} {} [{}] (w={:.2})",
                "→".repeat(hop.depth as usize),
                hop.node.name,
                hop.edge.edge_type,
                hop.edge.weight
            ));
        }

        for id in node.observation_ids.iter().take(3) {
            if let Some(observation) = store.get(id)? {
                lines.push(format!(
                    "  · {}",
                    clip_chars(first_line(&observation.content), 80)
                ));
            }
        }
    }

    Ok(ToolOutput::ok(enforce_token_budget(
        &lines.join("\n"),
        LIST_VIEW_TOKENS * 4,
    )))
}

pub(super) fn graph_stats(ctx: &ToolContext<'_>) -> Result<ToolOutput> {
    let stats = ctx.engine.graph().stats(&ctx.project.hash)?;

    let mut lines = vec![format!(
        "{} nodes, {} edges",
        stats.nodes, stats.edges
    )];
    let mut by_type: Vec<(&String, &u64)> = stats.nodes_by_type.iter().collect();
    by_type.sort_by(|a, b| b.1.cmp(a.1));
    for (node_type, count) in by_type {
        lines.push(format!("  {node_type}: {count}"));
    }
    if !stats.hotspots.is_empty() {
        let names: Vec<String> = stats
            .hotspots
            .iter()
            .map(|(name, degree)| format!("{name} ({degree})"))
            .collect();
        lines.push(format!("Hotspots near degree cap: {}", names.join(", ")));
    }
    lines.push(format!(
        "Duplicate candidate groups: {} · staleness flags: {}",
        stats.duplicate_groups, stats.staleness_flags
    ));
    Ok(ToolOutput::ok(lines.join("\n")))
}
