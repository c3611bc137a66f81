//! Debug path and thought branch tools.

use super::{ToolContext, ToolOutput, require_str, str_arg, usize_arg};
use crate::models::BranchState;
use crate::rendering::{LIST_VIEW_TOKENS, clip_chars, enforce_token_budget};
use crate::Result;
use serde_json::Value;

pub(super) fn path_start(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let trigger = require_str(args, "trigger")?;
    let path = match ctx.engine.debug_tracker().lock() {
        Ok(mut tracker) => tracker.start_manual(&ctx.project.hash, None, &trigger)?,
        Err(_) => return Ok(ToolOutput::error("debug tracker unavailable")),
    };
    Ok(ToolOutput::ok(format!("Debug path {} started.", path.id)))
}

pub(super) fn path_resolve(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let resolution = require_str(args, "resolution")?;
    let resolved = match ctx.engine.debug_tracker().lock() {
        Ok(mut tracker) => tracker.resolve_manual(&resolution)?,
        Err(_) => return Ok(ToolOutput::error("debug tracker unavailable")),
    };
    match resolved {
        Some(path) => Ok(ToolOutput::ok(format!("Debug path {} resolved.", path.id))),
        None => Ok(ToolOutput::error("No active debug path to resolve.")),
    }
}

pub(super) fn path_show(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let paths = ctx.engine.paths();
    let path = match str_arg(args, "id") {
        Some(id) => paths.get(&id)?,
        None => paths.active(&ctx.project.hash)?,
    };
    let Some(path) = path else {
        return Ok(ToolOutput::ok("No debug path found."));
    };

    let mut lines = vec![format!(
        "{} [{}] trigger: {}",
        path.id,
        path.state.as_str(),
        clip_chars(&path.trigger, 100)
    )];
    for waypoint in paths.waypoints(&path.id)? {
        lines.push(format!(
            "  {:>2}. {} — {}",
            waypoint.position + 1,
            waypoint.kind,
            clip_chars(&waypoint.summary, 80)
        ));
    }
    if let Some(resolution) = &path.resolution {
        lines.push(format!("Resolution: {}", clip_chars(resolution, 120)));
    }
    if let Some(kiss) = &path.kiss_summary {
        lines.push(format!("Summary: {}", clip_chars(&kiss.kiss_summary, 120)));
        lines.push(format!("Root cause: {}", clip_chars(&kiss.root_cause, 120)));
        lines.push(format!("Fix: {}", clip_chars(&kiss.what_fixed_it, 120)));
    }
    Ok(ToolOutput::ok(enforce_token_budget(
        &lines.join("\n"),
        LIST_VIEW_TOKENS * 2,
    )))
}

pub(super) fn path_list(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let limit = usize_arg(args, "limit", 10);
    let paths = ctx.engine.paths().list(&ctx.project.hash, limit)?;
    if paths.is_empty() {
        return Ok(ToolOutput::ok("No debug paths yet."));
    }
    let lines: Vec<String> = paths
        .iter()
        .map(|path| {
            format!(
                "{} [{}] {} ({})",
                path.id,
                path.state.as_str(),
                clip_chars(&path.trigger, 70),
                path.started_at.format("%Y-%m-%d %H:%M")
            )
        })
        .collect();
    Ok(ToolOutput::ok(lines.join("\n")))
}

pub(super) fn query_branches(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let state = str_arg(args, "state").and_then(|s| BranchState::parse(&s));
    let limit = usize_arg(args, "limit", 10);
    let branches = ctx.engine.branches().list(&ctx.project.hash, state, limit)?;
    if branches.is_empty() {
        return Ok(ToolOutput::ok("No thought branches yet."));
    }
    let lines: Vec<String> = branches
        .iter()
        .map(|branch| {
            format!(
                "{} [{} / {}] {} (stage {})",
                branch.id,
                branch.state.as_str(),
                branch.branch_type.as_str(),
                branch.title.as_deref().unwrap_or("(untitled)"),
                branch.arc_stage.as_str()
            )
        })
        .collect();
    Ok(ToolOutput::ok(lines.join("\n")))
}

pub(super) fn show_branch(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let id = require_str(args, "id")?;
    let Some(branch) = ctx.engine.branches().get(&id)? else {
        return Err(crate::Error::NotFound(format!("branch {id}")));
    };

    let mut lines = vec![format!(
        "{} [{} / {}] {} — stage {}",
        branch.id,
        branch.state.as_str(),
        branch.branch_type.as_str(),
        branch.title.as_deref().unwrap_or("(untitled)"),
        branch.arc_stage.as_str()
    )];

    let mut histogram: Vec<(&String, &u32)> = branch.tool_histogram.iter().collect();
    histogram.sort_by(|a, b| b.1.cmp(a.1));
    if !histogram.is_empty() {
        let tools: Vec<String> = histogram
            .iter()
            .map(|(tool, count)| format!("{tool}×{count}"))
            .collect();
        lines.push(format!("Tools: {}", tools.join(", ")));
    }

    for member in ctx.engine.branches().observations(&id)? {
        lines.push(format!(
            "  {:>2}. [{}] {}",
            member.position + 1,
            member.arc_stage.as_str(),
            member.tool_name.as_deref().unwrap_or("-")
        ));
    }
    Ok(ToolOutput::ok(enforce_token_budget(
        &lines.join("\n"),
        LIST_VIEW_TOKENS * 2,
    )))
}

pub(super) fn branch_summary(ctx: &ToolContext<'_>, args: &Value) -> Result<ToolOutput> {
    let id = require_str(args, "id")?;
    let Some(branch) = ctx.engine.branches().get(&id)? else {
        return Err(crate::Error::NotFound(format!("branch {id}")));
    };
    match branch.summary {
        Some(summary) => Ok(ToolOutput::ok(summary)),
        None => Ok(ToolOutput::ok("No summary generated yet.")),
    }
}
