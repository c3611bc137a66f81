//! Pre-tool hook: synchronous context lookup before a tool runs.

use super::HookEvent;
use crate::engine::Engine;
use crate::Result;

pub(super) fn handle(engine: &Engine, event: &HookEvent) -> Result<Option<String>> {
    let Some(tool_name) = event.tool_name.as_deref() else {
        return Ok(None);
    };
    let project = event.project();
    let context = engine.pre_tool_context(&project.hash, tool_name, &event.tool_input)?;
    if context.is_empty() {
        return Ok(None);
    }
    Ok(Some(context))
}
