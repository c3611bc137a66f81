//! Post-tool hook: feeds the admission funnel. Never writes to stdout.

use super::HookEvent;
use crate::engine::Engine;
use crate::models::ToolEvent;
use crate::Result;

pub(super) fn handle(engine: &Engine, event: &HookEvent) -> Result<Option<String>> {
    let Some(tool_name) = event.tool_name.clone() else {
        return Ok(None);
    };
    let project = event.project();
    let tool_event = ToolEvent {
        tool_name,
        tool_input: event.tool_input.clone(),
        tool_response: event.tool_response.clone(),
        session_id: event.session_id.clone(),
    };
    engine.capture_event(&project, &tool_event)?;
    Ok(None)
}
