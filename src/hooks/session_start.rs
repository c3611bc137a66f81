//! Session-start hook: the one hook whose stdout reaches the LLM context.

use super::HookEvent;
use crate::engine::Engine;
use crate::Result;

pub(super) fn handle(engine: &Engine, event: &HookEvent) -> Result<Option<String>> {
    let project = event.project();
    let session_id = event.session_id.as_deref().unwrap_or("unknown-session");
    let document = engine.session_started(&project, session_id)?;
    if document.is_empty() {
        return Ok(None);
    }
    Ok(Some(document))
}
