//! Stop / session-end hook: summary generation and state persistence.

use super::HookEvent;
use crate::engine::Engine;
use crate::Result;

pub(super) fn handle(engine: &Engine, event: &HookEvent) -> Result<Option<String>> {
    let Some(session_id) = event.session_id.as_deref() else {
        return Ok(None);
    };
    let project = event.project();
    engine.session_ended(&project.hash, session_id)?;
    Ok(None)
}
