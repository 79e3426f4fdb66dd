//! Builds actions from a policy spec.
//!
//! Exactly one operation field may be set per action; admission should have
//! rejected anything else already, but it is checked again here.

use super::{Action, DebugAction, DeleteAction, PatchAction, RestartAction};
use crate::crds::{ActionSpec, CounterMeasureSpec};
use crate::error::{Error, Result};

pub fn build(spec: &CounterMeasureSpec) -> Result<Vec<Action>> {
    spec.actions.iter().map(build_action).collect()
}

pub fn build_action(spec: &ActionSpec) -> Result<Action> {
    let mut set = Vec::new();
    if spec.delete.is_some() {
        set.push("delete");
    }
    if spec.patch.is_some() {
        set.push("patch");
    }
    if spec.restart.is_some() {
        set.push("restart");
    }
    if spec.debug.is_some() {
        set.push("debug");
    }

    let invalid = |reason: String| Error::InvalidAction {
        name: spec.name.clone(),
        reason,
    };

    match set.len() {
        0 => return Err(invalid("no operation set".to_string())),
        1 => {}
        _ => {
            return Err(invalid(format!(
                "exactly one operation allowed, found {}",
                set.join(", ")
            )))
        }
    }

    let name = spec.name.clone();
    let action = if let Some(delete) = &spec.delete {
        Action::Delete(DeleteAction {
            name,
            spec: delete.clone(),
        })
    } else if let Some(patch) = &spec.patch {
        let action = PatchAction {
            name,
            spec: patch.clone(),
        };
        action.template()?;
        Action::Patch(action)
    } else if let Some(restart) = &spec.restart {
        Action::Restart(RestartAction {
            name,
            spec: restart.clone(),
        })
    } else if let Some(debug) = &spec.debug {
        Action::Debug(DebugAction {
            name,
            spec: debug.clone(),
        })
    } else {
        return Err(invalid("no operation set".to_string()));
    };
    Ok(action)
}
