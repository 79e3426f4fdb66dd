//! Remediation actions.
//!
//! [`Action`] is a closed set of four operations. Each one resolves its target
//! from templates at execution time and honors the policy's dry-run flag.
//! `execute` returns a short description of the change it made, or `None`
//! when the cluster was already in the desired state.

pub mod debug;
pub mod delete;
pub mod patch;
pub mod registry;
pub mod restart;
pub mod runner;
pub mod template;

pub use debug::DebugAction;
pub use delete::DeleteAction;
pub use patch::PatchAction;
pub use restart::RestartAction;
pub use runner::ActionRunner;

use crate::cluster::ClusterClient;
use crate::crds::CounterMeasure;
use crate::error::Result;
use crate::event::Event;
use crate::metrics::ActionMetrics;
use crate::recorder::NoticeRecorder;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{Resource, ResourceExt};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Delete,
    Patch,
    Restart,
    Debug,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Delete => "delete",
            ActionKind::Patch => "patch",
            ActionKind::Restart => "restart",
            ActionKind::Debug => "debug",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Delete(DeleteAction),
    Patch(PatchAction),
    Restart(RestartAction),
    Debug(DebugAction),
}

impl Action {
    pub fn name(&self) -> &str {
        match self {
            Action::Delete(a) => &a.name,
            Action::Patch(a) => &a.name,
            Action::Restart(a) => &a.name,
            Action::Debug(a) => &a.name,
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Delete(_) => ActionKind::Delete,
            Action::Patch(_) => ActionKind::Patch,
            Action::Restart(_) => ActionKind::Restart,
            Action::Debug(_) => ActionKind::Debug,
        }
    }

    pub async fn execute(&self, context: &ActionContext, event: &Event) -> Result<Option<String>> {
        match self {
            Action::Delete(a) => a.execute(context, event).await,
            Action::Patch(a) => a.execute(context, event).await,
            Action::Restart(a) => a.execute(context, event).await,
            Action::Debug(a) => a.execute(context, event).await,
        }
    }
}

/// Everything an action needs for one triggering event.
#[derive(Clone)]
pub struct ActionContext {
    pub cluster: Arc<dyn ClusterClient>,
    pub recorder: Arc<dyn NoticeRecorder>,
    pub metrics: ActionMetrics,
    pub policy: Arc<CounterMeasure>,
}

impl ActionContext {
    pub fn dry_run(&self) -> bool {
        self.policy.spec.dry_run
    }

    pub fn namespace(&self) -> String {
        self.policy.namespace().unwrap_or_default()
    }

    /// Reference notices are recorded against.
    pub fn policy_ref(&self) -> ObjectReference {
        self.policy.object_ref(&())
    }

    fn describe(&self, effect: String) -> String {
        if self.dry_run() {
            format!("{effect} (dry run)")
        } else {
            effect
        }
    }
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("policy", &self.policy.name_any())
            .field("dry_run", &self.dry_run())
            .finish_non_exhaustive()
    }
}
