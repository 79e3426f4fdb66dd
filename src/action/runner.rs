//! Ordered execution of one policy's actions for one event.

use super::{registry, Action, ActionContext};
use crate::crds::CounterMeasureSpec;
use crate::error::Result;
use crate::event::Event;
use crate::recorder::{NoticeType, REASON_ACTION_FAILED, REASON_ACTION_TAKEN};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
pub struct ActionRunner {
    actions: Vec<Action>,
}

impl ActionRunner {
    pub fn new(actions: Vec<Action>) -> Self {
        Self { actions }
    }

    pub fn from_spec(spec: &CounterMeasureSpec) -> Result<Self> {
        Ok(Self::new(registry::build(spec)?))
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Runs the actions on their own task. The returned receiver resolves
    /// (with an error, as the sender is dropped) once the run is over,
    /// including when the task panicked.
    pub fn on_detection(self, context: ActionContext, event: Event) -> oneshot::Receiver<()> {
        let (done, finished) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _done = done;
            // Outcome is already recorded as notices and metrics.
            let _ = self.run(&context, &event).await;
        });
        finished
    }

    /// Executes actions in order and stops at the first failure.
    /// Returns how many actions changed something.
    pub async fn run(&self, context: &ActionContext, event: &Event) -> Result<usize> {
        let policy = context.policy_ref();
        let namespace = context.namespace();
        let mut taken = 0;

        for action in &self.actions {
            let kind = action.kind();
            match action.execute(context, event).await {
                Ok(Some(effect)) => {
                    taken += 1;
                    context.metrics.action_taken(&namespace, kind.as_str());
                    info!(
                        policy = ?policy.name,
                        action = %action.name(),
                        effect = %effect,
                        "Action taken"
                    );
                    context
                        .recorder
                        .notice(
                            &policy,
                            NoticeType::Normal,
                            REASON_ACTION_TAKEN,
                            format!("{}: {effect}", action.name()),
                        )
                        .await;
                }
                Ok(None) => {
                    debug!(policy = ?policy.name, action = %action.name(), "Action made no change");
                }
                Err(e) => {
                    context.metrics.action_error(&namespace, kind.as_str());
                    error!(
                        policy = ?policy.name,
                        action = %action.name(),
                        error = %e,
                        "Action failed, aborting remaining actions"
                    );
                    context
                        .recorder
                        .notice(
                            &policy,
                            NoticeType::Warning,
                            REASON_ACTION_FAILED,
                            format!("{}: {e}", action.name()),
                        )
                        .await;
                    return Err(e);
                }
            }
        }

        Ok(taken)
    }
}
