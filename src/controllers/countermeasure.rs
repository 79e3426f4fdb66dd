use super::{map_finalizer_error, Context, FINALIZER_NAME};
use crate::crds::{CounterMeasure, CounterMeasureStatus, ResourceCondition};
use crate::error::Result;
use crate::event::ObjectKey;
use crate::manager::ActionManager;
use crate::recorder::{NoticeType, REASON_INVALID};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[instrument(skip(ctx, policy), fields(policy = %policy.name_any(), namespace = ?policy.namespace()))]
pub async fn reconcile(policy: Arc<CounterMeasure>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = policy.namespace().unwrap_or_default();
    let policies: Api<CounterMeasure> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&policies, FINALIZER_NAME, policy, |event| async {
        match event {
            FinalizerEvent::Apply(policy) => apply(policy, &policies, &ctx).await,
            FinalizerEvent::Cleanup(policy) => cleanup(&policy, &ctx),
        }
    })
    .await
    .map_err(map_finalizer_error)
}

async fn apply(
    policy: Arc<CounterMeasure>,
    policies: &Api<CounterMeasure>,
    ctx: &Context,
) -> Result<Action> {
    if ctx.actions.exists(&policy.metadata) {
        return Ok(Action::await_change());
    }

    match deploy(&ctx.actions, &policy) {
        Ok(()) => {
            update_status(&policy, policies, true, "Deployed", "policy is active").await?;
            Ok(Action::await_change())
        }
        Err(e) if e.is_config_error() => {
            warn!(error = %e, "Rejected invalid policy");
            if status_changed(&policy, false) {
                ctx.recorder
                    .notice(
                        &policy.object_ref(&()),
                        NoticeType::Warning,
                        REASON_INVALID,
                        e.to_string(),
                    )
                    .await;
                update_status(&policy, policies, false, REASON_INVALID, &e.to_string()).await?;
            }
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

/// Deploys `policy`. An invalid generation also withdraws the one deployed
/// before it, so a policy never keeps acting on a spec its owner replaced.
pub(crate) fn deploy(actions: &ActionManager, policy: &CounterMeasure) -> Result<()> {
    match actions.add(policy) {
        Err(e) if e.is_config_error() => {
            let key = ObjectKey::from_meta(&policy.metadata)?;
            if actions.remove(&key) {
                warn!(policy = %key, "Withdrew previous generation of invalid policy");
            }
            Err(e)
        }
        deployed => deployed,
    }
}

fn cleanup(policy: &CounterMeasure, ctx: &Context) -> Result<Action> {
    let key = ObjectKey::from_meta(&policy.metadata)?;
    if ctx.actions.remove(&key) {
        info!(policy = %key, "Policy removed");
    }
    Ok(Action::await_change())
}

/// Whether the recorded status is for another generation or readiness.
fn status_changed(policy: &CounterMeasure, ready: bool) -> bool {
    let want = if ready { "True" } else { "False" };
    let Some(status) = &policy.status else {
        return true;
    };
    let current_ready = status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.condition_type == "Ready")
        .map(|c| c.status.as_str());
    status.observed_generation != policy.metadata.generation || current_ready != Some(want)
}

async fn update_status(
    policy: &CounterMeasure,
    policies: &Api<CounterMeasure>,
    ready: bool,
    reason: &str,
    message: &str,
) -> Result<()> {
    if !status_changed(policy, ready) {
        return Ok(());
    }
    let status = CounterMeasureStatus {
        conditions: Some(vec![ResourceCondition::ready(ready, reason, message)]),
        observed_generation: policy.metadata.generation,
    };
    policies
        .patch_status(
            &policy.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{AlertSelector, CounterMeasureSpec, PrometheusTrigger};

    fn policy(generation: i64, status: Option<CounterMeasureStatus>) -> CounterMeasure {
        let mut policy = CounterMeasure::new(
            "p",
            CounterMeasureSpec {
                prometheus: PrometheusTrigger {
                    alert: AlertSelector {
                        name: "HighCPU".to_string(),
                        sources: Vec::new(),
                    },
                    suppression_policy: None,
                },
                dry_run: false,
                actions: Vec::new(),
            },
        );
        policy.metadata.generation = Some(generation);
        policy.status = status;
        policy
    }

    #[test]
    fn test_status_changed() {
        assert!(status_changed(&policy(1, None), true));

        let recorded = CounterMeasureStatus {
            conditions: Some(vec![ResourceCondition::ready(false, REASON_INVALID, "bad")]),
            observed_generation: Some(1),
        };
        assert!(!status_changed(&policy(1, Some(recorded.clone())), false));
        assert!(status_changed(&policy(1, Some(recorded.clone())), true));
        assert!(status_changed(&policy(2, Some(recorded)), false));
    }
}
