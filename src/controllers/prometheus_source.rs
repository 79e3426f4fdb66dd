use super::{map_finalizer_error, Context, FINALIZER_NAME};
use crate::crds::{PrometheusSource, PrometheusSourceStatus, ResourceCondition};
use crate::error::Result;
use crate::event::ObjectKey;
use crate::recorder::{NoticeType, REASON_INVALID};
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};

#[instrument(skip(ctx, source), fields(source = %source.name_any(), namespace = ?source.namespace()))]
pub async fn reconcile(source: Arc<PrometheusSource>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = source.namespace().unwrap_or_default();
    let sources: Api<PrometheusSource> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&sources, FINALIZER_NAME, source, |event| async {
        match event {
            FinalizerEvent::Apply(source) => apply(source, &sources, &ctx).await,
            FinalizerEvent::Cleanup(source) => cleanup(&source, &ctx),
        }
    })
    .await
    .map_err(map_finalizer_error)
}

async fn apply(
    source: Arc<PrometheusSource>,
    sources: &Api<PrometheusSource>,
    ctx: &Context,
) -> Result<Action> {
    if ctx.producers.exists(&source.metadata) {
        return Ok(Action::await_change());
    }

    match ctx.producers.add(&source).await {
        Ok(()) => {
            update_status(&source, sources, true, "Polling", "producer is running").await?;
            Ok(Action::await_change())
        }
        Err(e) if e.is_config_error() => {
            warn!(error = %e, "Rejected invalid source");
            let message = e.to_string();
            if !has_ready(&source, false, &message) {
                ctx.recorder
                    .notice(
                        &source.object_ref(&()),
                        NoticeType::Warning,
                        REASON_INVALID,
                        message.clone(),
                    )
                    .await;
                update_status(&source, sources, false, REASON_INVALID, &message).await?;
            }
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    }
}

fn cleanup(source: &PrometheusSource, ctx: &Context) -> Result<Action> {
    let key = ObjectKey::from_meta(&source.metadata)?;
    if ctx.producers.remove(&key) {
        info!(source = %key, "Source removed");
    }
    Ok(Action::await_change())
}

fn has_ready(source: &PrometheusSource, ready: bool, message: &str) -> bool {
    let want = if ready { "True" } else { "False" };
    source
        .status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.condition_type == "Ready"))
        .is_some_and(|c| c.status == want && c.message.as_deref() == Some(message))
}

async fn update_status(
    source: &PrometheusSource,
    sources: &Api<PrometheusSource>,
    ready: bool,
    reason: &str,
    message: &str,
) -> Result<()> {
    if has_ready(source, ready, message) {
        return Ok(());
    }
    let status = PrometheusSourceStatus {
        conditions: Some(vec![ResourceCondition::ready(ready, reason, message)]),
    };
    sources
        .patch_status(
            &source.name_any(),
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": status })),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::PrometheusSourceSpec;

    fn source(status: Option<PrometheusSourceStatus>) -> PrometheusSource {
        let mut source = PrometheusSource::new(
            "prometheus",
            PrometheusSourceSpec {
                address: Some("http://prometheus:9090".to_string()),
                service: None,
                basic_auth_secret: None,
                alert_resync_seconds: None,
                include_pending: None,
            },
        );
        source.status = status;
        source
    }

    #[test]
    fn test_has_ready() {
        assert!(!has_ready(&source(None), true, "producer is running"));

        let running = source(Some(PrometheusSourceStatus {
            conditions: Some(vec![ResourceCondition::ready(
                true,
                "Polling",
                "producer is running",
            )]),
        }));
        assert!(has_ready(&running, true, "producer is running"));
        assert!(!has_ready(&running, false, "producer is running"));
        assert!(!has_ready(&running, true, "something else"));
    }
}
