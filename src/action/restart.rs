use super::template::{label, object_name, TemplateContext};
use super::ActionContext;
use crate::cluster::PatchDocument;
use crate::crds::RestartSpec;
use crate::error::Result;
use crate::event::Event;
use chrono::Utc;
use kube::core::GroupVersionKind;
use serde_json::json;

/// Annotation `kubectl rollout restart` sets on the pod template
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Rolls a Deployment by stamping its pod template.
#[derive(Debug, Clone)]
pub struct RestartAction {
    pub name: String,
    pub spec: RestartSpec,
}

impl RestartAction {
    pub async fn execute(&self, context: &ActionContext, event: &Event) -> Result<Option<String>> {
        let template = TemplateContext::new(event);
        let namespace = label("namespace", &self.spec.namespace, &template)?;
        let name = object_name("deploymentName", &self.spec.deployment_name, &template)?;

        let patch = json!({
            "spec": {
                "template": {
                    "metadata": {
                        "annotations": {
                            RESTARTED_AT_ANNOTATION: Utc::now().to_rfc3339()
                        }
                    }
                }
            }
        });

        context
            .cluster
            .patch(
                &GroupVersionKind::gvk("apps", "v1", "Deployment"),
                &namespace,
                &name,
                &PatchDocument::Strategic(patch),
                context.dry_run(),
            )
            .await?;

        Ok(Some(context.describe(format!(
            "restart Deployment {namespace}/{name}"
        ))))
    }
}
