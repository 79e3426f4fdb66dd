use super::template::{label, object_name, TemplateContext};
use super::ActionContext;
use crate::crds::DebugSpec;
use crate::error::{Error, Result};
use crate::event::Event;
use k8s_openapi::api::core::v1::EphemeralContainer;
use kube::core::GroupVersionKind;
use serde_json::Value;
use tracing::debug;

const EPHEMERAL_CONTAINERS_SUBRESOURCE: &str = "ephemeralcontainers";

/// Attaches an ephemeral container to a Pod. Attaching a name that is already
/// present is a no-op.
#[derive(Debug, Clone)]
pub struct DebugAction {
    pub name: String,
    pub spec: DebugSpec,
}

impl DebugAction {
    pub async fn execute(&self, context: &ActionContext, event: &Event) -> Result<Option<String>> {
        let template = TemplateContext::new(event);
        let namespace = label("namespace", &self.spec.namespace, &template)?;
        let pod_name = object_name("podName", &self.spec.pod_name, &template)?;
        let container_name = label("containerName", &self.spec.container_name, &template)?;
        let target_container_name = self
            .spec
            .target_container_name
            .as_deref()
            .map(|target| label("targetContainerName", target, &template))
            .transpose()?;

        let gvk = GroupVersionKind::gvk("", "v1", "Pod");
        let mut pod = context
            .cluster
            .get(&gvk, &namespace, &pod_name)
            .await?
            .ok_or_else(|| Error::TargetNotFound {
                kind: "Pod".to_string(),
                namespace: namespace.clone(),
                name: pod_name.clone(),
            })?;

        if has_ephemeral_container(&pod.data, &container_name) {
            debug!(pod = %pod_name, container = %container_name, "Debug container already attached");
            return Ok(None);
        }

        let container = EphemeralContainer {
            name: container_name.clone(),
            image: Some(self.spec.image.clone()),
            command: self.spec.command.clone(),
            stdin: self.spec.stdin,
            tty: self.spec.tty,
            target_container_name,
            ..EphemeralContainer::default()
        };
        push_ephemeral_container(&mut pod.data, serde_json::to_value(container)?)?;

        context
            .cluster
            .update(
                &gvk,
                &namespace,
                &pod_name,
                Some(EPHEMERAL_CONTAINERS_SUBRESOURCE),
                &pod,
                context.dry_run(),
            )
            .await?;

        Ok(Some(context.describe(format!(
            "attach debug container {container_name} to Pod {namespace}/{pod_name}"
        ))))
    }
}

pub(crate) fn has_ephemeral_container(pod: &Value, name: &str) -> bool {
    pod.pointer("/spec/ephemeralContainers")
        .and_then(Value::as_array)
        .is_some_and(|containers| {
            containers
                .iter()
                .any(|c| c.get("name").and_then(Value::as_str) == Some(name))
        })
}

fn push_ephemeral_container(pod: &mut Value, container: Value) -> Result<()> {
    let spec = pod
        .get_mut("spec")
        .and_then(Value::as_object_mut)
        .ok_or_else(|| Error::ConfigError("pod has no spec".to_string()))?;

    match spec
        .entry("ephemeralContainers")
        .or_insert_with(|| Value::Array(Vec::new()))
    {
        Value::Array(containers) => {
            containers.push(container);
            Ok(())
        }
        _ => Err(Error::ConfigError(
            "pod spec.ephemeralContainers is not a list".to_string(),
        )),
    }
}
