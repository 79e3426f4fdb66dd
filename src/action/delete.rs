use super::template::{object_name, scope, TemplateContext};
use super::ActionContext;
use crate::cluster::parse_gvk;
use crate::crds::DeleteSpec;
use crate::error::Result;
use crate::event::Event;
use tracing::debug;

/// Deletes the target. An absent target counts as success with no effect.
#[derive(Debug, Clone)]
pub struct DeleteAction {
    pub name: String,
    pub spec: DeleteSpec,
}

impl DeleteAction {
    pub async fn execute(&self, context: &ActionContext, event: &Event) -> Result<Option<String>> {
        let template = TemplateContext::new(event);
        let namespace = scope(&self.spec.namespace, &template)?;
        let name = object_name("name", &self.spec.name, &template)?;
        let gvk = parse_gvk(&self.spec.api_version, &self.spec.kind);

        let deleted = context
            .cluster
            .delete(&gvk, &namespace, &name, context.dry_run())
            .await?;

        if deleted {
            Ok(Some(context.describe(format!(
                "delete {} {namespace}/{name}",
                self.spec.kind
            ))))
        } else {
            debug!(kind = %self.spec.kind, namespace = %namespace, name = %name, "Target already absent");
            Ok(None)
        }
    }
}
