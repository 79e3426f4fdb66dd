use super::template::{object_name, render_value, scope, TemplateContext};
use super::ActionContext;
use crate::cluster::{parse_gvk, PatchDocument};
use crate::crds::{PatchSpec, PatchType};
use crate::error::{Error, Result};
use crate::event::Event;
use serde_json::Value;

/// Applies a rendered YAML patch. The template sees the live object as `target`.
///
/// The template is parsed before anything is substituted, so directives belong
/// inside quoted YAML strings: `reason: "{{ data.summary }}"`.
#[derive(Debug, Clone)]
pub struct PatchAction {
    pub name: String,
    pub spec: PatchSpec,
}

impl PatchAction {
    pub async fn execute(&self, context: &ActionContext, event: &Event) -> Result<Option<String>> {
        let identity = TemplateContext::new(event);
        let namespace = scope(&self.spec.namespace, &identity)?;
        let name = object_name("name", &self.spec.name, &identity)?;
        let template = self.template()?;
        let gvk = parse_gvk(&self.spec.api_version, &self.spec.kind);

        let target = context
            .cluster
            .get(&gvk, &namespace, &name)
            .await?
            .ok_or_else(|| Error::TargetNotFound {
                kind: self.spec.kind.clone(),
                namespace: namespace.clone(),
                name: name.clone(),
            })?;
        let live = serde_json::to_value(&target)?;

        let body = render_value(&template, &TemplateContext::new(event).with_target(&live))?;
        let document = self.document(body)?;

        context
            .cluster
            .patch(&gvk, &namespace, &name, &document, context.dry_run())
            .await?;

        Ok(Some(context.describe(format!(
            "patch {} {namespace}/{name}",
            self.spec.kind
        ))))
    }

    /// The unrendered template as a document.
    pub fn template(&self) -> Result<Value> {
        serde_yaml::from_str(&self.spec.yaml_template).map_err(|e| Error::InvalidAction {
            name: self.name.clone(),
            reason: format!("yamlTemplate is not valid YAML (directives must be quoted): {e}"),
        })
    }

    fn document(&self, value: Value) -> Result<PatchDocument> {
        Ok(match self.spec.patch_type {
            PatchType::Merge => PatchDocument::Merge(value),
            PatchType::Strategic => PatchDocument::Strategic(value),
            PatchType::Json => {
                if !value.is_array() {
                    return Err(Error::InvalidAction {
                        name: self.name.clone(),
                        reason: "a json patch must be a list of operations".to_string(),
                    });
                }
                PatchDocument::Json(value)
            }
        })
    }
}
