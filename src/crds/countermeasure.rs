//! `CounterMeasure` Custom Resource Definition: one remediation policy

use super::ResourceCondition;
use crate::event::ObjectKey;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// `PrometheusSource` a policy listens to; namespace defaults to the policy's own
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
pub struct SourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// Alert the policy reacts to
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct AlertSelector {
    /// Alert name (the `alertname` label)
    pub name: String,

    /// Restrict to these sources; empty means any source
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceReference>,
}

/// Cool-down for repeats of the same alert
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct SuppressionPolicy {
    #[serde(rename = "durationSeconds")]
    pub duration_seconds: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct PrometheusTrigger {
    pub alert: AlertSelector,

    #[serde(
        default,
        rename = "suppressionPolicy",
        skip_serializing_if = "Option::is_none"
    )]
    pub suppression_policy: Option<SuppressionPolicy>,
}

/// Delete an object
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct DeleteSpec {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    #[default]
    Merge,
    Json,
    Strategic,
}

/// Patch an object with a rendered YAML document
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct PatchSpec {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,

    #[serde(default, rename = "patchType")]
    pub patch_type: PatchType,

    /// Patch body; may reference `target.*` fields of the live object
    #[serde(rename = "yamlTemplate")]
    pub yaml_template: String,
}

/// Roll a Deployment's pods
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct RestartSpec {
    pub namespace: String,
    #[serde(rename = "deploymentName")]
    pub deployment_name: String,
}

/// Attach an ephemeral debug container to a Pod
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct DebugSpec {
    pub namespace: String,
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "containerName")]
    pub container_name: String,
    pub image: String,

    /// Container whose process namespace is shared
    #[serde(
        default,
        rename = "targetContainerName",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_container_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tty: Option<bool>,
}

/// One step of a policy. Exactly one of the operation fields must be set.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct ActionSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete: Option<DeleteSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<RestartSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugSpec>,
}

/// `CounterMeasure` CRD: run `actions` when the alert fires
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "countermeasure.io", version = "v1alpha1", kind = "CounterMeasure")]
#[kube(namespaced)]
#[kube(status = "CounterMeasureStatus")]
#[kube(shortname = "cm")]
#[kube(printcolumn = r#"{"name":"Alert","type":"string","jsonPath":".spec.prometheus.alert.name"}"#)]
#[kube(printcolumn = r#"{"name":"DryRun","type":"boolean","jsonPath":".spec.dryRun"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct CounterMeasureSpec {
    pub prometheus: PrometheusTrigger,

    /// Submit every mutation with server-side dry-run
    #[serde(default, rename = "dryRun")]
    pub dry_run: bool,

    /// Executed in order; the first failure stops the sequence
    pub actions: Vec<ActionSpec>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct CounterMeasureStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ResourceCondition>>,

    #[serde(
        default,
        rename = "observedGeneration",
        skip_serializing_if = "Option::is_none"
    )]
    pub observed_generation: Option<i64>,
}

impl CounterMeasure {
    /// Event name the policy reacts to.
    pub fn alert_name(&self) -> &str {
        &self.spec.prometheus.alert.name
    }

    /// Allowed sources, with unset namespaces defaulted to the policy's namespace.
    pub fn source_keys(&self) -> HashSet<ObjectKey> {
        let own_namespace = self.namespace().unwrap_or_default();
        self.spec
            .prometheus
            .alert
            .sources
            .iter()
            .map(|source| {
                ObjectKey::new(
                    source
                        .namespace
                        .clone()
                        .unwrap_or_else(|| own_namespace.clone()),
                    source.name.clone(),
                )
            })
            .collect()
    }

    /// Suppression duration in seconds, if the policy has one.
    pub fn suppression_seconds(&self) -> Option<u64> {
        self.spec
            .prometheus
            .suppression_policy
            .as_ref()
            .map(|policy| policy.duration_seconds)
            .filter(|seconds| *seconds > 0)
    }
}
