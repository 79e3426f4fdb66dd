//! `PrometheusSource` Custom Resource Definition: an alerts API to poll

use super::ResourceCondition;
use crate::error::{Error, Result};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

const DEFAULT_SERVICE_PORT: u16 = 9090;
const DEFAULT_SERVICE_SCHEME: &str = "http";

/// In-cluster Prometheus service
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct ServiceReference {
    /// Defaults to the source's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
}

/// Basic-auth secret; must be of type `kubernetes.io/basic-auth`
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct SecretReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

/// `PrometheusSource` CRD
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "countermeasure.io", version = "v1alpha1", kind = "PrometheusSource")]
#[kube(namespaced)]
#[kube(status = "PrometheusSourceStatus")]
#[kube(printcolumn = r#"{"name":"Address","type":"string","jsonPath":".spec.address"}"#)]
#[kube(printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
pub struct PrometheusSourceSpec {
    /// Base URL of the Prometheus server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Used when `address` is not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,

    #[serde(
        default,
        rename = "basicAuthSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub basic_auth_secret: Option<SecretReference>,

    /// Poll interval override in seconds
    #[serde(
        default,
        rename = "alertResyncSeconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub alert_resync_seconds: Option<u64>,

    /// Also raise events for pending alerts
    #[serde(
        default,
        rename = "includePending",
        skip_serializing_if = "Option::is_none"
    )]
    pub include_pending: Option<bool>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, Default)]
pub struct PrometheusSourceStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditions: Option<Vec<ResourceCondition>>,
}

impl PrometheusSourceSpec {
    /// Base URL of the alerts API. `address` wins over `service`.
    pub fn endpoint(&self, own_namespace: &str) -> Result<String> {
        if let Some(address) = self.address.as_deref().filter(|a| !a.trim().is_empty()) {
            return Ok(address.trim().trim_end_matches('/').to_string());
        }

        match &self.service {
            Some(service) => {
                let namespace = service.namespace.as_deref().unwrap_or(own_namespace);
                let scheme = service.scheme.as_deref().unwrap_or(DEFAULT_SERVICE_SCHEME);
                let port = service.port.unwrap_or(DEFAULT_SERVICE_PORT);
                Ok(format!(
                    "{scheme}://{}.{namespace}.svc:{port}",
                    service.name
                ))
            }
            None => Err(Error::ConfigError(
                "either address or service must be set".to_string(),
            )),
        }
    }
}
