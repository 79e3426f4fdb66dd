//! Dynamic access to cluster objects addressed by group-version-kind.

use crate::error::Result;
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams};
use kube::core::GroupVersionKind;
use kube::discovery::{pinned_kind, ApiCapabilities, ApiResource, Scope};
use kube::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Patch body in one of the three supported encodings.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchDocument {
    Merge(Value),
    Json(Value),
    Strategic(Value),
}

/// Splits `apps/v1` + `Deployment` (or core `v1` + `Pod`) into a GVK.
pub fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

pub fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

/// Object store operations used by actions. Every mutation takes a dry-run flag.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// Returns `false` when the object did not exist.
    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        dry_run: bool,
    ) -> Result<bool>;

    async fn patch(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        patch: &PatchDocument,
        dry_run: bool,
    ) -> Result<DynamicObject>;

    /// Replaces the object, or one of its subresources.
    async fn update(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject>;
}

/// [`ClusterClient`] backed by the API server, with discovery results cached per kind.
pub struct KubeCluster {
    client: Client,
    discovered: Mutex<HashMap<String, (ApiResource, ApiCapabilities)>>,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            discovered: Mutex::new(HashMap::new()),
        }
    }

    async fn api(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Api<DynamicObject>> {
        let cache_key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        let cached = self
            .discovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key)
            .cloned();

        let (resource, capabilities) = match cached {
            Some(found) => found,
            None => {
                debug!(kind = %cache_key, "Discovering API resource");
                let found = pinned_kind(&self.client, gvk).await?;
                self.discovered
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(cache_key, found.clone());
                found
            }
        };

        Ok(match capabilities.scope {
            Scope::Namespaced => Api::namespaced_with(self.client.clone(), namespace, &resource),
            Scope::Cluster => Api::all_with(self.client.clone(), &resource),
        })
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let api = self.api(gvk, namespace).await?;
        Ok(api.get_opt(name).await?)
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        dry_run: bool,
    ) -> Result<bool> {
        let api = self.api(gvk, namespace).await?;
        let params = DeleteParams {
            dry_run,
            ..DeleteParams::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        patch: &PatchDocument,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let api = self.api(gvk, namespace).await?;
        let params = PatchParams {
            dry_run,
            ..PatchParams::default()
        };
        let patched = match patch {
            PatchDocument::Merge(body) => api.patch(name, &params, &Patch::Merge(body)).await?,
            PatchDocument::Strategic(body) => {
                api.patch(name, &params, &Patch::Strategic(body)).await?
            }
            PatchDocument::Json(body) => {
                let operations = serde_json::from_value(body.clone())?;
                api.patch(name, &params, &Patch::<Value>::Json(operations))
                    .await?
            }
        };
        Ok(patched)
    }

    async fn update(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        subresource: Option<&str>,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let api = self.api(gvk, namespace).await?;
        let params = PostParams {
            dry_run,
            ..PostParams::default()
        };
        let updated = match subresource {
            Some(subresource) => {
                api.replace_subresource(subresource, name, &params, serde_json::to_vec(object)?)
                    .await?
            }
            None => api.replace(name, &params, object).await?,
        };
        Ok(updated)
    }
}
