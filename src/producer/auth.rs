//! Credentials for the alerts API.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

pub const BASIC_AUTH_SECRET_TYPE: &str = "kubernetes.io/basic-auth";

#[derive(Clone, PartialEq, Eq)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Reads basic-auth credentials out of a secret. Only `kubernetes.io/basic-auth`
/// secrets are accepted.
pub fn basic_auth_from_secret(secret: &Secret) -> Result<BasicAuth> {
    let name = secret.metadata.name.as_deref().unwrap_or("<unnamed>");

    match secret.type_.as_deref() {
        Some(BASIC_AUTH_SECRET_TYPE) => {}
        other => {
            return Err(Error::ConfigError(format!(
                "secret {name} has type {}, expected {BASIC_AUTH_SECRET_TYPE}",
                other.unwrap_or("Opaque")
            )))
        }
    }

    let field = |key: &str| -> Result<String> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|value| value.0.clone())
            .or_else(|| {
                secret
                    .string_data
                    .as_ref()
                    .and_then(|data| data.get(key))
                    .map(|value| value.clone().into_bytes())
            })
            .ok_or_else(|| Error::ConfigError(format!("secret {name} has no {key}")))?;
        String::from_utf8(bytes)
            .map_err(|_| Error::ConfigError(format!("secret {name}: {key} is not valid UTF-8")))
    };

    Ok(BasicAuth {
        username: field("username")?,
        password: field("password")?,
    })
}

/// Namespaced secret lookup.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret>;
}

pub struct KubeSecretStore {
    client: Client,
}

impl KubeSecretStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }
}
