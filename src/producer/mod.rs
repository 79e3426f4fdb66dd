//! Producers turn external state into events on the bus.
//!
//! One [`PrometheusProducer`] runs per deployed `PrometheusSource`; the
//! [`ProducerManager`] starts, replaces and stops them as the resources change.

pub mod auth;
pub mod prometheus;
pub mod suppression;

pub use auth::{BasicAuth, KubeSecretStore, SecretStore};
pub use prometheus::{AlertsClient, AlertsClientConfig, PrometheusProducer, ProducerSettings};
pub use suppression::SuppressionWindow;

use crate::bus::Bus;
use crate::crds::PrometheusSource;
use crate::error::Result;
use crate::event::ObjectKey;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

fn default_poll_interval_seconds() -> u64 {
    30
}

fn default_request_timeout_seconds() -> u64 {
    30
}

fn default_publish_retries() -> u32 {
    5
}

/// Defaults applied to every producer unless the source overrides them.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(
        default = "default_poll_interval_seconds",
        rename = "pollIntervalSeconds"
    )]
    pub poll_interval_seconds: u64,

    #[serde(default, rename = "includePending")]
    pub include_pending: bool,

    #[serde(
        default = "default_request_timeout_seconds",
        rename = "requestTimeoutSeconds"
    )]
    pub request_timeout_seconds: u64,

    #[serde(default = "default_publish_retries", rename = "publishRetries")]
    pub publish_retries: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_poll_interval_seconds(),
            include_pending: false,
            request_timeout_seconds: default_request_timeout_seconds(),
            publish_retries: default_publish_retries(),
        }
    }
}

struct RunningProducer {
    generation: Option<i64>,
    cancel: CancellationToken,
}

/// Registry of running producers keyed by source.
pub struct ProducerManager {
    bus: Bus,
    config: ProducerConfig,
    secrets: Arc<dyn SecretStore>,
    producers: Mutex<HashMap<ObjectKey, RunningProducer>>,
    cancel: CancellationToken,
}

impl ProducerManager {
    /// Producers stop when `cancel` fires or when removed.
    pub fn new(
        bus: Bus,
        config: ProducerConfig,
        secrets: Arc<dyn SecretStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            bus,
            config,
            secrets,
            producers: Mutex::new(HashMap::new()),
            cancel,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ObjectKey, RunningProducer>> {
        self.producers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts a producer for `source`, replacing any producer already running for it.
    #[instrument(skip(self, source), fields(source = ?source.metadata.name))]
    pub async fn add(&self, source: &PrometheusSource) -> Result<()> {
        let key = ObjectKey::from_meta(&source.metadata)?;
        let spec = &source.spec;
        let base_url = spec.endpoint(&key.namespace)?;

        let auth = match &spec.basic_auth_secret {
            Some(reference) => {
                let namespace = reference.namespace.as_deref().unwrap_or(&key.namespace);
                let secret = self.secrets.get(namespace, &reference.name).await?;
                Some(auth::basic_auth_from_secret(&secret)?)
            }
            None => None,
        };

        let client = AlertsClient::new(AlertsClientConfig {
            base_url,
            timeout_secs: self.config.request_timeout_seconds,
            auth,
        })?;
        let settings = ProducerSettings {
            interval: Duration::from_secs(
                spec.alert_resync_seconds
                    .unwrap_or(self.config.poll_interval_seconds)
                    .max(1),
            ),
            include_pending: spec.include_pending.unwrap_or(self.config.include_pending),
            publish_retries: self.config.publish_retries,
        };

        let cancel = self.cancel.child_token();
        let producer = PrometheusProducer::new(key.clone(), client, self.bus.clone(), settings);
        tokio::spawn(producer.run(cancel.clone()));

        let previous = self.lock().insert(
            key.clone(),
            RunningProducer {
                generation: source.metadata.generation,
                cancel,
            },
        );
        if let Some(previous) = previous {
            previous.cancel.cancel();
            info!(source = %key, "Replaced alert producer");
        } else {
            info!(source = %key, "Added alert producer");
        }
        Ok(())
    }

    /// Stops the producer for `key`. Returns whether one was running.
    pub fn remove(&self, key: &ObjectKey) -> bool {
        match self.lock().remove(key) {
            Some(running) => {
                running.cancel.cancel();
                info!(source = %key, "Removed alert producer");
                true
            }
            None => false,
        }
    }

    /// Whether a producer is running for this exact object generation.
    pub fn exists(&self, meta: &ObjectMeta) -> bool {
        let Ok(key) = ObjectKey::from_meta(meta) else {
            return false;
        };
        self.lock()
            .get(&key)
            .is_some_and(|running| running.generation == meta.generation)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
