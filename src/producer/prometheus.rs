//! Prometheus alert producer.
//!
//! Polls `GET /api/v1/alerts` on a fixed interval and publishes every active
//! alert as an [`Event`] on the bus:
//! - the poll is skipped while the bus has no subscribers; alerts are
//!   level-triggered, so the next tick re-surfaces anything still firing
//! - fetch failures are logged and the tick is skipped
//! - publishing is retried with backoff and never ends the loop

use super::auth::BasicAuth;
use crate::bus::{topic, Bus};
use crate::error::{Error, Result};
use crate::event::{Event, ObjectKey};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

const PUBLISH_BACKOFF_BASE: Duration = Duration::from_millis(100);

/// Connection settings for one alerts API
#[derive(Debug, Clone)]
pub struct AlertsClientConfig {
    /// Base URL for the Prometheus API
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    pub auth: Option<BasicAuth>,
}

#[derive(Debug, Deserialize)]
struct AlertsResponse {
    status: String,
    #[serde(default)]
    data: Option<AlertsData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AlertsData {
    #[serde(default)]
    alerts: Vec<Alert>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Firing,
    Pending,
    Inactive,
    #[serde(other)]
    Unknown,
}

/// One entry of the alerts API response
#[derive(Debug, Clone, Deserialize)]
pub struct Alert {
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    pub state: AlertState,
    #[serde(default, rename = "activeAt")]
    pub active_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub value: Option<String>,
}

impl Alert {
    pub fn name(&self) -> Option<&str> {
        self.labels
            .get("alertname")
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn is_active(&self, include_pending: bool) -> bool {
        match self.state {
            AlertState::Firing => true,
            AlertState::Pending => include_pending,
            AlertState::Inactive | AlertState::Unknown => false,
        }
    }

    /// Event raised by `source` for this alert; `None` without an `alertname` label.
    pub fn to_event(&self, source: &ObjectKey) -> Option<Event> {
        let name = self.name()?;
        let active_time = self.active_at.unwrap_or_else(Utc::now);
        Some(Event::new(name, active_time, source.clone()).with_data(self.labels.clone()))
    }
}

/// HTTP client for the alerts endpoint
#[derive(Debug, Clone)]
pub struct AlertsClient {
    config: AlertsClientConfig,
    client: reqwest::Client,
}

impl AlertsClient {
    pub fn new(config: AlertsClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    /// Fetch every alert the server currently knows about.
    pub async fn alerts(&self) -> Result<Vec<Alert>> {
        let url = format!(
            "{}/api/v1/alerts",
            self.config.base_url.trim_end_matches('/')
        );

        trace!(url = %url, "Fetching alerts");

        let mut request = self.client.get(&url);
        if let Some(auth) = &self.config.auth {
            request = request.basic_auth(&auth.username, Some(&auth.password));
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::AlertsApiError { status, body });
        }

        let body: AlertsResponse = response.json().await?;
        if body.status != "success" {
            return Err(Error::AlertsApiError {
                status: 200,
                body: body.error.unwrap_or(body.status),
            });
        }

        Ok(body.data.map(|data| data.alerts).unwrap_or_default())
    }
}

/// Per-producer runtime settings
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub interval: Duration,
    pub include_pending: bool,
    pub publish_retries: u32,
}

/// Poll loop for one `PrometheusSource`
pub struct PrometheusProducer {
    key: ObjectKey,
    client: AlertsClient,
    bus: Bus,
    settings: ProducerSettings,
}

impl PrometheusProducer {
    pub fn new(key: ObjectKey, client: AlertsClient, bus: Bus, settings: ProducerSettings) -> Self {
        Self {
            key,
            client,
            bus,
            settings,
        }
    }

    /// Polls until `cancel` fires. The first poll happens immediately.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            source = %self.key,
            url = %self.client.base_url(),
            interval_secs = self.settings.interval.as_secs(),
            "Starting alert producer"
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once(&cancel).await;
                }
            }
        }

        info!(source = %self.key, "Alert producer stopped");
    }

    /// One poll cycle. Returns the number of events published.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> usize {
        if self.bus.subscriber_count() == 0 {
            trace!(source = %self.key, "No subscribers, skipping poll");
            return 0;
        }

        let alerts = match self.client.alerts().await {
            Ok(alerts) => alerts,
            Err(e) => {
                warn!(source = %self.key, error = %e, "Failed to fetch alerts, skipping tick");
                return 0;
            }
        };

        let mut published = 0;
        for alert in alerts
            .iter()
            .filter(|alert| alert.is_active(self.settings.include_pending))
        {
            let Some(event) = alert.to_event(&self.key) else {
                debug!(source = %self.key, labels = ?alert.labels, "Skipping alert without alertname");
                continue;
            };
            if self.publish_with_retry(event, cancel).await {
                published += 1;
            }
        }

        debug!(
            source = %self.key,
            fetched = alerts.len(),
            published,
            "Poll complete"
        );
        published
    }

    async fn publish_with_retry(&self, event: Event, cancel: &CancellationToken) -> bool {
        let topic = topic::for_event(&event);
        let mut delay = PUBLISH_BACKOFF_BASE;

        for attempt in 0..=self.settings.publish_retries {
            match self.bus.publish(topic.clone(), event.clone()) {
                Ok(()) => return true,
                Err(e) if attempt < self.settings.publish_retries => {
                    debug!(topic = %topic, attempt, error = %e, "Publish failed, retrying");
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Giving up publishing event");
                    return false;
                }
            }

            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(delay) => {}
            }
            delay = delay.saturating_mul(2);
        }
        false
    }
}
