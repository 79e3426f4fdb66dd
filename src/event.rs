//! Events raised by producers and routed through the bus.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt;

/// Namespace + name identity of a cluster object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Builds the key of a namespaced object from its metadata.
    pub fn from_meta(meta: &ObjectMeta) -> Result<Self> {
        match (&meta.namespace, &meta.name) {
            (Some(namespace), Some(name)) => Ok(Self::new(namespace, name)),
            _ => Err(Error::MissingObjectKey),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A condition that became active, as observed by a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Identity of the detected condition (the alert name for Prometheus).
    pub name: String,
    /// When the condition became active.
    #[serde(rename = "activeTime")]
    pub active_time: DateTime<Utc>,
    /// Label set of the condition.
    #[serde(default)]
    pub data: HashMap<String, String>,
    /// Producer that raised the event.
    pub source: ObjectKey,
}

impl Event {
    pub fn new(name: impl Into<String>, active_time: DateTime<Utc>, source: ObjectKey) -> Self {
        Self {
            name: name.into(),
            active_time,
            data: HashMap::new(),
            source,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: HashMap<String, String>) -> Self {
        self.data = data;
        self
    }

    /// Deterministic dedup key: SHA-1 over the name followed by the sorted data values.
    ///
    /// Returns an empty string for an event with neither name nor data.
    pub fn key(&self) -> String {
        if self.name.is_empty() && self.data.is_empty() {
            return String::new();
        }

        let mut values: Vec<&str> = self.data.values().map(String::as_str).collect();
        values.sort_unstable();

        let mut hasher = Sha1::new();
        hasher.update(self.name.as_bytes());
        for value in values {
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn source() -> ObjectKey {
        ObjectKey::new("monitoring", "prometheus")
    }

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_key_ignores_insertion_order() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let mut forward = HashMap::new();
        for i in 0..32 {
            forward.insert(format!("label-{i}"), format!("value-{i}"));
        }
        let mut backward = HashMap::new();
        for i in (0..32).rev() {
            backward.insert(format!("label-{i}"), format!("value-{i}"));
        }

        let a = Event::new("HighCPU", at, source()).with_data(forward);
        let b = Event::new("HighCPU", at, source()).with_data(backward);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_depends_on_name_and_values() {
        let at = Utc::now();
        let data = labels(&[("pod", "app-1")]);

        let base = Event::new("HighCPU", at, source()).with_data(data.clone());
        let other_name = Event::new("HighMemory", at, source()).with_data(data);
        let other_value =
            Event::new("HighCPU", at, source()).with_data(labels(&[("pod", "app-2")]));

        assert_ne!(base.key(), other_name.key());
        assert_ne!(base.key(), other_value.key());
        assert_eq!(base.key().len(), 40);
    }

    #[test]
    fn test_key_ignores_time_and_source() {
        let data = labels(&[("pod", "app-1"), ("namespace", "default")]);
        let a = Event::new("HighCPU", Utc::now(), source()).with_data(data.clone());
        let b = Event::new(
            "HighCPU",
            Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
            ObjectKey::new("other", "source"),
        )
        .with_data(data);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_empty_event_has_empty_key() {
        let event = Event::new("", Utc::now(), ObjectKey::default());
        assert_eq!(event.key(), "");
    }

    #[test]
    fn test_object_key_from_meta() {
        let meta = ObjectMeta {
            namespace: Some("default".to_string()),
            name: Some("cm".to_string()),
            ..ObjectMeta::default()
        };
        let key = ObjectKey::from_meta(&meta).unwrap();
        assert_eq!(key.to_string(), "default/cm");

        let unnamed = ObjectMeta::default();
        assert!(matches!(
            ObjectKey::from_meta(&unnamed),
            Err(Error::MissingObjectKey)
        ));
    }
}
