//! Remediation counters.

use crate::error::Result;
use prometheus::{IntCounterVec, Opts, Registry, TextEncoder};

const LABELS: &[&str] = &["namespace", "kind"];

/// `actions_taken_total` and `action_errors_total`, labeled by namespace and action kind.
#[derive(Clone)]
pub struct ActionMetrics {
    taken: IntCounterVec,
    errors: IntCounterVec,
}

impl ActionMetrics {
    pub fn new() -> Result<Self> {
        Ok(Self {
            taken: IntCounterVec::new(
                Opts::new("actions_taken_total", "Remediation actions that changed the cluster"),
                LABELS,
            )?,
            errors: IntCounterVec::new(
                Opts::new("action_errors_total", "Remediation actions that failed"),
                LABELS,
            )?,
        })
    }

    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.taken.clone()))?;
        registry.register(Box::new(self.errors.clone()))?;
        Ok(())
    }

    pub fn action_taken(&self, namespace: &str, kind: &str) {
        self.taken.with_label_values(&[namespace, kind]).inc();
    }

    pub fn action_error(&self, namespace: &str, kind: &str) {
        self.errors.with_label_values(&[namespace, kind]).inc();
    }

    pub fn taken_count(&self, namespace: &str, kind: &str) -> u64 {
        self.taken.with_label_values(&[namespace, kind]).get()
    }

    pub fn error_count(&self, namespace: &str, kind: &str) -> u64 {
        self.errors.with_label_values(&[namespace, kind]).get()
    }
}

impl std::fmt::Debug for ActionMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionMetrics").finish_non_exhaustive()
    }
}

/// Text exposition of everything in `registry`.
pub fn render(registry: &Registry) -> Result<String> {
    let mut buffer = String::new();
    TextEncoder::new().encode_utf8(&registry.gather(), &mut buffer)?;
    Ok(buffer)
}
