//! Human-readable notices recorded against policy objects.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event as KubeEvent, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

pub const REASON_ACTION_TAKEN: &str = "ActionTaken";
pub const REASON_ACTION_FAILED: &str = "ActionFailed";
pub const REASON_SKIPPED: &str = "Skipped";
pub const REASON_INVALID: &str = "InvalidPolicy";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeType {
    Normal,
    Warning,
}

/// Records notices against an object. Recording never fails the caller.
#[async_trait]
pub trait NoticeRecorder: Send + Sync {
    async fn notice(
        &self,
        object: &ObjectReference,
        kind: NoticeType,
        reason: &str,
        message: String,
    );
}

/// Publishes notices as Kubernetes events.
pub struct KubeRecorder {
    recorder: Recorder,
}

impl KubeRecorder {
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        let reporter = Reporter {
            controller: controller.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl NoticeRecorder for KubeRecorder {
    async fn notice(
        &self,
        object: &ObjectReference,
        kind: NoticeType,
        reason: &str,
        message: String,
    ) {
        let event = KubeEvent {
            type_: match kind {
                NoticeType::Normal => EventType::Normal,
                NoticeType::Warning => EventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message),
            action: "Remediate".to_string(),
            secondary: None,
        };

        if let Err(e) = self.recorder.publish(&event, object).await {
            warn!(
                object = ?object.name,
                reason = %reason,
                error = %e,
                "Failed to record event"
            );
        }
    }
}
