//! In-memory cluster and recorder used by the runner and manager tests.

use crate::action::ActionContext;
use crate::cluster::{ClusterClient, PatchDocument};
use crate::crds::{
    ActionSpec, AlertSelector, CounterMeasure, CounterMeasureSpec, DebugSpec, DeleteSpec,
    PatchSpec, PatchType, PrometheusTrigger,
};
use crate::error::Result;
use crate::metrics::ActionMetrics;
use crate::recorder::{NoticeRecorder, NoticeType};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{ApiResource, DynamicObject};
use kube::core::GroupVersionKind;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

type ObjectId = (String, String, String);

fn object_id(gvk: &GroupVersionKind, namespace: &str, name: &str) -> ObjectId {
    (
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind),
        namespace.to_string(),
        name.to_string(),
    )
}

/// Object store keyed by kind, namespace and name. Records every call.
#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<HashMap<ObjectId, DynamicObject>>,
    calls: Mutex<Vec<String>>,
    patches: Mutex<Vec<PatchDocument>>,
    /// Deletes wait for a permit when set
    delete_gate: Option<Arc<Semaphore>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deletes block until the returned semaphore gets a permit.
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let cluster = Self {
            delete_gate: Some(gate.clone()),
            ..Self::default()
        };
        (cluster, gate)
    }

    pub fn insert(&self, api_version: &str, kind: &str, namespace: &str, name: &str, data: Value) {
        let gvk = crate::cluster::parse_gvk(api_version, kind);
        let object = DynamicObject::new(name, &ApiResource::from_gvk(&gvk))
            .within(namespace)
            .data(data);
        self.objects
            .lock()
            .unwrap()
            .insert(object_id(&gvk, namespace, name), object);
    }

    pub fn object(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> Option<DynamicObject> {
        let gvk = crate::cluster::parse_gvk(api_version, kind);
        self.objects
            .lock()
            .unwrap()
            .get(&object_id(&gvk, namespace, name))
            .cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, verb: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.split(' ').next() == Some(verb))
            .count()
    }

    pub fn patches(&self) -> Vec<PatchDocument> {
        self.patches.lock().unwrap().clone()
    }

    fn record(&self, verb: &str, gvk: &GroupVersionKind, namespace: &str, name: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{verb} {} {namespace}/{name}", gvk.kind));
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        self.record("get", gvk, namespace, name);
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&object_id(gvk, namespace, name))
            .cloned())
    }

    async fn delete(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        dry_run: bool,
    ) -> Result<bool> {
        if let Some(gate) = &self.delete_gate {
            let _permit = gate.acquire().await;
        }
        self.record("delete", gvk, namespace, name);
        let mut objects = self.objects.lock().unwrap();
        let id = object_id(gvk, namespace, name);
        if dry_run {
            return Ok(objects.contains_key(&id));
        }
        Ok(objects.remove(&id).is_some())
    }

    async fn patch(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        patch: &PatchDocument,
        _dry_run: bool,
    ) -> Result<DynamicObject> {
        self.record("patch", gvk, namespace, name);
        self.patches.lock().unwrap().push(patch.clone());
        let objects = self.objects.lock().unwrap();
        match objects.get(&object_id(gvk, namespace, name)) {
            Some(object) => Ok(object.clone()),
            None => Err(crate::error::Error::TargetNotFound {
                kind: gvk.kind.clone(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn update(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        name: &str,
        _subresource: Option<&str>,
        object: &DynamicObject,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        self.record("update", gvk, namespace, name);
        if !dry_run {
            self.objects
                .lock()
                .unwrap()
                .insert(object_id(gvk, namespace, name), object.clone());
        }
        Ok(object.clone())
    }
}

/// Keeps every notice in order.
#[derive(Default)]
pub struct RecordingRecorder {
    notices: Mutex<Vec<(NoticeType, String, String)>>,
}

impl RecordingRecorder {
    pub fn notices(&self) -> Vec<(NoticeType, String, String)> {
        self.notices.lock().unwrap().clone()
    }

    pub fn count(&self, reason: &str) -> usize {
        self.notices
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, r, _)| r == reason)
            .count()
    }
}

#[async_trait]
impl NoticeRecorder for RecordingRecorder {
    async fn notice(
        &self,
        _object: &ObjectReference,
        kind: NoticeType,
        reason: &str,
        message: String,
    ) {
        self.notices
            .lock()
            .unwrap()
            .push((kind, reason.to_string(), message));
    }
}

pub fn policy(name: &str, alert: &str, actions: Vec<ActionSpec>) -> CounterMeasure {
    let mut policy = CounterMeasure::new(
        name,
        CounterMeasureSpec {
            prometheus: PrometheusTrigger {
                alert: AlertSelector {
                    name: alert.to_string(),
                    sources: Vec::new(),
                },
                suppression_policy: None,
            },
            dry_run: false,
            actions,
        },
    );
    policy.metadata.namespace = Some("default".to_string());
    policy.metadata.generation = Some(1);
    policy
}

pub fn delete_pod(name: &str, pod: &str) -> ActionSpec {
    ActionSpec {
        name: name.to_string(),
        delete: Some(DeleteSpec {
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            namespace: "default".to_string(),
            name: pod.to_string(),
        }),
        ..ActionSpec::default()
    }
}

pub fn patch_deployment(name: &str, deployment: &str, template: &str) -> ActionSpec {
    ActionSpec {
        name: name.to_string(),
        patch: Some(PatchSpec {
            api_version: "apps/v1".to_string(),
            kind: "Deployment".to_string(),
            namespace: "default".to_string(),
            name: deployment.to_string(),
            patch_type: PatchType::Merge,
            yaml_template: template.to_string(),
        }),
        ..ActionSpec::default()
    }
}

pub fn debug_pod(name: &str, pod: &str) -> ActionSpec {
    ActionSpec {
        name: name.to_string(),
        debug: Some(DebugSpec {
            namespace: "default".to_string(),
            pod_name: pod.to_string(),
            container_name: "debugger".to_string(),
            image: "busybox:1.36".to_string(),
            target_container_name: Some("app".to_string()),
            command: None,
            stdin: Some(true),
            tty: Some(true),
        }),
        ..ActionSpec::default()
    }
}

pub fn pod_body() -> Value {
    json!({"spec": {"containers": [{"name": "app", "image": "app:1"}]}})
}

pub fn context(
    cluster: Arc<FakeCluster>,
    recorder: Arc<RecordingRecorder>,
    policy: CounterMeasure,
) -> ActionContext {
    ActionContext {
        cluster,
        recorder,
        metrics: ActionMetrics::new().unwrap(),
        policy: Arc::new(policy),
    }
}

/// Polls `condition` until it holds; panics after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
