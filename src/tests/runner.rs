use super::fixtures::{
    context, debug_pod, delete_pod, patch_deployment, pod_body, policy, FakeCluster,
    RecordingRecorder,
};
use crate::action::restart::RESTARTED_AT_ANNOTATION;
use crate::action::ActionRunner;
use crate::cluster::PatchDocument;
use crate::crds::{ActionSpec, RestartSpec};
use crate::error::Error;
use crate::event::{Event, ObjectKey};
use crate::recorder::{NoticeType, REASON_ACTION_FAILED, REASON_ACTION_TAKEN};
use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn event(pod: &str) -> Event {
    Event::new("HighCPU", Utc::now(), ObjectKey::new("monitoring", "prometheus")).with_data(
        HashMap::from([
            ("alertname".to_string(), "HighCPU".to_string()),
            ("pod".to_string(), pod.to_string()),
        ]),
    )
}

#[tokio::test]
async fn test_delete_absent_target_is_success_without_notice() {
    let cluster = Arc::new(FakeCluster::new());
    let recorder = Arc::new(RecordingRecorder::default());
    let policy = policy("evict", "HighCPU", vec![delete_pod("evict", "{{ data.pod }}")]);
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder.clone(), policy);

    let taken = runner.run(&ctx, &event("gone")).await.unwrap();

    assert_eq!(taken, 0);
    assert_eq!(cluster.calls(), vec!["delete Pod default/gone".to_string()]);
    assert!(recorder.notices().is_empty());
    assert_eq!(ctx.metrics.taken_count("default", "delete"), 0);
}

#[tokio::test]
async fn test_delete_records_notice_and_metric() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert("v1", "Pod", "default", "app-1", pod_body());
    let recorder = Arc::new(RecordingRecorder::default());
    let policy = policy("evict", "HighCPU", vec![delete_pod("evict", "{{ data.pod }}")]);
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder.clone(), policy);

    assert_eq!(runner.run(&ctx, &event("app-1")).await.unwrap(), 1);

    assert!(cluster.object("v1", "Pod", "default", "app-1").is_none());
    assert_eq!(ctx.metrics.taken_count("default", "delete"), 1);
    let notices = recorder.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].0, NoticeType::Normal);
    assert_eq!(notices[0].1, REASON_ACTION_TAKEN);
    assert_eq!(notices[0].2, "evict: delete Pod default/app-1");
}

#[tokio::test]
async fn test_dry_run_leaves_target_in_place() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert("v1", "Pod", "default", "app-1", pod_body());
    let recorder = Arc::new(RecordingRecorder::default());
    let mut policy = policy("evict", "HighCPU", vec![delete_pod("evict", "{{ data.pod }}")]);
    policy.spec.dry_run = true;
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder.clone(), policy);

    assert_eq!(runner.run(&ctx, &event("app-1")).await.unwrap(), 1);

    assert!(cluster.object("v1", "Pod", "default", "app-1").is_some());
    assert!(recorder.notices()[0].2.ends_with("(dry run)"));
}

#[tokio::test]
async fn test_debug_twice_attaches_one_container() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert("v1", "Pod", "default", "app-1", pod_body());
    let recorder = Arc::new(RecordingRecorder::default());
    let policy = policy("inspect", "HighCPU", vec![debug_pod("inspect", "{{ data.pod }}")]);
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder.clone(), policy);

    assert_eq!(runner.run(&ctx, &event("app-1")).await.unwrap(), 1);
    assert_eq!(runner.run(&ctx, &event("app-1")).await.unwrap(), 0);

    let pod = cluster.object("v1", "Pod", "default", "app-1").unwrap();
    let containers = pod.data["spec"]["ephemeralContainers"].as_array().unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0]["name"], "debugger");
    assert_eq!(containers[0]["image"], "busybox:1.36");
    assert_eq!(containers[0]["targetContainerName"], "app");
    assert_eq!(cluster.count("update"), 1);
    assert_eq!(recorder.count(REASON_ACTION_TAKEN), 1);
}

#[tokio::test]
async fn test_first_failure_stops_remaining_actions() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert("v1", "Pod", "default", "app-1", pod_body());
    let recorder = Arc::new(RecordingRecorder::default());
    let policy = policy(
        "scale-then-evict",
        "HighCPU",
        vec![
            patch_deployment("scale", "missing", "spec:\n  replicas: 2\n"),
            delete_pod("evict", "{{ data.pod }}"),
        ],
    );
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder.clone(), policy);

    let err = runner.run(&ctx, &event("app-1")).await.unwrap_err();

    assert!(matches!(err, Error::TargetNotFound { .. }));
    assert_eq!(cluster.count("delete"), 0);
    assert!(cluster.object("v1", "Pod", "default", "app-1").is_some());
    assert_eq!(ctx.metrics.error_count("default", "patch"), 1);
    assert_eq!(ctx.metrics.taken_count("default", "delete"), 0);

    let notices = recorder.notices();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].0, NoticeType::Warning);
    assert_eq!(notices[0].1, REASON_ACTION_FAILED);
    assert!(notices[0].2.starts_with("scale: "));
}

#[tokio::test]
async fn test_patch_template_sees_event_and_target() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert(
        "apps/v1",
        "Deployment",
        "default",
        "web",
        json!({"spec": {"replicas": 3}}),
    );
    let recorder = Arc::new(RecordingRecorder::default());
    let template = "metadata:\n  annotations:\n    remediated-for: \"{{ event.name }}\"\n    replicas-before: \"{{ target.spec.replicas }}\"\n";
    let policy = policy("annotate", "HighCPU", vec![patch_deployment("annotate", "web", template)]);
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder.clone(), policy);

    assert_eq!(runner.run(&ctx, &event("app-1")).await.unwrap(), 1);

    assert_eq!(
        cluster.patches(),
        vec![PatchDocument::Merge(json!({
            "metadata": {
                "annotations": {
                    "remediated-for": "HighCPU",
                    "replicas-before": "3"
                }
            }
        }))]
    );
}

#[tokio::test]
async fn test_label_value_cannot_reshape_patch() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert("apps/v1", "Deployment", "default", "web", json!({"spec": {"replicas": 3}}));
    let recorder = Arc::new(RecordingRecorder::default());
    let template = "metadata:\n  annotations:\n    reason: \"{{ data.summary }}\"\n";
    let policy = policy("annotate", "HighCPU", vec![patch_deployment("annotate", "web", template)]);
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder, policy);

    let mut alert = event("app-1");
    alert
        .data
        .insert("summary".to_string(), "cpu\nspec:\n  replicas: 0".to_string());
    assert_eq!(runner.run(&ctx, &alert).await.unwrap(), 1);

    assert_eq!(
        cluster.patches(),
        vec![PatchDocument::Merge(json!({
            "metadata": {"annotations": {"reason": "cpu\nspec:\n  replicas: 0"}}
        }))]
    );
}

#[tokio::test]
async fn test_malformed_target_name_never_reaches_cluster() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert("v1", "Pod", "default", "app-1", pod_body());
    let recorder = Arc::new(RecordingRecorder::default());
    let policy = policy("evict", "HighCPU", vec![delete_pod("evict", "{{ data.pod }}")]);
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder.clone(), policy);

    for pod in ["app-1\nother", "App-1", "../app-1"] {
        let err = runner.run(&ctx, &event(pod)).await.unwrap_err();
        assert!(matches!(err, Error::TemplateError(_)), "{pod}");
    }

    assert!(cluster.calls().is_empty());
    assert!(cluster.object("v1", "Pod", "default", "app-1").is_some());
    assert_eq!(recorder.count(REASON_ACTION_FAILED), 3);
}

#[tokio::test]
async fn test_restart_stamps_pod_template() {
    let cluster = Arc::new(FakeCluster::new());
    cluster.insert("apps/v1", "Deployment", "default", "web", json!({"spec": {}}));
    let recorder = Arc::new(RecordingRecorder::default());
    let restart = ActionSpec {
        name: "roll".to_string(),
        restart: Some(RestartSpec {
            namespace: "default".to_string(),
            deployment_name: "web".to_string(),
        }),
        ..ActionSpec::default()
    };
    let policy = policy("roll", "HighCPU", vec![restart]);
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder.clone(), policy);

    assert_eq!(runner.run(&ctx, &event("app-1")).await.unwrap(), 1);

    let patches = cluster.patches();
    let PatchDocument::Strategic(body) = &patches[0] else {
        panic!("expected a strategic merge patch, got {patches:?}");
    };
    assert!(body["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION].is_string());
    assert_eq!(recorder.notices()[0].2, "roll: restart Deployment default/web");
}

#[tokio::test]
async fn test_on_detection_signals_done() {
    let cluster = Arc::new(FakeCluster::new());
    let recorder = Arc::new(RecordingRecorder::default());
    let policy = policy("evict", "HighCPU", vec![delete_pod("evict", "{{ data.pod }}")]);
    let runner = ActionRunner::from_spec(&policy.spec).unwrap();
    let ctx = context(cluster.clone(), recorder, policy);

    let done = runner.on_detection(ctx, event("app-1"));
    let _ = done.await;

    assert_eq!(cluster.count("delete"), 1);
}
