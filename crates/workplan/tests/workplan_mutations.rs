use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kmut_core::{ObjectKey, StoreError, Verb};
use kmut_mutate::testing::MemStore;
use kmut_mutate::{Error, Mutator, RetryConfig};
use kmut_workplan::*;

fn meta(name: &str) -> ObjectMeta {
    ObjectMeta { name: Some(name.into()), namespace: Some("ci".into()), ..Default::default() }
}

fn mutator(store: &MemStore) -> Mutator<Workplan, MemStore> {
    Mutator::new(store.clone(), RetryConfig::new(Duration::from_millis(5), Duration::from_millis(300)))
}

fn seeded(store: &MemStore) -> Workplan {
    let mut wp = Workplan::new("wp-1", WorkplanSpec { workflow: "build".into(), ..Default::default() });
    wp.metadata.namespace = Some("ci".into());
    wp.status = Some(WorkplanStatus::default());
    store.insert(&wp)
}

#[tokio::test]
async fn create_then_patch_then_unchanged() {
    let store = MemStore::new();
    let m = mutator(&store);
    let set_workflow = |mut wp: Workplan| {
        wp.spec.workflow = "build".into();
        wp
    };

    let (wp, verb) = create_or_patch_workplan(&m, meta("wp-1"), set_workflow).await.unwrap();
    assert_eq!(verb, Verb::Created);
    assert_eq!(wp.spec.workflow, "build");

    let (wp, verb) = create_or_patch_workplan(&m, meta("wp-1"), |mut wp: Workplan| {
        wp.spec.tasks.push(Task { name: "test".into(), image: "rust:1".into(), commands: vec!["cargo test".into()] });
        wp
    })
    .await
    .unwrap();
    assert_eq!(verb, Verb::Patched);
    assert_eq!(wp.spec.tasks.len(), 1);

    let (_, verb) = create_or_patch_workplan(&m, meta("wp-1"), set_workflow).await.unwrap();
    assert_eq!(verb, Verb::Unchanged);

    let calls = store.calls();
    assert_eq!(calls.create, 1);
    assert_eq!(calls.patch, 1);
}

#[tokio::test]
async fn patch_object_sends_minimal_patch() {
    let store = MemStore::new();
    let cur = seeded(&store);
    let m = mutator(&store);
    let mut modified = cur.clone();
    modified.spec.triggered_for = Some(TriggeredFor { kind: "Secret".into(), name: "creds".into(), resource_version: None });
    let (_, verb) = patch_workplan_object(&m, &cur, &modified).await.unwrap();
    assert_eq!(verb, Verb::Patched);
    assert_eq!(
        store.patches(),
        vec![serde_json::json!({ "spec": { "triggeredFor": { "kind": "Secret", "name": "creds" } } })]
    );
}

#[tokio::test]
async fn patch_workplan_with_identity_transform_is_noop() {
    let store = MemStore::new();
    let cur = seeded(&store);
    let m = mutator(&store);
    let (out, verb) = patch_workplan(&m, &cur, |wp| wp).await.unwrap();
    assert_eq!(verb, Verb::Unchanged);
    assert_eq!(out.metadata.resource_version, cur.metadata.resource_version);
    assert_eq!(store.calls().writes(), 0);
}

#[tokio::test]
async fn try_update_keeps_concurrent_label() {
    let store = MemStore::new();
    seeded(&store);
    store.interfere(1, |o| o["metadata"]["labels"] = serde_json::json!({ "owner": "controller" }));
    let m = mutator(&store);
    let out = try_update_workplan(&m, &meta("wp-1"), |mut wp| {
        wp.spec.workflow = "release".into();
        wp
    })
    .await
    .unwrap();
    assert_eq!(out.spec.workflow, "release");
    assert_eq!(out.metadata.labels.unwrap()["owner"], "controller");
}

#[tokio::test]
async fn status_merge_patch_is_default() {
    let store = MemStore::new();
    let cur = seeded(&store);
    let m = mutator(&store);
    let out = update_workplan_status(&m, &cur, |s| s.running(1), &[]).await.unwrap();
    assert_eq!(out.status.unwrap().phase, Some(WorkplanPhase::Running));
    assert_eq!(store.calls().patch, 1);
    assert_eq!(store.calls().update_status, 0);
    let patch = &store.patches()[0];
    assert!(patch.get("spec").is_none());
    assert_eq!(patch["status"]["phase"], "Running");
}

#[tokio::test]
async fn status_identity_on_fresh_workplan_writes_nothing() {
    let store = MemStore::new();
    let mut wp = Workplan::new("wp-2", WorkplanSpec { workflow: "build".into(), ..Default::default() });
    wp.metadata.namespace = Some("ci".into());
    let cur = store.insert(&wp);
    assert!(cur.status.is_none());
    let m = mutator(&store);
    let out = update_workplan_status(&m, &cur, |s| s, &[]).await.unwrap();
    assert_eq!(store.calls().writes(), 0);
    assert!(out.status.is_none());
}

#[tokio::test]
async fn status_subresource_survives_conflict() {
    let store = MemStore::new();
    let cur = seeded(&store);
    store.interfere(1, |o| o["spec"]["workflow"] = serde_json::json!("nightly"));
    let m = mutator(&store);
    let out = update_workplan_status(&m, &cur, |s| s.failed("timeout"), &[true]).await.unwrap();
    let status = out.status.unwrap();
    assert_eq!(status.phase, Some(WorkplanPhase::Failed));
    assert_eq!(status.reason.as_deref(), Some("timeout"));
    assert_eq!(out.spec.workflow, "nightly");
    assert_eq!(store.calls().update_status, 2);
}

#[tokio::test]
async fn status_rejects_multiple_flags() {
    let store = MemStore::new();
    let cur = seeded(&store);
    let before = store.calls();
    let m = mutator(&store);
    let err = update_workplan_status(&m, &cur, |s| s.succeeded(), &[false, true]).await.unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
    assert_eq!(store.calls(), before);
}

#[tokio::test]
async fn try_update_on_missing_workplan_reports_identity() {
    let store = MemStore::new();
    let m = mutator(&store);
    let err = try_update_workplan(&m, &meta("absent"), |wp| wp).await.unwrap_err();
    assert!(matches!(err.store_error(), Some(StoreError::NotFound(_))));
    let msg = err.to_string();
    assert!(msg.contains("Workplan ci/absent"), "msg={}", msg);
    assert!(store.stored::<Workplan>(&ObjectKey::namespaced("ci", "absent")).is_none());
}
