//! Status-only mutation.

use kmut_core::{Object, ObjectKey, ObjectStore, StoreError};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::retry::Poller;
use crate::{Error, Mutator, PollError, Result};

/// How status is written back.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum StatusMode {
    /// Merge patch of the whole object; works on every API version.
    #[default]
    MergePatch,
    /// Full replace through the status subresource, retrying conflicts.
    Subresource,
}

impl StatusMode {
    /// Interpret an optional use-subresource flag. Absent or `false` selects
    /// [`StatusMode::MergePatch`]; more than one value is rejected.
    pub fn from_flags(flags: &[bool]) -> Result<Self> {
        match flags {
            [] | [false] => Ok(StatusMode::MergePatch),
            [true] => Ok(StatusMode::Subresource),
            _ => Err(Error::InvalidArgument(format!("invalid value passed for use_subresource: {:?}", flags))),
        }
    }
}

impl<K, S> Mutator<K, S>
where
    K: Object,
    S: ObjectStore<K>,
{
    /// [`Mutator::update_status`] with the mode taken from raw flags. Bad
    /// flags fail before the store is contacted.
    pub async fn update_status_flags<F>(&self, current: &K, transform: F, use_subresource: &[bool]) -> Result<K>
    where
        F: Fn(K::Status) -> K::Status + Send + Sync,
    {
        let mode = StatusMode::from_flags(use_subresource)?;
        self.update_status(current, transform, mode).await
    }

    /// Replace the status of `current` with `transform(status)`, leaving
    /// everything else as the store has it.
    ///
    /// `transform` runs once, on a copy of `current`'s status (or the default
    /// when it has none); the result is reused when a conflict forces a
    /// re-read in [`StatusMode::Subresource`].
    pub async fn update_status<F>(&self, current: &K, transform: F, mode: StatusMode) -> Result<K>
    where
        F: Fn(K::Status) -> K::Status + Send + Sync,
    {
        let baseline = current.status().cloned().unwrap_or_default();
        let next = transform(baseline.clone());
        // An absent status left at its default stays absent
        let write_status = current.status().is_some() || next != baseline;
        let apply = |x: &K| -> K {
            let mut out = x.clone();
            if write_status {
                out.set_status(next.clone());
            }
            out
        };

        if mode == StatusMode::MergePatch {
            let (out, verb) = self.patch_object(current, &apply(current)).await?;
            debug!(kind = %self.kind(), key = ?ObjectKey::of(current), verb = %verb, "status merge patch");
            return Ok(out);
        }

        let key = self.key_of(current)?;
        let mut cur = current.clone();
        let mut poll = Poller::start(self.retry_config()).await;
        let outcome = loop {
            let attempt = poll.attempt();
            let failed = match self.store().update_status(&apply(&cur)).await {
                Ok(out) => break Ok(out),
                Err(e @ StoreError::Conflict(_)) => match self.store().get(&key).await {
                    Ok(latest) => {
                        cur = latest;
                        e
                    }
                    Err(e3) if e3.is_retryable() => e3,
                    Err(e3) => break Err(PollError::Aborted(e3)),
                },
                Err(e) if e.is_retryable() => e,
                Err(e) => break Err(PollError::Aborted(e)),
            };
            warn!(attempt, kind = %self.kind(), key = %key, error = %failed, "status update attempt failed");
            if !poll.tick().await {
                break Err(PollError::Timeout { last: Some(failed) });
            }
        };
        histogram!("mutate_status_attempts", poll.attempts() as f64);
        outcome.map_err(|cause| {
            counter!("mutate_status_failed_total", 1, "kind" => self.kind());
            Error::StatusUpdateFailed { kind: self.kind(), key, attempts: poll.attempts(), cause }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemStore;
    use crate::RetryConfig;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::core::{ApiResource, DynamicObject};
    use serde_json::{json, Value as Json};
    use std::time::Duration;

    fn ar() -> ApiResource {
        ApiResource {
            group: "engine.kube.ci".into(),
            version: "v1alpha1".into(),
            api_version: "engine.kube.ci/v1alpha1".into(),
            kind: "Workplan".into(),
            plural: "workplans".into(),
        }
    }

    fn workplan() -> DynamicObject {
        let mut obj = DynamicObject::blank(&ar());
        obj.metadata = ObjectMeta { name: Some("wp-1".into()), namespace: Some("ci".into()), ..Default::default() };
        obj.data = json!({
            "spec": { "workflow": "build" },
            "status": { "phase": "Pending", "taskIndex": 0 }
        });
        obj
    }

    fn mutator(store: &MemStore, timeout_ms: u64) -> Mutator<DynamicObject, MemStore> {
        Mutator::with_dyntype(store.clone(), ar(), RetryConfig::new(Duration::from_millis(5), Duration::from_millis(timeout_ms)))
    }

    fn running(mut s: Json) -> Json {
        s["phase"] = json!("Running");
        s
    }

    #[test]
    fn flags_select_mode() {
        assert_eq!(StatusMode::from_flags(&[]).unwrap(), StatusMode::MergePatch);
        assert_eq!(StatusMode::from_flags(&[false]).unwrap(), StatusMode::MergePatch);
        assert_eq!(StatusMode::from_flags(&[true]).unwrap(), StatusMode::Subresource);
        assert!(matches!(StatusMode::from_flags(&[true, true]), Err(Error::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn invalid_flags_make_no_calls() {
        let store = MemStore::new();
        let cur = store.insert(&workplan());
        let m = mutator(&store, 100);
        let err = m.update_status_flags(&cur, running, &[true, false]).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "err={:?}", err);
        assert_eq!(store.calls().total(), 0);
    }

    #[tokio::test]
    async fn merge_patch_mode_touches_only_status() {
        let store = MemStore::new();
        let mut cur = store.insert(&workplan());
        // Local spec edits must not leak into the status write
        cur.data["spec"]["workflow"] = json!("hijacked");
        let m = mutator(&store, 100);
        let out = m.update_status(&cur, running, StatusMode::MergePatch).await.unwrap();
        assert_eq!(store.patches(), vec![json!({ "status": { "phase": "Running" } })]);
        assert_eq!(store.calls().update_status, 0);
        assert_eq!(out.data["spec"]["workflow"], "build");
        assert_eq!(out.data["status"]["phase"], "Running");
    }

    #[tokio::test]
    async fn merge_patch_mode_noop_skips_write() {
        let store = MemStore::new();
        let cur = store.insert(&workplan());
        let m = mutator(&store, 100);
        m.update_status(&cur, |s| s, StatusMode::MergePatch).await.unwrap();
        assert_eq!(store.calls().writes(), 0);
    }

    fn statusless() -> DynamicObject {
        let mut obj = workplan();
        obj.data = json!({ "spec": { "workflow": "build" } });
        obj
    }

    #[tokio::test]
    async fn merge_patch_mode_keeps_missing_status_absent() {
        let store = MemStore::new();
        let cur = store.insert(&statusless());
        let m = mutator(&store, 100);
        let out = m.update_status(&cur, |s| s, StatusMode::MergePatch).await.unwrap();
        assert_eq!(store.calls().writes(), 0);
        assert!(store.patches().is_empty());
        assert!(out.data.get("status").is_none());
        assert_eq!(out.metadata.resource_version, cur.metadata.resource_version);
    }

    #[tokio::test]
    async fn merge_patch_mode_sets_status_on_statusless_object() {
        let store = MemStore::new();
        let cur = store.insert(&statusless());
        let m = mutator(&store, 100);
        m.update_status(&cur, running, StatusMode::MergePatch).await.unwrap();
        assert_eq!(store.patches(), vec![json!({ "status": { "phase": "Running" } })]);
    }

    #[tokio::test]
    async fn subresource_mode_keeps_missing_status_absent() {
        let store = MemStore::new();
        let cur = store.insert(&statusless());
        let m = mutator(&store, 100);
        let out = m.update_status(&cur, |s| s, StatusMode::Subresource).await.unwrap();
        assert_eq!(store.calls().update_status, 1);
        assert!(out.data.get("status").is_none(), "status={:?}", out.data.get("status"));
        let stored: DynamicObject = store.stored(&ObjectKey::namespaced("ci", "wp-1")).unwrap();
        assert!(stored.data.get("status").is_none());
    }

    #[tokio::test]
    async fn subresource_mode_refetches_on_conflict() {
        let store = MemStore::new();
        let cur = store.insert(&workplan());
        store.interfere(2, |o| o["spec"]["workflow"] = json!("release"));
        let m = mutator(&store, 500);
        let out = m.update_status(&cur, running, StatusMode::Subresource).await.unwrap();
        let calls = store.calls();
        assert_eq!(calls.update_status, 3);
        assert_eq!(calls.get, 2);
        assert_eq!(out.data["status"]["phase"], "Running");
        // Baseline is the caller's status, not the re-read one
        assert_eq!(out.data["status"]["taskIndex"], 0);
        assert_eq!(out.data["spec"]["workflow"], "release");
    }

    #[tokio::test]
    async fn subresource_mode_retries_transient_errors() {
        let store = MemStore::new();
        let cur = store.insert(&workplan());
        store.fail_status_updates([StoreError::Retryable("too many requests".into())]);
        let m = mutator(&store, 500);
        m.update_status(&cur, running, StatusMode::Subresource).await.unwrap();
        let calls = store.calls();
        assert_eq!(calls.update_status, 2);
        assert_eq!(calls.get, 0);
    }

    #[tokio::test]
    async fn subresource_mode_aborts_on_fatal_error() {
        let store = MemStore::new();
        let cur = store.insert(&workplan());
        store.fail_status_updates([StoreError::Fatal("forbidden".into())]);
        let m = mutator(&store, 500);
        let err = m.update_status(&cur, running, StatusMode::Subresource).await.unwrap_err();
        assert_eq!(err.attempts(), Some(1));
        assert!(err.to_string().starts_with("failed to update status of Workplan ci/wp-1 after 1 attempts"), "err={}", err);
    }

    #[tokio::test]
    async fn subresource_mode_aborts_when_refetch_fails() {
        let store = MemStore::new();
        let cur = store.insert(&workplan());
        store.fail_status_updates([StoreError::Conflict("stale".into())]);
        store.fail_gets([StoreError::NotFound("ci/wp-1".into())]);
        let m = mutator(&store, 500);
        let err = m.update_status(&cur, running, StatusMode::Subresource).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(store.calls().update_status, 1);
    }

    #[tokio::test]
    async fn subresource_mode_is_bounded() {
        let store = MemStore::new();
        let cur = store.insert(&workplan());
        store.interfere(usize::MAX, |o| o["metadata"]["labels"] = json!({ "bump": "x" }));
        let m = mutator(&store, 60);
        let started = std::time::Instant::now();
        let err = m.update_status(&cur, running, StatusMode::Subresource).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(60));
        let attempts = err.attempts().unwrap();
        assert!(attempts >= 2, "attempts={}", attempts);
        assert!(err.to_string().contains("ci/wp-1"));
        assert!(matches!(err.store_error(), Some(StoreError::Conflict(_))));
    }
}
