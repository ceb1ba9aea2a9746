//! kmut mutation protocol.
//!
//! [`Mutator`] turns a caller-supplied transform into the smallest write the
//! store needs: a create when the object is absent, nothing when the
//! transform is a no-op, a JSON merge patch otherwise. [`Mutator::try_update`]
//! and the subresource path of [`Mutator::update_status`] absorb version
//! conflicts by re-reading and reapplying within a bounded [`RetryConfig`].
//!
//! Transforms always receive an owned value. The caller's `current` is never
//! handed to a transform, so it stays valid for comparison and retries.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kmut_core::{Object, ObjectKey, ObjectStore, StoreError, Verb};
use kmut_patch::{canonical, create_merge_patch, is_empty_patch, PatchError};
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

mod retry;
mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use retry::{RetryConfig, DEFAULT_RETRY_INTERVAL, DEFAULT_RETRY_TIMEOUT};
pub use status::StatusMode;

use retry::Poller;

/// Why a bounded retry loop gave up.
#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("timed out waiting for the condition")]
    Timeout { last: Option<StoreError> },
    #[error(transparent)]
    Aborted(StoreError),
}

impl PollError {
    /// The store error that ended the loop, or the last one seen before the deadline.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            PollError::Timeout { last } => last.as_ref(),
            PollError::Aborted(e) => Some(e),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to update {kind} {key} after {attempts} attempts due to {cause}")]
    UpdateFailed { kind: String, key: ObjectKey, attempts: u32, cause: PollError },
    #[error("failed to update status of {kind} {key} after {attempts} attempts due to {cause}")]
    StatusUpdateFailed { kind: String, key: ObjectKey, attempts: u32, cause: PollError },
}

impl Error {
    /// Underlying store error, if any, looking through retry wrappers.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Error::Store(e) => Some(e),
            Error::UpdateFailed { cause, .. } | Error::StatusUpdateFailed { cause, .. } => cause.store_error(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.store_error().map(StoreError::is_not_found).unwrap_or(false)
    }

    /// Attempts made before a retry loop gave up.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Error::UpdateFailed { attempts, .. } | Error::StatusUpdateFailed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Mutation protocol bound to one resource type and one store.
pub struct Mutator<K: Object, S> {
    store: S,
    dyntype: K::DynamicType,
    retry: RetryConfig,
}

impl<K, S> Mutator<K, S>
where
    K: Object,
    K::DynamicType: Default,
    S: ObjectStore<K>,
{
    pub fn new(store: S, retry: RetryConfig) -> Self {
        Self::with_dyntype(store, K::DynamicType::default(), retry)
    }
}

impl<K, S> Mutator<K, S>
where
    K: Object,
    S: ObjectStore<K>,
{
    pub fn with_dyntype(store: S, dyntype: K::DynamicType, retry: RetryConfig) -> Self {
        Self { store, dyntype, retry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn kind(&self) -> String {
        K::kind(&self.dyntype).into_owned()
    }

    fn key_from_meta(&self, meta: &ObjectMeta) -> Result<ObjectKey> {
        ObjectKey::from_meta(meta).ok_or_else(|| Error::InvalidArgument(format!("{} metadata.name is required", self.kind())))
    }

    fn key_of(&self, obj: &K) -> Result<ObjectKey> {
        ObjectKey::of(obj).ok_or_else(|| Error::InvalidArgument(format!("{} object has no metadata.name", self.kind())))
    }

    fn record(&self, verb: Verb) {
        counter!("mutate_verb_total", 1, "kind" => self.kind(), "verb" => verb.as_str());
    }

    /// Create the object named by `meta` if it does not exist, otherwise
    /// patch it with whatever `transform` changes.
    ///
    /// On create, `transform` receives a blank object carrying `meta`. Issues
    /// at most one write and never retries.
    pub async fn create_or_patch<F>(&self, meta: ObjectMeta, transform: F) -> Result<(K, Verb)>
    where
        F: FnOnce(K) -> K + Send,
    {
        let key = self.key_from_meta(&meta)?;
        match self.store.get(&key).await {
            Ok(cur) => self.patch(&cur, transform).await,
            Err(StoreError::NotFound(_)) => {
                info!(kind = %self.kind(), key = %key, "creating");
                let mut blank = K::blank(&self.dyntype);
                *blank.meta_mut() = meta;
                let out = self.store.create(&transform(blank)).await?;
                self.record(Verb::Created);
                Ok((out, Verb::Created))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Patch `current` with the changes `transform` makes to a copy of it.
    pub async fn patch<F>(&self, current: &K, transform: F) -> Result<(K, Verb)>
    where
        F: FnOnce(K) -> K + Send,
    {
        let modified = transform(current.clone());
        self.patch_object(current, &modified).await
    }

    /// Send the merge patch from `current` to `modified`, or nothing when
    /// they encode identically.
    pub async fn patch_object(&self, current: &K, modified: &K) -> Result<(K, Verb)> {
        let cur = canonical(current)?;
        let modi = canonical(modified)?;
        let patch = create_merge_patch(&cur, &modi)?;
        if is_empty_patch(&patch) {
            debug!(kind = %self.kind(), key = ?ObjectKey::of(current), "no changes; skipping patch");
            self.record(Verb::Unchanged);
            return Ok((current.clone(), Verb::Unchanged));
        }
        let key = self.key_of(current)?;
        info!(kind = %self.kind(), key = %key, "patching");
        debug!(patch = %String::from_utf8_lossy(&patch), "merge patch body");
        let out = self.store.patch(&key, &patch).await?;
        self.record(Verb::Patched);
        Ok((out, Verb::Patched))
    }

    /// Read-modify-write with conflict retry.
    ///
    /// Every attempt fetches the latest object and applies `transform` to
    /// it, so a concurrent writer's changes are never overwritten with stale
    /// data. A missing object ends the loop at once; every other read or
    /// write failure goes back to the fetch until the timeout.
    pub async fn try_update<F>(&self, meta: &ObjectMeta, transform: F) -> Result<K>
    where
        F: Fn(K) -> K + Send + Sync,
    {
        let key = self.key_from_meta(meta)?;
        let mut poll = Poller::start(&self.retry).await;
        let outcome = loop {
            let attempt = poll.attempt();
            let failed = match self.store.get(&key).await {
                Err(e @ StoreError::NotFound(_)) => break Err(PollError::Aborted(e)),
                Err(e) => e,
                // The fetched value is ours alone; hand it straight to the transform
                Ok(cur) => match self.store.update(&transform(cur)).await {
                    Ok(out) => break Ok(out),
                    Err(e) => e,
                },
            };
            warn!(attempt, kind = %self.kind(), key = %key, error = %failed, "update attempt failed");
            if !poll.tick().await {
                break Err(PollError::Timeout { last: Some(failed) });
            }
        };
        histogram!("mutate_update_attempts", poll.attempts() as f64);
        outcome.map_err(|cause| {
            counter!("mutate_update_failed_total", 1, "kind" => self.kind());
            Error::UpdateFailed { kind: self.kind(), key, attempts: poll.attempts(), cause }
        })
    }
}
