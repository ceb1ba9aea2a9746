//! In-memory versioned store for exercising the protocol without a cluster.
//!
//! Objects are kept as JSON. Every write bumps `metadata.resourceVersion`;
//! `update` and `update_status` reject stale versions with a conflict, the
//! same way the API server does. Failures and concurrent writers can be
//! scripted per call.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use kmut_core::{Object, ObjectKey, ObjectStore, StoreError};
use serde_json::Value as Json;

/// Number of calls the store has served, by operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Calls {
    pub get: usize,
    pub create: usize,
    pub patch: usize,
    pub update: usize,
    pub update_status: usize,
}

impl Calls {
    pub fn writes(&self) -> usize {
        self.create + self.patch + self.update + self.update_status
    }

    pub fn total(&self) -> usize {
        self.get + self.writes()
    }
}

type Writer = Arc<dyn Fn(&mut Json) + Send + Sync>;

#[derive(Default)]
struct Inner {
    objects: HashMap<ObjectKey, Json>,
    next_rv: u64,
    calls: Calls,
    get_errors: VecDeque<StoreError>,
    update_errors: VecDeque<StoreError>,
    status_errors: VecDeque<StoreError>,
    /// Concurrent writer that lands just before our next `n` writes.
    interference: Option<(usize, Writer)>,
    patches: Vec<Json>,
}

impl Inner {
    fn bump(&mut self, obj: &mut Json) {
        self.next_rv += 1;
        obj["metadata"]["resourceVersion"] = Json::String(self.next_rv.to_string());
    }

    fn interfere(&mut self, key: &ObjectKey) {
        let writer = match self.interference.as_mut() {
            Some((n, w)) if *n > 0 => {
                *n -= 1;
                w.clone()
            }
            _ => return,
        };
        if let Some(mut stored) = self.objects.remove(key) {
            writer(&mut stored);
            self.bump(&mut stored);
            self.objects.insert(key.clone(), stored);
        }
    }

    fn check_version(&self, key: &ObjectKey, sent: &Json) -> Result<(), StoreError> {
        let stored = self.objects.get(key).ok_or_else(|| StoreError::NotFound(format!("{} not found", key)))?;
        let have = stored["metadata"]["resourceVersion"].as_str().unwrap_or("");
        let want = sent["metadata"]["resourceVersion"].as_str().unwrap_or("");
        if have != want {
            return Err(StoreError::Conflict(format!(
                "the object {} has been modified (resourceVersion {} != {})",
                key, want, have
            )));
        }
        Ok(())
    }
}

/// Cheaply cloneable handle; clones share state.
#[derive(Clone, Default)]
pub struct MemStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an object, assigning it a fresh resource version.
    pub fn insert<K: Object>(&self, obj: &K) -> K {
        let key = ObjectKey::of(obj).expect("seeded object needs a name");
        let mut v = serde_json::to_value(obj).expect("encode seed");
        let mut inner = self.inner.lock().unwrap();
        inner.bump(&mut v);
        inner.objects.insert(key, v.clone());
        serde_json::from_value(v).expect("decode seed")
    }

    /// Current stored state, bypassing call accounting.
    pub fn stored<K: Object>(&self, key: &ObjectKey) -> Option<K> {
        let inner = self.inner.lock().unwrap();
        inner.objects.get(key).cloned().map(|v| serde_json::from_value(v).expect("decode stored"))
    }

    pub fn calls(&self) -> Calls {
        self.inner.lock().unwrap().calls
    }

    /// Merge patches received so far, in order.
    pub fn patches(&self) -> Vec<Json> {
        self.inner.lock().unwrap().patches.clone()
    }

    pub fn fail_gets(&self, errs: impl IntoIterator<Item = StoreError>) {
        self.inner.lock().unwrap().get_errors.extend(errs);
    }

    pub fn fail_updates(&self, errs: impl IntoIterator<Item = StoreError>) {
        self.inner.lock().unwrap().update_errors.extend(errs);
    }

    pub fn fail_status_updates(&self, errs: impl IntoIterator<Item = StoreError>) {
        self.inner.lock().unwrap().status_errors.extend(errs);
    }

    /// Let another writer modify the stored object right before each of our
    /// next `times` update/update_status calls, making them stale.
    pub fn interfere(&self, times: usize, writer: impl Fn(&mut Json) + Send + Sync + 'static) {
        self.inner.lock().unwrap().interference = Some((times, Arc::new(writer)));
    }

    fn decode<K: Object>(v: Json) -> Result<K, StoreError> {
        serde_json::from_value(v).map_err(|e| StoreError::Fatal(format!("decoding stored object: {}", e)))
    }

    fn encode<K: Object>(obj: &K) -> Result<(ObjectKey, Json), StoreError> {
        let key = ObjectKey::of(obj).ok_or_else(|| StoreError::Fatal("object missing metadata.name".into()))?;
        let v = serde_json::to_value(obj).map_err(|e| StoreError::Fatal(format!("encoding object: {}", e)))?;
        Ok((key, v))
    }
}

#[async_trait]
impl<K: Object> ObjectStore<K> for MemStore {
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        let stored = {
            let mut inner = self.inner.lock().unwrap();
            inner.calls.get += 1;
            if let Some(e) = inner.get_errors.pop_front() {
                return Err(e);
            }
            inner.objects.get(key).cloned()
        };
        match stored {
            Some(v) => Self::decode(v),
            None => Err(StoreError::NotFound(format!("{} not found", key))),
        }
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let (key, mut v) = Self::encode(obj)?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.create += 1;
        if inner.objects.contains_key(&key) {
            return Err(StoreError::Fatal(format!("{} already exists", key)));
        }
        inner.bump(&mut v);
        inner.objects.insert(key, v.clone());
        drop(inner);
        Self::decode(v)
    }

    async fn patch(&self, key: &ObjectKey, merge_patch: &[u8]) -> Result<K, StoreError> {
        let patch: Json = serde_json::from_slice(merge_patch)
            .map_err(|e| StoreError::Fatal(format!("invalid merge patch: {}", e)))?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.patch += 1;
        inner.patches.push(patch.clone());
        let mut v = inner
            .objects
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(format!("{} not found", key)))?;
        json_patch::merge(&mut v, &patch);
        inner.bump(&mut v);
        inner.objects.insert(key.clone(), v.clone());
        drop(inner);
        Self::decode(v)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let (key, mut v) = Self::encode(obj)?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.update += 1;
        if let Some(e) = inner.update_errors.pop_front() {
            return Err(e);
        }
        inner.interfere(&key);
        inner.check_version(&key, &v)?;
        inner.bump(&mut v);
        inner.objects.insert(key, v.clone());
        drop(inner);
        Self::decode(v)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let (key, sent) = Self::encode(obj)?;
        let mut inner = self.inner.lock().unwrap();
        inner.calls.update_status += 1;
        if let Some(e) = inner.status_errors.pop_front() {
            return Err(e);
        }
        inner.interfere(&key);
        inner.check_version(&key, &sent)?;
        // Only status is taken from the request
        let mut v = inner.objects.remove(&key).unwrap_or_default();
        match sent.get("status") {
            Some(status) => v["status"] = status.clone(),
            None => {
                if let Some(map) = v.as_object_mut() {
                    map.remove("status");
                }
            }
        }
        inner.bump(&mut v);
        inner.objects.insert(key, v.clone());
        drop(inner);
        Self::decode(v)
    }
}
