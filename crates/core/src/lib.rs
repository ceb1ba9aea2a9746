//! kmut core types: object identity, mutation verbs, and the store contract.

#![forbid(unsafe_code)]

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject, Resource, TypeMeta};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Namespace/name identity of a stored object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    /// `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    pub fn namespaced(namespace: &str, name: &str) -> Self {
        Self::new(Some(namespace), name)
    }

    /// Identity carried by `meta`; `None` when the name is missing or empty.
    pub fn from_meta(meta: &ObjectMeta) -> Option<Self> {
        let name = meta.name.as_deref().filter(|n| !n.is_empty())?;
        let namespace = meta.namespace.as_deref().filter(|n| !n.is_empty());
        Some(Self::new(namespace, name))
    }

    pub fn of<K: Resource>(obj: &K) -> Option<Self> {
        Self::from_meta(obj.meta())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// What a mutation call actually did.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Verb {
    Unchanged,
    Created,
    Patched,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Unchanged => "unchanged",
            Verb::Created => "created",
            Verb::Patched => "patched",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed classification of store failures.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound(_)) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict(_)) }
    /// Transient failure other than a version conflict.
    pub fn is_retryable(&self) -> bool { matches!(self, StoreError::Retryable(_)) }
}

/// A stored resource the mutation protocol can build from scratch and whose
/// status it can read and replace.
pub trait Object: Resource + Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    type Status: Clone + Default + PartialEq + Send + Sync + 'static;

    /// Object with only its type identity populated.
    fn blank(dyntype: &Self::DynamicType) -> Self;

    fn status(&self) -> Option<&Self::Status>;

    fn set_status(&mut self, status: Self::Status);
}

impl Object for DynamicObject {
    type Status = serde_json::Value;

    fn blank(ar: &ApiResource) -> Self {
        DynamicObject {
            types: Some(TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() }),
            metadata: ObjectMeta::default(),
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    fn status(&self) -> Option<&serde_json::Value> {
        self.data.get("status")
    }

    fn set_status(&mut self, status: serde_json::Value) {
        if !self.data.is_object() {
            self.data = serde_json::Value::Object(serde_json::Map::new());
        }
        if let Some(map) = self.data.as_object_mut() {
            map.insert("status".to_string(), status);
        }
    }
}

/// Remote versioned store as seen by the mutation protocol.
///
/// `update` and `update_status` must reject objects whose `resourceVersion`
/// is stale with [`StoreError::Conflict`].
#[async_trait]
pub trait ObjectStore<K: Object>: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError>;
    async fn create(&self, obj: &K) -> Result<K, StoreError>;
    /// Apply an RFC 7386 merge patch to the object named by `key`.
    async fn patch(&self, key: &ObjectKey, merge_patch: &[u8]) -> Result<K, StoreError>;
    async fn update(&self, obj: &K) -> Result<K, StoreError>;
    /// Write through the status subresource.
    async fn update_status(&self, obj: &K) -> Result<K, StoreError>;
}

pub mod prelude {
    pub use super::{Object, ObjectKey, ObjectStore, StoreError, Verb};
}
