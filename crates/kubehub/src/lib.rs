//! kmut kubehub: the API-server backed [`ObjectStore`] and client wiring.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client, Resource,
};
use kmut_core::{Object, ObjectKey, ObjectStore, StoreError};
use once_cell::sync::OnceCell;
use tracing::{debug, info};

static CLIENT: OnceCell<Client> = OnceCell::new();

/// Shared client built from the default kubeconfig / in-cluster config.
pub async fn get_kube_client() -> Result<Client> {
    if let Some(c) = CLIENT.get() {
        return Ok(c.clone());
    }
    let client = Client::try_default().await.context("building kube client")?;
    let _ = CLIENT.set(client.clone());
    Ok(client)
}

/// Map a kube client error onto the store taxonomy.
pub fn classify(err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(ae) => {
            let msg = if ae.message.is_empty() { err.to_string() } else { ae.message.clone() };
            match (ae.code, ae.reason.as_str()) {
                (_, "NotFound") | (404, _) => StoreError::NotFound(msg),
                // AlreadyExists shares 409 but is not a version conflict
                (_, "AlreadyExists") => StoreError::Fatal(msg),
                (_, "Conflict") | (409, _) => StoreError::Conflict(msg),
                (_, "ServerTimeout" | "Timeout" | "TooManyRequests" | "ServiceUnavailable")
                | (429 | 503 | 504, _) => StoreError::Retryable(msg),
                _ => StoreError::Fatal(msg),
            }
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) => StoreError::Retryable(err.to_string()),
        _ => StoreError::Fatal(err.to_string()),
    }
}

type ApiFor<K> = Box<dyn Fn(Option<&str>) -> Result<Api<K>, StoreError> + Send + Sync>;

/// [`ObjectStore`] over a `kube::Api<K>`.
pub struct KubeStore<K: Object> {
    api_for: ApiFor<K>,
}

impl<K> KubeStore<K>
where
    K: Object + Resource<Scope = NamespaceResourceScope>,
    K::DynamicType: Default,
{
    /// Store for a typed namespaced resource.
    pub fn namespaced(client: Client) -> Self {
        let api_for: ApiFor<K> = Box::new(move |ns| match ns {
            Some(ns) => Ok(Api::namespaced(client.clone(), ns)),
            None => Err(StoreError::Fatal("namespace required for namespaced kind".into())),
        });
        Self { api_for }
    }
}

impl KubeStore<DynamicObject> {
    /// Store for an untyped resource resolved through discovery.
    pub fn dynamic(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        let api_for: ApiFor<DynamicObject> = Box::new(move |ns| {
            if !namespaced {
                return Ok(Api::all_with(client.clone(), &ar));
            }
            match ns {
                Some(ns) => Ok(Api::namespaced_with(client.clone(), ns, &ar)),
                None => Err(StoreError::Fatal("namespace required for namespaced kind".into())),
            }
        });
        Self { api_for }
    }
}

impl<K: Object> KubeStore<K> {
    fn api(&self, key: &ObjectKey) -> Result<Api<K>, StoreError> {
        (self.api_for)(key.namespace.as_deref())
    }

    fn key_of(obj: &K) -> Result<ObjectKey, StoreError> {
        ObjectKey::of(obj).ok_or_else(|| StoreError::Fatal("object missing metadata.name".into()))
    }
}

#[async_trait]
impl<K: Object> ObjectStore<K> for KubeStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<K, StoreError> {
        self.api(key)?.get(&key.name).await.map_err(classify)
    }

    async fn create(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        self.api(&key)?.create(&PostParams::default(), obj).await.map_err(classify)
    }

    async fn patch(&self, key: &ObjectKey, merge_patch: &[u8]) -> Result<K, StoreError> {
        let body: serde_json::Value = serde_json::from_slice(merge_patch)
            .map_err(|e| StoreError::Fatal(format!("invalid merge patch: {}", e)))?;
        debug!(key = %key, "merge patch");
        self.api(key)?
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&body))
            .await
            .map_err(classify)
    }

    async fn update(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        self.api(&key)?.replace(&key.name, &PostParams::default(), obj).await.map_err(classify)
    }

    async fn update_status(&self, obj: &K) -> Result<K, StoreError> {
        let key = Self::key_of(obj)?;
        let data = serde_json::to_vec(obj).map_err(|e| StoreError::Fatal(format!("encoding object: {}", e)))?;
        debug!(key = %key, "replace status");
        self.api(&key)?
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(classify)
    }
}

/// Parse "v1/Kind" or "group/v1/Kind".
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: String::new(),
            version: version.to_string(),
            kind: kind.to_string(),
        }),
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

pub async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

/// Resolve `gvk_key` through discovery and build an untyped store for it.
pub async fn dynamic_store(gvk_key: &str) -> Result<(KubeStore<DynamicObject>, ApiResource, bool)> {
    let client = get_kube_client().await?;
    let gvk = parse_gvk_key(gvk_key)?;
    let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
    info!(gvk = %gvk_key, namespaced, "resolved api resource");
    Ok((KubeStore::dynamic(client, ar.clone(), namespaced), ar, namespaced))
}
