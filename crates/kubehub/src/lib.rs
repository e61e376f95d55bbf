//! Atom kubehub – resource store interface and the kube-rs backed implementation

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;

use anyhow::{Context, Result};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    Client, Resource,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// Any namespaced kind the operator reads or writes.
pub trait Managed:
    Resource<DynamicType = (), Scope = NamespaceResourceScope> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> Managed for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// `Kind` of a managed type, e.g. `ConfigMap`.
pub fn kind_of<K: Managed>() -> String {
    K::kind(&()).into_owned()
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {kind} {namespace}/{name}")]
    NotFound { kind: String, namespace: String, name: String },
    #[error("already exists: {kind} {namespace}/{name}")]
    AlreadyExists { kind: String, namespace: String, name: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    /// Stale writes and transport failures go away on a later pass.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::AlreadyExists { .. } | StoreError::Transport(_))
    }
}

/// Namespace-scoped, optimistic-concurrency-checked object store.
///
/// `update` must carry the resourceVersion observed by the preceding `get`;
/// a stale version yields `StoreError::Conflict`.
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError>;
    async fn create<K: Managed>(&self, obj: &K) -> Result<K, StoreError>;
    async fn update<K: Managed>(&self, obj: &K) -> Result<K, StoreError>;
    /// Deleting an absent object is not an error.
    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<(), StoreError>;
    async fn list<K: Managed>(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError>;
    /// Replace the status sub-resource only.
    async fn update_status<K: Managed>(&self, obj: &K) -> Result<K, StoreError>;
}

/// Render a label map as an equality-based selector (`a=b,c=d`).
pub fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

fn object_name<K: Managed>(obj: &K) -> Result<(String, String), StoreError> {
    let meta = obj.meta();
    let name = meta.name.clone().ok_or_else(|| StoreError::Invalid(format!("{} missing metadata.name", kind_of::<K>())))?;
    let ns = meta
        .namespace
        .clone()
        .ok_or_else(|| StoreError::Invalid(format!("{} {} missing metadata.namespace", kind_of::<K>(), name)))?;
    Ok((ns, name))
}

fn map_kube_err<K: Managed>(e: kube::Error, namespace: &str, name: &str) -> StoreError {
    match e {
        kube::Error::Api(ae) => match ae.code {
            404 => StoreError::NotFound { kind: kind_of::<K>(), namespace: namespace.to_string(), name: name.to_string() },
            409 if ae.reason == "AlreadyExists" => {
                StoreError::AlreadyExists { kind: kind_of::<K>(), namespace: namespace.to_string(), name: name.to_string() }
            }
            409 => StoreError::Conflict(ae.message),
            400 | 422 => StoreError::Invalid(ae.message),
            _ => StoreError::Transport(format!("{} ({})", ae.message, ae.code)),
        },
        kube::Error::SerdeError(se) => StoreError::Serde(se),
        other => StoreError::Transport(other.to_string()),
    }
}

/// Store backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the in-cluster config or the current kubeconfig context.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("creating kube client")?;
        Ok(Self { client })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn api<K: Managed>(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ResourceStore for KubeStore {
    async fn get<K: Managed>(&self, namespace: &str, name: &str) -> Result<Option<K>, StoreError> {
        self.api::<K>(namespace).get_opt(name).await.map_err(|e| map_kube_err::<K>(e, namespace, name))
    }

    async fn create<K: Managed>(&self, obj: &K) -> Result<K, StoreError> {
        let (ns, name) = object_name(obj)?;
        debug!(kind = %kind_of::<K>(), ns = %ns, name = %name, "create");
        counter!("store_writes_total", 1u64);
        self.api::<K>(&ns).create(&PostParams::default(), obj).await.map_err(|e| map_kube_err::<K>(e, &ns, &name))
    }

    async fn update<K: Managed>(&self, obj: &K) -> Result<K, StoreError> {
        let (ns, name) = object_name(obj)?;
        debug!(kind = %kind_of::<K>(), ns = %ns, name = %name, rv = ?obj.meta().resource_version, "replace");
        counter!("store_writes_total", 1u64);
        self.api::<K>(&ns)
            .replace(&name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_kube_err::<K>(e, &ns, &name))
    }

    async fn delete<K: Managed>(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        debug!(kind = %kind_of::<K>(), ns = %namespace, name = %name, "delete");
        counter!("store_writes_total", 1u64);
        match self.api::<K>(namespace).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => match map_kube_err::<K>(e, namespace, name) {
                StoreError::NotFound { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn list<K: Managed>(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<K>, StoreError> {
        let lp = ListParams::default().labels(&selector_string(selector));
        let list = self.api::<K>(namespace).list(&lp).await.map_err(|e| map_kube_err::<K>(e, namespace, ""))?;
        Ok(list.items)
    }

    async fn update_status<K: Managed>(&self, obj: &K) -> Result<K, StoreError> {
        let (ns, name) = object_name(obj)?;
        debug!(kind = %kind_of::<K>(), ns = %ns, name = %name, "replace status");
        counter!("store_writes_total", 1u64);
        let body = serde_json::to_vec(obj)?;
        self.api::<K>(&ns)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| map_kube_err::<K>(e, &ns, &name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("{} happened", reason), reason: reason.into(), code })
    }

    #[test]
    fn selector_is_sorted_and_comma_joined() {
        let mut sel = BTreeMap::new();
        sel.insert("b".to_string(), "2".to_string());
        sel.insert("a".to_string(), "1".to_string());
        assert_eq!(selector_string(&sel), "a=1,b=2");
        assert_eq!(selector_string(&BTreeMap::new()), "");
    }

    #[test]
    fn api_errors_map_to_store_errors() {
        let e = map_kube_err::<ConfigMap>(api_err(404, "NotFound"), "ns", "x");
        assert!(e.is_not_found());
        let e = map_kube_err::<ConfigMap>(api_err(409, "AlreadyExists"), "ns", "x");
        assert!(matches!(e, StoreError::AlreadyExists { .. }));
        let e = map_kube_err::<ConfigMap>(api_err(409, "Conflict"), "ns", "x");
        assert!(matches!(e, StoreError::Conflict(_)));
        assert!(e.is_retryable());
        let e = map_kube_err::<ConfigMap>(api_err(422, "Invalid"), "ns", "x");
        assert!(matches!(e, StoreError::Invalid(_)));
        assert!(!e.is_retryable());
    }

    #[test]
    fn kind_of_uses_resource_kind() {
        assert_eq!(kind_of::<ConfigMap>(), "ConfigMap");
    }

    #[test]
    fn object_name_requires_namespace() {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some("x".into());
        assert!(matches!(object_name(&cm), Err(StoreError::Invalid(_))));
        cm.metadata.namespace = Some("ns".into());
        assert_eq!(object_name(&cm).unwrap(), ("ns".to_string(), "x".to_string()));
    }
}
