//! Deterministic (namespace, name) of every managed resource.
//!
//! Pure and total; the store enforces name length limits at apply time.

#![forbid(unsafe_code)]

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

/// Deployment, Service, IngressRoute and PodDisruptionBudget.
pub const ATOM: &str = "atom";
/// ConfigMap base name (before the content-hash suffix).
pub const GENERATOR: &str = "atom-generator";
pub const CORS_HEADERS: &str = "atom-cors-headers";
pub const PREFIX_STRIP: &str = "atom-prefix-strip";
/// Stem shared by the numbered download rewrite middlewares.
pub const DOWNLOADS: &str = "atom-downloads";

/// Suffix of the `index`-th download rewrite middleware.
pub fn downloads(index: usize) -> String {
    format!("{}-{}", DOWNLOADS, index)
}

pub fn bare_name<O: Resource>(owner: &O, suffix: &str) -> String {
    format!("{}-{}", owner.name_any(), suffix)
}

pub fn bare_meta<O: Resource>(owner: &O, suffix: &str) -> ObjectMeta {
    ObjectMeta { name: Some(bare_name(owner, suffix)), namespace: owner.namespace(), ..ObjectMeta::default() }
}

/// An empty object of kind `K` carrying only its identity.
pub fn bare<O: Resource, K: Resource + Default>(owner: &O, suffix: &str) -> K {
    let mut obj = K::default();
    *obj.meta_mut() = bare_meta(owner, suffix);
    obj
}
