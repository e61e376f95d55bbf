//! Ownership labels: projected from the owner once, never rewritten afterwards.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use atom_core::{APP_LABEL, APP_LABEL_VALUE};
use atom_kubehub::{kind_of, Managed};
use kube::{Resource, ResourceExt};

use crate::ApplyError;

/// Owner labels plus `app: atom-service`.
pub fn owner_labels<O: Resource>(owner: &O) -> BTreeMap<String, String> {
    let mut labels = owner.labels().clone();
    labels.insert(APP_LABEL.to_string(), APP_LABEL_VALUE.to_string());
    labels
}

/// Set `desired` on an unpersisted, unlabelled object; otherwise require equality.
pub fn enforce<K: Managed>(obj: &mut K, desired: &BTreeMap<String, String>) -> Result<(), ApplyError> {
    let meta = obj.meta_mut();
    let current = meta.labels.clone().unwrap_or_default();
    if meta.resource_version.is_none() && current.is_empty() {
        meta.labels = if desired.is_empty() { None } else { Some(desired.clone()) };
        return Ok(());
    }
    if &current != desired {
        return Err(ApplyError::LabelsImmutable {
            kind: kind_of::<K>(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            current,
            desired: desired.clone(),
        });
    }
    Ok(())
}
