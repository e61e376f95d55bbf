//! Atom apply: naming, ownership and the idempotent get-or-create-else-update primitive.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use atom_core::OperationResult;
use atom_kubehub::{kind_of, Managed, ResourceStore, StoreError};
use kube::{Resource, ResourceExt};
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub mod hash;
pub mod identity;
pub mod labels;
pub mod owner;

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("labels of {kind} {namespace}/{name} are immutable: have {current:?}, want {desired:?}")]
    LabelsImmutable {
        kind: String,
        namespace: String,
        name: String,
        current: BTreeMap<String, String>,
        desired: BTreeMap<String, String>,
    },
    #[error("{kind} {namespace}/{name} carries hash {existing} but its content hashes to {computed}")]
    HashMismatch { kind: String, namespace: String, name: String, existing: String, computed: String },
    #[error("{kind} {namespace}/{name} is already controlled by {owner}")]
    OwnedByOther { kind: String, namespace: String, name: String, owner: String },
    #[error("{kind} {name} in namespace {namespace:?} cannot be owned from namespace {owner_namespace:?}")]
    CrossNamespaceOwner { kind: String, name: String, namespace: String, owner_namespace: String },
    #[error("owner {owner} has no uid yet")]
    OwnerIdentity { owner: String },
    #[error("{0}")]
    Mutate(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ApplyError {
    /// Immutability and ownership violations need a human; the rest heal on retry.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ApplyError::LabelsImmutable { .. }
                | ApplyError::HashMismatch { .. }
                | ApplyError::OwnedByOther { .. }
                | ApplyError::CrossNamespaceOwner { .. }
        )
    }
}

/// How the final object name is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameDiscipline {
    /// The bare name is used as-is.
    Fixed,
    /// The bare name is a base that receives a content-hash suffix.
    ContentHash,
}

#[derive(Debug, Clone)]
pub struct Applied<K> {
    pub object: K,
    pub result: OperationResult,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

/// Count added, changed and removed leaves between two JSON trees.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                let min_len = aa.len().min(bb.len());
                s.updates += (0..min_len).filter(|i| aa[*i] != bb[*i]).count();
                s.adds += aa.len().saturating_sub(bb.len());
                s.removes += bb.len().saturating_sub(aa.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

/// Converge one object: get the live copy (or start from `bare`), run `mutate`,
/// enforce labels, name, stamp ownership, then create or update. Writes nothing
/// when the mutated live object is identical to what is stored.
///
/// Every fetch error other than not-found is returned as a retryable store error.
pub async fn apply<S, O, K, F>(
    store: &S,
    owner: &O,
    bare: K,
    labels: &BTreeMap<String, String>,
    discipline: NameDiscipline,
    mutate: F,
) -> Result<Applied<K>, ApplyError>
where
    S: ResourceStore,
    O: Resource<DynamicType = ()> + Sync,
    K: Managed,
    F: Fn(&mut K) -> Result<(), ApplyError> + Send + Sync,
{
    let kind = kind_of::<K>();
    let mut desired = bare;
    mutate(&mut desired)?;
    labels::enforce(&mut desired, labels)?;
    if discipline == NameDiscipline::ContentHash {
        hash::name_by_content(&mut desired)?;
    }
    let namespace = desired.namespace().unwrap_or_default();
    let name = desired.name_any();

    let live = store.get::<K>(&namespace, &name).await?;
    match live {
        None => {
            owner::stamp(owner, &mut desired)?;
            let created = store.create(&desired).await?;
            debug!(kind = %kind, ns = %namespace, name = %name, "created");
            counter!("apply_created_total", 1u64);
            Ok(Applied { object: created, result: OperationResult::Created })
        }
        Some(live) => {
            if discipline == NameDiscipline::ContentHash {
                // The stored payload must still hash to the suffix it was created under.
                hash::name_by_content(&mut live.clone())?;
            }
            let before = serde_json::to_value(&live)?;
            let mut obj = live;
            mutate(&mut obj)?;
            labels::enforce(&mut obj, labels)?;
            if discipline == NameDiscipline::ContentHash {
                hash::name_by_content(&mut obj)?;
            }
            owner::stamp(owner, &mut obj)?;
            let after = serde_json::to_value(&obj)?;
            if after == before {
                counter!("apply_unchanged_total", 1u64);
                return Ok(Applied { object: obj, result: OperationResult::Unchanged });
            }
            let summary = diff_summary(&hash::canonical(&after)?, &hash::canonical(&before)?);
            debug!(kind = %kind, ns = %namespace, name = %name, adds = summary.adds, updates = summary.updates, removes = summary.removes, "updating drifted object");
            let updated = store.update(&obj).await?;
            counter!("apply_updated_total", 1u64);
            Ok(Applied { object: updated, result: OperationResult::Updated })
        }
    }
}
