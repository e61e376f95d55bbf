//! Finalizer-gated cleanup of an `Atom`.
//!
//! A live owner always carries [`FINALIZER`]. Once the owner is marked for
//! deletion the cleanup hook runs; the token is only removed after the hook
//! succeeds, so a failing hook keeps the owner around for the next pass.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use atom_apply::hash::split_name;
use atom_apply::{identity, labels};
use atom_core::{Atom, FINALIZER};
use atom_kubehub::{ResourceStore, StoreError};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum CleanupError {
    #[error("cleanup of {kind} {name} failed: {source}")]
    Delete {
        kind: &'static str,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Work that must finish before the owner may disappear.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    async fn cleanup<S: ResourceStore>(&self, store: &S, atom: &Atom) -> Result<(), CleanupError>;
}

/// Deletes every config holder carrying the owner's labels, including ones
/// whose owner reference was lost and would escape garbage collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneConfigHolders;

#[async_trait]
impl CleanupHook for PruneConfigHolders {
    async fn cleanup<S: ResourceStore>(&self, store: &S, atom: &Atom) -> Result<(), CleanupError> {
        let namespace = atom.namespace().unwrap_or_default();
        let base = identity::bare_name(atom, identity::GENERATOR);
        let holders: Vec<ConfigMap> = store.list(&namespace, &labels::owner_labels(atom)).await?;
        for cm in holders {
            let name = cm.name_any();
            if split_name(&name).0 != base {
                continue;
            }
            store
                .delete::<ConfigMap>(&namespace, &name)
                .await
                .map_err(|source| CleanupError::Delete { kind: "ConfigMap", name: name.clone(), source })?;
            debug!(ns = %namespace, name = %name, "pruned config holder");
        }
        Ok(())
    }
}

pub fn has_token(atom: &Atom) -> bool {
    atom.finalizers().iter().any(|f| f == FINALIZER)
}

pub fn is_deleting(atom: &Atom) -> bool {
    atom.meta().deletion_timestamp.is_some()
}

/// Add the token to a live owner that lacks it. Returns the stored owner.
pub async fn ensure_token<S: ResourceStore>(store: &S, atom: Atom) -> Result<Atom, FinalizeError> {
    if has_token(&atom) || is_deleting(&atom) {
        return Ok(atom);
    }
    let mut with = atom;
    with.finalizers_mut().push(FINALIZER.to_string());
    let stored = store.update(&with).await.map_err(FinalizeError::Token)?;
    info!(ns = %stored.namespace().unwrap_or_default(), name = %stored.name_any(), "added finalizer");
    Ok(stored)
}

/// Run the hook and release the owner. A hook failure leaves the token in place.
pub async fn finalize<S: ResourceStore, H: CleanupHook>(store: &S, hook: &H, atom: Atom) -> Result<(), FinalizeError> {
    if !has_token(&atom) {
        return Ok(());
    }
    hook.cleanup(store, &atom).await.map_err(FinalizeError::Cleanup)?;
    let mut released = atom;
    released.finalizers_mut().retain(|f| f != FINALIZER);
    store.update(&released).await.map_err(FinalizeError::Release)?;
    info!(ns = %released.namespace().unwrap_or_default(), name = %released.name_any(), "finalized");
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum FinalizeError {
    #[error("adding finalizer: {0}")]
    Token(#[source] StoreError),
    #[error("cleanup hook: {0}")]
    Cleanup(#[source] CleanupError),
    #[error("removing finalizer: {0}")]
    Release(#[source] StoreError),
}
