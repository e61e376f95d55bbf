//! Controller owner reference from each managed resource back to its `Atom`.

#![forbid(unsafe_code)]

use atom_kubehub::{kind_of, Managed};
use kube::{Resource, ResourceExt};

use crate::ApplyError;

/// Point `obj` at `owner` as its sole controller owner reference.
pub fn stamp<O, K>(owner: &O, obj: &mut K) -> Result<(), ApplyError>
where
    O: Resource<DynamicType = ()>,
    K: Managed,
{
    let kind = kind_of::<K>();
    let name = obj.name_any();
    let owner_ns = owner.namespace().unwrap_or_default();
    let obj_ns = obj.namespace().unwrap_or_default();
    if owner_ns != obj_ns {
        return Err(ApplyError::CrossNamespaceOwner { kind, name, namespace: obj_ns, owner_namespace: owner_ns });
    }
    let reference = owner.controller_owner_ref(&()).ok_or_else(|| ApplyError::OwnerIdentity { owner: owner.name_any() })?;
    let current = obj.meta().owner_references.clone().unwrap_or_default();
    if let Some(other) = current.iter().find(|r| r.controller == Some(true) && r.uid != reference.uid) {
        return Err(ApplyError::OwnedByOther {
            kind,
            namespace: obj_ns,
            name,
            owner: format!("{}/{}", other.kind, other.name),
        });
    }
    obj.meta_mut().owner_references = Some(vec![reference]);
    Ok(())
}
