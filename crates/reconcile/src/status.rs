//! `Reconciled` condition and operation outcome map of an `Atom`.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use atom_core::status::{CONDITION_RECONCILED, REASON_ERROR, REASON_SUCCEEDED};
use atom_core::{Atom, AtomStatus, Condition, ConditionStatus, OperationResult};
use atom_kubehub::{ResourceStore, StoreError};
use chrono::{SecondsFormat, Utc};
use kube::ResourceExt;
use metrics::counter;
use tracing::debug;

pub fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Condition for this pass; the transition time only moves when `status` flips.
pub fn reconciled_condition(previous: Option<&Condition>, errors: &[String], generation: Option<i64>, now: &str) -> Condition {
    let (status, reason) = if errors.is_empty() {
        (ConditionStatus::True, REASON_SUCCEEDED)
    } else {
        (ConditionStatus::False, REASON_ERROR)
    };
    let last_transition_time = match previous {
        Some(p) if p.status == status => p.last_transition_time.clone(),
        _ => now.to_string(),
    };
    Condition {
        type_: CONDITION_RECONCILED.to_string(),
        status,
        reason: reason.to_string(),
        message: errors.join("; "),
        observed_generation: generation,
        last_transition_time,
    }
}

/// Outcome map to store: the key set of this pass, where an `unchanged`
/// object keeps a stored `created`/`updated` so a quiet pass writes nothing.
pub fn fold_results(
    stored: &BTreeMap<String, OperationResult>,
    pass: BTreeMap<String, OperationResult>,
) -> BTreeMap<String, OperationResult> {
    pass.into_iter()
        .map(|(key, result)| {
            let kept = match (result, stored.get(&key)) {
                (OperationResult::Unchanged, Some(prev @ (OperationResult::Created | OperationResult::Updated))) => *prev,
                _ => result,
            };
            (key, kept)
        })
        .collect()
}

/// Next status document. Conditions of other types are kept as-is.
pub fn next_status(atom: &Atom, results: BTreeMap<String, OperationResult>, errors: &[String], now: &str) -> AtomStatus {
    let current = atom.status.clone().unwrap_or_default();
    let condition = reconciled_condition(current.condition(CONDITION_RECONCILED), errors, atom.metadata.generation, now);
    let operation_results = fold_results(&current.operation_results, results);
    let mut conditions: Vec<Condition> = current.conditions.into_iter().filter(|c| c.type_ != CONDITION_RECONCILED).collect();
    conditions.push(condition);
    AtomStatus { conditions, operation_results }
}

/// Write `status` unless it deep-equals what the owner already carries.
/// Returns whether a write happened.
pub async fn write_if_changed<S: ResourceStore>(store: &S, atom: &Atom, status: AtomStatus) -> Result<bool, StoreError> {
    if atom.status.as_ref() == Some(&status) {
        counter!("status_writes_skipped_total", 1u64);
        debug!(ns = %atom.namespace().unwrap_or_default(), name = %atom.name_any(), "status unchanged");
        return Ok(false);
    }
    let mut next = atom.clone();
    next.status = Some(status);
    store.update_status(&next).await?;
    counter!("status_writes_total", 1u64);
    Ok(true)
}
