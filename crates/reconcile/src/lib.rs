//! Atom reconcile – one convergence pass per `Atom` key.
//!
//! A pass fetches the owner, runs the finalizer state machine, renders the
//! generator document and applies every managed kind in [`ManagedKind::ORDER`].
//! Per-kind failures are recorded in the status and do not stop later kinds.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Instant;

use atom_apply::hash::split_name;
use atom_apply::{apply, identity, labels, Applied, ApplyError, NameDiscipline};
use atom_core::{Atom, IngressRoute, Middleware, ObjectKey, OperationResult, OperatorConfig, OwnerInfo};
use atom_kubehub::{kind_of, Managed, ResourceStore, StoreError};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;
use metrics::{counter, histogram};
use tracing::{debug, info, instrument, warn};

pub mod finalizer;
pub mod mutate;
pub mod status;
pub mod translate;

pub use finalizer::{CleanupError, CleanupHook, FinalizeError, PruneConfigHolders};
pub use translate::{SpecTranslator, TranslateError, YamlTranslator};

/// Managed kinds, in apply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ManagedKind {
    ConfigHolder,
    Workload,
    Endpoint,
    TrafficPolicy,
    RoutingRules,
    DisruptionGuard,
}

impl ManagedKind {
    pub const ORDER: [ManagedKind; 6] = [
        ManagedKind::ConfigHolder,
        ManagedKind::Workload,
        ManagedKind::Endpoint,
        ManagedKind::TrafficPolicy,
        ManagedKind::RoutingRules,
        ManagedKind::DisruptionGuard,
    ];

    /// Kinds that cannot be built without the generated document.
    pub fn needs_document(self) -> bool {
        matches!(self, ManagedKind::ConfigHolder | ManagedKind::Workload)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ManagedKind::ConfigHolder => "ConfigHolder",
            ManagedKind::Workload => "Workload",
            ManagedKind::Endpoint => "Endpoint",
            ManagedKind::TrafficPolicy => "TrafficPolicy",
            ManagedKind::RoutingRules => "RoutingRules",
            ManagedKind::DisruptionGuard => "DisruptionGuard",
        }
    }
}

impl fmt::Display for ManagedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("fetching atom {key}: {source}")]
    Fetch {
        key: String,
        #[source]
        source: StoreError,
    },
    #[error("owner info {name:?}: {reason}")]
    OwnerInfo { name: String, reason: String },
    #[error("translating atom: {0}")]
    Translate(#[from] TranslateError),
    #[error("{kind}: {source}")]
    Apply {
        kind: ManagedKind,
        #[source]
        source: ApplyError,
    },
    #[error(transparent)]
    Finalizer(#[from] FinalizeError),
    #[error("writing status: {0}")]
    Status(#[source] StoreError),
}

impl ReconcileError {
    /// Whether retrying without a spec change can succeed.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReconcileError::Apply { source, .. } => source.is_fatal(),
            ReconcileError::Translate(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The owner no longer exists; nothing to do.
    Absent,
    /// The owner was being deleted and cleanup completed.
    Finalized,
    /// `<Kind>/<name>` -> outcome of every managed object.
    Converged(BTreeMap<String, OperationResult>),
}

/// Accumulates per-object outcomes of one pass.
#[derive(Default)]
struct Pass {
    results: BTreeMap<String, OperationResult>,
    messages: Vec<String>,
    first: Option<ReconcileError>,
}

impl Pass {
    fn fail(&mut self, kind: ManagedKind, key: String, err: ApplyError) {
        warn!(kind = %kind, object = %key, error = %err, "apply failed");
        self.results.insert(key.clone(), OperationResult::Error);
        self.messages.push(format!("{}: {}", key, err));
        if self.first.is_none() {
            self.first = Some(ReconcileError::Apply { kind, source: err });
        }
    }

    fn record<K: Managed>(&mut self, kind: ManagedKind, bare_name: &str, res: Result<Applied<K>, ApplyError>) -> Option<K> {
        match res {
            Ok(applied) => {
                let key = format!("{}/{}", kind_of::<K>(), applied.object.name_any());
                debug!(kind = %kind, object = %key, result = %applied.result, "applied");
                self.results.insert(key, applied.result);
                Some(applied.object)
            }
            Err(e) => {
                self.fail(kind, format!("{}/{}", kind_of::<K>(), bare_name), e);
                None
            }
        }
    }
}

/// Whether every replica of `d` runs the current pod template, so nothing
/// still mounts an earlier config holder.
fn rolled_out(d: &Deployment) -> bool {
    let Some(status) = d.status.as_ref() else { return false };
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    status.observed_generation.unwrap_or_default() >= d.metadata.generation.unwrap_or_default()
        && status.updated_replicas.unwrap_or_default() == desired
        && status.replicas.unwrap_or_default() == desired
        && status.unavailable_replicas.unwrap_or_default() == 0
}

/// Convergence engine for `Atom` owners.
pub struct Reconciler<S, T = YamlTranslator, H = PruneConfigHolders> {
    store: S,
    translator: T,
    cleanup: H,
    config: OperatorConfig,
}

impl<S, T, H> Reconciler<S, T, H>
where
    S: ResourceStore,
    T: SpecTranslator,
    H: CleanupHook,
{
    pub fn new(store: S, translator: T, cleanup: H, config: OperatorConfig) -> Self {
        Self { store, translator, cleanup, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    /// One pass over the owner named by `key`.
    #[instrument(skip(self), fields(ns = %key.namespace, name = %key.name))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let started = Instant::now();
        counter!("reconcile_total", 1u64);
        let res = self.pass(key).await;
        histogram!("reconcile_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(Outcome::Converged(results)) => info!(objects = results.len(), "converged"),
            Ok(other) => debug!(outcome = ?other, "done"),
            Err(e) => {
                counter!("reconcile_errors_total", 1u64);
                warn!(error = %e, fatal = e.is_fatal(), "reconcile failed");
            }
        }
        res
    }

    async fn pass(&self, key: &ObjectKey) -> Result<Outcome, ReconcileError> {
        let atom = match self.store.get::<Atom>(&key.namespace, &key.name).await {
            Ok(Some(a)) => a,
            Ok(None) => return Ok(Outcome::Absent),
            Err(source) => return Err(ReconcileError::Fetch { key: key.to_string(), source }),
        };
        if finalizer::is_deleting(&atom) {
            if let Err(e) = finalizer::finalize(&self.store, &self.cleanup, atom.clone()).await {
                self.record_abort(&atom, e.to_string()).await;
                return Err(e.into());
            }
            return Ok(Outcome::Finalized);
        }
        let atom = match finalizer::ensure_token(&self.store, atom.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                self.record_abort(&atom, e.to_string()).await;
                return Err(e.into());
            }
        };
        let labels = labels::owner_labels(&atom);

        let mut pass = Pass::default();
        let document = match self.owner_info(&atom).await {
            Ok(owner_info) => match self.translator.translate(&atom, &owner_info) {
                Ok(doc) => Some(doc),
                Err(e) => {
                    // nothing is applied on a broken spec
                    self.record_abort(&atom, e.to_string()).await;
                    return Err(e.into());
                }
            },
            Err(e) => {
                pass.messages.push(e.to_string());
                pass.first = Some(e);
                None
            }
        };

        let mut config_name: Option<String> = None;
        for kind in ManagedKind::ORDER {
            if kind.needs_document() && document.is_none() {
                let (key, name) = match kind {
                    ManagedKind::ConfigHolder => (kind_of::<ConfigMap>(), identity::bare_name(&atom, identity::GENERATOR)),
                    _ => (kind_of::<Deployment>(), identity::bare_name(&atom, identity::ATOM)),
                };
                pass.results.insert(format!("{}/{}", key, name), OperationResult::Error);
                continue;
            }
            match kind {
                ManagedKind::ConfigHolder => {
                    let doc = document.as_deref().unwrap_or_default();
                    let bare: ConfigMap = identity::bare(&atom, identity::GENERATOR);
                    let res = apply(&self.store, &atom, bare, &labels, NameDiscipline::ContentHash, |cm: &mut ConfigMap| {
                        mutate::config_holder(doc, cm);
                        Ok(())
                    })
                    .await;
                    let base = identity::bare_name(&atom, identity::GENERATOR);
                    config_name = pass.record(kind, &base, res).map(|cm| cm.name_any());
                }
                ManagedKind::Workload => {
                    let name = identity::bare_name(&atom, identity::ATOM);
                    let Some(current) = config_name.as_deref() else {
                        let err = ApplyError::Mutate("config holder unavailable".into());
                        pass.fail(kind, format!("{}/{}", kind_of::<Deployment>(), name), err);
                        continue;
                    };
                    let bare: Deployment = identity::bare(&atom, identity::ATOM);
                    let cfg = &self.config;
                    let res = apply(&self.store, &atom, bare, &labels, NameDiscipline::Fixed, |d: &mut Deployment| {
                        mutate::workload(&atom, cfg, current, &labels, d);
                        Ok(())
                    })
                    .await;
                    if let Some(d) = pass.record(kind, &name, res) {
                        if !rolled_out(&d) {
                            debug!(config = current, "rollout in progress, keeping previous config holders");
                        } else if let Err(e) = self.prune_config_holders(&atom, &labels, current).await {
                            pass.fail(kind, format!("{}/{}", kind_of::<ConfigMap>(), identity::bare_name(&atom, identity::GENERATOR)), e);
                        }
                    }
                }
                ManagedKind::Endpoint => {
                    let bare: Service = identity::bare(&atom, identity::ATOM);
                    let res = apply(&self.store, &atom, bare, &labels, NameDiscipline::Fixed, |svc: &mut Service| {
                        mutate::endpoint(&labels, svc);
                        Ok(())
                    })
                    .await;
                    pass.record(kind, &identity::bare_name(&atom, identity::ATOM), res);
                }
                ManagedKind::TrafficPolicy => self.traffic_policy(&atom, &labels, &mut pass).await,
                ManagedKind::RoutingRules => {
                    let bare: IngressRoute = identity::bare(&atom, identity::ATOM);
                    let cfg = &self.config;
                    let groups = mutate::download_groups(&atom);
                    let res = apply(&self.store, &atom, bare, &labels, NameDiscipline::Fixed, |ir: &mut IngressRoute| {
                        let inputs = mutate::RouteInputs::new(&atom, cfg)?;
                        mutate::routing_rules(&atom, cfg, &inputs, &groups, ir);
                        Ok(())
                    })
                    .await;
                    pass.record(kind, &identity::bare_name(&atom, identity::ATOM), res);
                }
                ManagedKind::DisruptionGuard => {
                    let bare: PodDisruptionBudget = identity::bare(&atom, identity::ATOM);
                    let res = apply(&self.store, &atom, bare, &labels, NameDiscipline::Fixed, |pdb: &mut PodDisruptionBudget| {
                        mutate::disruption_guard(&labels, pdb);
                        Ok(())
                    })
                    .await;
                    pass.record(kind, &identity::bare_name(&atom, identity::ATOM), res);
                }
            }
        }

        let Pass { results, messages, first } = pass;
        let next = status::next_status(&atom, results.clone(), &messages, &status::now());
        let written = status::write_if_changed(&self.store, &atom, next).await;
        match (first, written) {
            (Some(e), Err(se)) => {
                warn!(error = %se, "status write failed");
                Err(e)
            }
            (Some(e), Ok(_)) => Err(e),
            (None, Err(se)) => Err(ReconcileError::Status(se)),
            (None, Ok(_)) => Ok(Outcome::Converged(results)),
        }
    }

    /// Mark the pass failed on the owner's condition. The stored outcome map is kept.
    async fn record_abort(&self, atom: &Atom, message: String) {
        let previous = atom.status.as_ref().map(|s| s.operation_results.clone()).unwrap_or_default();
        let next = status::next_status(atom, previous, &[message], &status::now());
        if let Err(se) = status::write_if_changed(&self.store, atom, next).await {
            warn!(error = %se, "status write failed");
        }
    }

    async fn owner_info(&self, atom: &Atom) -> Result<OwnerInfo, ReconcileError> {
        let namespace = atom.namespace().unwrap_or_default();
        let name = &atom.spec.service.owner_info_ref;
        match self.store.get::<OwnerInfo>(&namespace, name).await {
            Ok(Some(info)) => Ok(info),
            Ok(None) => Err(ReconcileError::OwnerInfo { name: name.clone(), reason: "not found".into() }),
            Err(e) => Err(ReconcileError::OwnerInfo { name: name.clone(), reason: e.to_string() }),
        }
    }

    async fn traffic_policy(&self, atom: &Atom, labels: &BTreeMap<String, String>, pass: &mut Pass) {
        let kind = ManagedKind::TrafficPolicy;
        let cfg = &self.config;

        let bare: Middleware = identity::bare(atom, identity::CORS_HEADERS);
        let res = apply(&self.store, atom, bare, labels, NameDiscipline::Fixed, |mw: &mut Middleware| {
            mutate::cors_headers(mw);
            Ok(())
        })
        .await;
        pass.record(kind, &identity::bare_name(atom, identity::CORS_HEADERS), res);

        let bare: Middleware = identity::bare(atom, identity::PREFIX_STRIP);
        let res = apply(&self.store, atom, bare, labels, NameDiscipline::Fixed, |mw: &mut Middleware| {
            let inputs = mutate::RouteInputs::new(atom, cfg)?;
            mutate::prefix_strip(&inputs, mw);
            Ok(())
        })
        .await;
        pass.record(kind, &identity::bare_name(atom, identity::PREFIX_STRIP), res);

        let groups = mutate::download_groups(atom);
        for (i, group) in groups.iter().enumerate() {
            let suffix = identity::downloads(i);
            let bare: Middleware = identity::bare(atom, &suffix);
            let res = apply(&self.store, atom, bare, labels, NameDiscipline::Fixed, |mw: &mut Middleware| {
                let inputs = mutate::RouteInputs::new(atom, cfg)?;
                mutate::downloads_rewrite(&inputs, group, mw);
                Ok(())
            })
            .await;
            pass.record(kind, &identity::bare_name(atom, &suffix), res);
        }
        if let Err(e) = self.prune_download_rewrites(atom, labels, groups.len()).await {
            pass.fail(kind, format!("{}/{}", kind_of::<Middleware>(), identity::bare_name(atom, &identity::downloads(groups.len()))), e);
        }
    }

    /// Delete config holders of this owner other than `current`.
    async fn prune_config_holders(&self, atom: &Atom, labels: &BTreeMap<String, String>, current: &str) -> Result<(), ApplyError> {
        let namespace = atom.namespace().unwrap_or_default();
        let base = identity::bare_name(atom, identity::GENERATOR);
        let holders: Vec<ConfigMap> = self.store.list(&namespace, labels).await?;
        for cm in holders {
            let name = cm.name_any();
            if name == current || split_name(&name).0 != base {
                continue;
            }
            self.store.delete::<ConfigMap>(&namespace, &name).await?;
            info!(ns = %namespace, name = %name, "pruned stale config holder");
        }
        Ok(())
    }

    /// Delete download rewrites left over from a spec with more storage prefixes.
    async fn prune_download_rewrites(&self, atom: &Atom, labels: &BTreeMap<String, String>, keep: usize) -> Result<(), ApplyError> {
        let namespace = atom.namespace().unwrap_or_default();
        let wanted: Vec<String> = (0..keep).map(|i| identity::bare_name(atom, &identity::downloads(i))).collect();
        let prefix = format!("{}-", identity::bare_name(atom, identity::DOWNLOADS));
        let existing: Vec<Middleware> = self.store.list(&namespace, labels).await?;
        for mw in existing {
            let name = mw.name_any();
            if !name.starts_with(&prefix) || wanted.contains(&name) {
                continue;
            }
            self.store.delete::<Middleware>(&namespace, &name).await?;
            info!(ns = %namespace, name = %name, "pruned stale download rewrite");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_fixed() {
        assert_eq!(ManagedKind::ORDER[0], ManagedKind::ConfigHolder);
        assert_eq!(ManagedKind::ORDER[5], ManagedKind::DisruptionGuard);
        let needs: Vec<_> = ManagedKind::ORDER.iter().filter(|k| k.needs_document()).collect();
        assert_eq!(needs, vec![&ManagedKind::ConfigHolder, &ManagedKind::Workload]);
    }

    #[test]
    fn fatal_errors_come_from_apply_and_translate() {
        let e = ReconcileError::Apply {
            kind: ManagedKind::Endpoint,
            source: ApplyError::OwnerIdentity { owner: "x".into() },
        };
        assert!(!e.is_fatal());
        assert!(ReconcileError::Translate(TranslateError::Invalid("x".into())).is_fatal());
        assert_eq!(e.to_string(), "Endpoint: owner x has no uid yet");
    }

    #[test]
    fn rollout_completes_when_every_replica_is_updated() {
        use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

        let mut d = Deployment::default();
        d.metadata.generation = Some(2);
        d.spec = Some(DeploymentSpec { replicas: Some(2), ..DeploymentSpec::default() });
        assert!(!rolled_out(&d));

        // surge pod with the new template next to both old replicas
        d.status = Some(DeploymentStatus {
            observed_generation: Some(2),
            replicas: Some(3),
            updated_replicas: Some(1),
            ..DeploymentStatus::default()
        });
        assert!(!rolled_out(&d));

        d.status = Some(DeploymentStatus {
            observed_generation: Some(1),
            replicas: Some(2),
            updated_replicas: Some(2),
            ..DeploymentStatus::default()
        });
        assert!(!rolled_out(&d));

        d.status.as_mut().unwrap().observed_generation = Some(2);
        assert!(rolled_out(&d));
    }
}
