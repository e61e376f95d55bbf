//! Atom operator core types: owner CRDs, Traefik CRDs, status and configuration.

#![forbid(unsafe_code)]

pub mod config;
pub mod crd;
pub mod status;
pub mod traefik;

pub use config::{ConfigError, OperatorConfig};
pub use crd::{Atom, AtomSpec, OwnerInfo, OwnerInfoSpec};
pub use status::{AtomStatus, Condition, ConditionStatus, OperationResult};
pub use traefik::{IngressRoute, Middleware};

/// Finalizer token guarding external cleanup of an `Atom`.
pub const FINALIZER: &str = "pdok.nl/atom-finalizer";

/// Label added on top of the owner's labels for every managed resource.
pub const APP_LABEL: &str = "app";
pub const APP_LABEL_VALUE: &str = "atom-service";

/// Field manager / controller name used in logs and metrics.
pub const CONTROLLER_NAME: &str = "atom-operator";

/// Namespaced object key handed to the reconciler by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
