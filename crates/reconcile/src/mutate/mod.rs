//! Desired state of every managed kind.
//!
//! Mutators are pure: they overwrite the whole mutable spec of the target from
//! the owner and precomputed inputs, so external drift is undone on every pass.
//! Identity, labels and owner references are handled by `atom_apply::apply`.

#![forbid(unsafe_code)]

mod config;
mod routing;
mod workload;

pub use config::{config_holder, DOCUMENT_KEY};
pub use routing::{cors_headers, download_groups, downloads_rewrite, prefix_strip, routing_rules, DownloadGroup, RouteInputs};
pub use workload::{
    disruption_guard, endpoint, workload, BLOB_ENDPOINT_ENV, CONFIG_ANNOTATION, SERVICE_PORT, STATUS_PATH, TTL_ANNOTATION,
};
