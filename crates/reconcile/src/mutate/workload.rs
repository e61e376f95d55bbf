use std::collections::BTreeMap;

use atom_core::{Atom, OperatorConfig};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

pub const SERVICE_PORT: i32 = 80;
pub const SERVICE_PORT_NAME: &str = "atom-service";
/// Health and readiness endpoint of the serving container.
pub const STATUS_PATH: &str = "/server-status";
/// Pod template annotation pinning the config holder in use.
pub const CONFIG_ANNOTATION: &str = "pdok.nl/config-map";
/// Deployment annotation mirroring `spec.lifecycle.ttlInDays`.
pub const TTL_ANNOTATION: &str = "pdok.nl/ttl-in-days";
/// Generator environment variable carrying the object storage endpoint.
pub const BLOB_ENDPOINT_ENV: &str = "BLOBS_ENDPOINT";

const CONFIG_VOLUME: &str = "config";
const DATA_VOLUME: &str = "data";
const CONFIG_MOUNT: &str = "/srv/config";
const DATA_MOUNT: &str = "/srv/data";

fn selector(labels: &BTreeMap<String, String>) -> LabelSelector {
    LabelSelector { match_labels: Some(labels.clone()), ..LabelSelector::default() }
}

fn quantities(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, Quantity>> {
    Some(pairs.iter().map(|(k, v)| (k.to_string(), Quantity(v.to_string()))).collect())
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: if read_only { Some(true) } else { None },
        ..VolumeMount::default()
    }
}

fn http_probe(initial_delay: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(STATUS_PATH.to_string()),
            port: IntOrString::Int(SERVICE_PORT),
            scheme: Some("HTTP".into()),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        success_threshold: Some(1),
        failure_threshold: Some(3),
        ..Probe::default()
    }
}

fn container_defaults(c: Container) -> Container {
    Container {
        image_pull_policy: Some("IfNotPresent".into()),
        termination_message_path: Some("/dev/termination-log".into()),
        termination_message_policy: Some("File".into()),
        ..c
    }
}

/// Two-phase pod: the generator materialises the document into a shared
/// volume, then lighttpd serves that volume.
pub fn workload(atom: &Atom, cfg: &OperatorConfig, config_name: &str, labels: &BTreeMap<String, String>, d: &mut Deployment) {
    let generator = container_defaults(Container {
        name: "atom-generator".into(),
        image: Some(cfg.generator_image.clone()),
        command: Some(vec!["atom-generator".into()]),
        args: Some(vec![
            "--config".into(),
            format!("{}/{}", CONFIG_MOUNT, super::DOCUMENT_KEY),
            "--output".into(),
            DATA_MOUNT.into(),
        ]),
        env: Some(vec![EnvVar {
            name: BLOB_ENDPOINT_ENV.into(),
            value: Some(cfg.blob_endpoint.clone()),
            ..EnvVar::default()
        }]),
        volume_mounts: Some(vec![mount(CONFIG_VOLUME, CONFIG_MOUNT, true), mount(DATA_VOLUME, DATA_MOUNT, false)]),
        resources: Some(ResourceRequirements {
            requests: quantities(&[("cpu", "10m"), ("memory", "64Mi")]),
            limits: quantities(&[("memory", "256Mi")]),
            ..ResourceRequirements::default()
        }),
        ..Container::default()
    });

    let server = container_defaults(Container {
        name: "atom-service".into(),
        image: Some(cfg.lighttpd_image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some(SERVICE_PORT_NAME.into()),
            container_port: SERVICE_PORT,
            protocol: Some("TCP".into()),
            ..ContainerPort::default()
        }]),
        volume_mounts: Some(vec![mount(DATA_VOLUME, DATA_MOUNT, true)]),
        liveness_probe: Some(http_probe(5)),
        readiness_probe: Some(http_probe(5)),
        resources: Some(ResourceRequirements {
            requests: quantities(&[("cpu", "10m"), ("memory", "32Mi")]),
            limits: quantities(&[("memory", "64Mi")]),
            ..ResourceRequirements::default()
        }),
        ..Container::default()
    });

    let annotations: BTreeMap<String, String> = [(CONFIG_ANNOTATION.to_string(), config_name.to_string())].into_iter().collect();

    d.spec = Some(DeploymentSpec {
        replicas: Some(cfg.replicas),
        revision_history_limit: Some(1),
        progress_deadline_seconds: Some(600),
        selector: selector(labels),
        strategy: Some(DeploymentStrategy {
            type_: Some("RollingUpdate".into()),
            rolling_update: Some(RollingUpdateDeployment {
                max_surge: Some(IntOrString::Int(1)),
                max_unavailable: Some(IntOrString::Int(0)),
            }),
        }),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels.clone()),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            }),
            spec: Some(PodSpec {
                init_containers: Some(vec![generator]),
                containers: vec![server],
                volumes: Some(vec![
                    Volume {
                        name: CONFIG_VOLUME.into(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: Some(config_name.to_string()),
                            default_mode: Some(0o644),
                            ..ConfigMapVolumeSource::default()
                        }),
                        ..Volume::default()
                    },
                    Volume { name: DATA_VOLUME.into(), empty_dir: Some(EmptyDirVolumeSource::default()), ..Volume::default() },
                ]),
                restart_policy: Some("Always".into()),
                dns_policy: Some("ClusterFirst".into()),
                scheduler_name: Some("default-scheduler".into()),
                termination_grace_period_seconds: Some(30),
                ..PodSpec::default()
            }),
        },
        ..DeploymentSpec::default()
    });
    match atom.spec.lifecycle.as_ref().and_then(|l| l.ttl_in_days) {
        Some(ttl) => {
            d.metadata.annotations.get_or_insert_with(BTreeMap::new).insert(TTL_ANNOTATION.into(), ttl.to_string());
        }
        None => {
            if let Some(annotations) = d.metadata.annotations.as_mut() {
                annotations.remove(TTL_ANNOTATION);
                if annotations.is_empty() {
                    d.metadata.annotations = None;
                }
            }
        }
    }
}

/// Service exposing the serving port; server-allocated fields are kept.
pub fn endpoint(labels: &BTreeMap<String, String>, svc: &mut Service) {
    let prev = svc.spec.take().unwrap_or_default();
    svc.spec = Some(ServiceSpec {
        type_: Some("ClusterIP".into()),
        selector: Some(labels.clone()),
        ports: Some(vec![ServicePort {
            name: Some(SERVICE_PORT_NAME.into()),
            port: SERVICE_PORT,
            target_port: Some(IntOrString::Int(SERVICE_PORT)),
            protocol: Some("TCP".into()),
            ..ServicePort::default()
        }]),
        cluster_ip: prev.cluster_ip,
        cluster_ips: prev.cluster_ips,
        ip_families: prev.ip_families,
        ip_family_policy: prev.ip_family_policy,
        internal_traffic_policy: prev.internal_traffic_policy,
        session_affinity: prev.session_affinity,
        ..ServiceSpec::default()
    });
}

/// At most one replica may be voluntarily evicted at a time.
pub fn disruption_guard(labels: &BTreeMap<String, String>, pdb: &mut PodDisruptionBudget) {
    pdb.spec = Some(PodDisruptionBudgetSpec {
        max_unavailable: Some(IntOrString::Int(1)),
        selector: Some(selector(labels)),
        ..PodDisruptionBudgetSpec::default()
    });
}
