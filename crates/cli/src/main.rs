use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atom_core::{Atom, IngressRoute, Middleware, ObjectKey, OperatorConfig, OwnerInfo, CONTROLLER_NAME};
use atom_kubehub::KubeStore;
use atom_reconcile::{Outcome, PruneConfigHolders, ReconcileError, Reconciler, YamlTranslator};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, CustomResourceExt, Resource, ResourceExt};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "atom-operator", version, about = "Kubernetes operator serving Atom download feeds")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch Atom objects and converge their managed resources
    Run(RunArgs),
    /// Print the Atom and OwnerInfo CRDs as YAML
    Crd,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Restrict the controller to one namespace (default: all)
    #[arg(long = "namespace", env = "ATOM_NAMESPACE")]
    namespace: Option<String>,

    /// Public base URL; its host is matched by the routing rules
    #[arg(long = "base-url", env = "ATOM_BASE_URL", default_value = "http://localhost")]
    base_url: String,

    /// Object storage endpoint handed to the generator
    #[arg(long = "blob-endpoint", env = "ATOM_BLOB_ENDPOINT", default_value = "http://localhost:10000/devstoreaccount1")]
    blob_endpoint: String,

    #[arg(long = "generator-image", env = "ATOM_GENERATOR_IMAGE", default_value = "docker.io/pdok/atom-generator:latest")]
    generator_image: String,

    #[arg(long = "lighttpd-image", env = "ATOM_LIGHTTPD_IMAGE", default_value = "docker.io/pdok/lighttpd:latest")]
    lighttpd_image: String,

    #[arg(long = "replicas", env = "ATOM_REPLICAS", default_value_t = 2)]
    replicas: i32,

    /// Comma-separated Traefik entry points
    #[arg(long = "entry-points", env = "ATOM_ENTRY_POINTS", value_delimiter = ',', default_value = "web")]
    entry_points: Vec<String>,

    /// Requeue delay after a failed pass
    #[arg(long = "error-requeue-secs", env = "ATOM_ERROR_REQUEUE_SECS", default_value_t = 10)]
    error_requeue_secs: u64,

    /// Periodic resync of converged owners
    #[arg(long = "resync-secs", env = "ATOM_RESYNC_SECS", default_value_t = 3600)]
    resync_secs: u64,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            base_url: self.base_url.clone(),
            blob_endpoint: self.blob_endpoint.clone(),
            generator_image: self.generator_image.clone(),
            lighttpd_image: self.lighttpd_image.clone(),
            replicas: self.replicas,
            entry_points: self.entry_points.clone(),
        }
    }
}

fn init_tracing() {
    let env = std::env::var("ATOM_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ATOM_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ATOM_METRICS_ADDR; expected host:port");
        }
    }
}

struct Ctx {
    engine: Reconciler<KubeStore, YamlTranslator, PruneConfigHolders>,
    error_requeue: Duration,
    resync: Duration,
}

async fn reconcile(atom: Arc<Atom>, ctx: Arc<Ctx>) -> Result<Action, ReconcileError> {
    let key = ObjectKey::new(atom.namespace().unwrap_or_default(), atom.name_any());
    match ctx.engine.reconcile(&key).await? {
        Outcome::Converged(_) => Ok(Action::requeue(ctx.resync)),
        Outcome::Absent | Outcome::Finalized => Ok(Action::await_change()),
    }
}

fn error_policy(atom: Arc<Atom>, err: &ReconcileError, ctx: Arc<Ctx>) -> Action {
    // fatal errors need a spec change, which triggers a pass on its own
    let delay = if err.is_fatal() { ctx.resync } else { ctx.error_requeue };
    warn!(ns = %atom.namespace().unwrap_or_default(), name = %atom.name_any(), error = %err, requeue_secs = delay.as_secs(), "requeue after error");
    Action::requeue(delay)
}

fn api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = args.operator_config();
    config.validate().context("invalid operator configuration")?;
    let store = KubeStore::try_default().await?;
    let client = store.client();
    let ns = args.namespace.as_deref();
    info!(controller = CONTROLLER_NAME, ns = ?ns, base_url = %config.base_url, replicas = config.replicas, "starting atom operator");

    let ctx = Arc::new(Ctx {
        engine: Reconciler::new(store, YamlTranslator, PruneConfigHolders, config),
        error_requeue: Duration::from_secs(args.error_requeue_secs),
        resync: Duration::from_secs(args.resync_secs),
    });

    let wc = watcher::Config::default();
    let controller = Controller::new(api::<Atom>(&client, ns), wc.clone());
    let atoms = controller.store();
    controller
        .owns(api::<ConfigMap>(&client, ns), wc.clone())
        .owns(api::<Deployment>(&client, ns), wc.clone())
        .owns(api::<Service>(&client, ns), wc.clone())
        .owns(api::<Middleware>(&client, ns), wc.clone())
        .owns(api::<IngressRoute>(&client, ns), wc.clone())
        .owns(api::<PodDisruptionBudget>(&client, ns), wc.clone())
        // an OwnerInfo change re-renders every Atom that references it
        .watches(api::<OwnerInfo>(&client, ns), wc, move |info: OwnerInfo| {
            let namespace = info.namespace();
            let name = info.name_any();
            atoms
                .state()
                .into_iter()
                .filter(|a| a.namespace() == namespace && a.spec.service.owner_info_ref == name)
                .map(|a| ObjectRef::from_obj(&*a))
                .collect::<Vec<_>>()
        })
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => tracing::debug!(object = %obj, "reconciled"),
                Err(e) => error!(error = %e, "controller error"),
            }
        })
        .await;
    info!("controller stopped");
    Ok(())
}

fn print_crds() -> Result<()> {
    let atom = serde_yaml::to_string(&Atom::crd()).context("rendering Atom CRD")?;
    let owner_info = serde_yaml::to_string(&OwnerInfo::crd()).context("rendering OwnerInfo CRD")?;
    print!("{}---\n{}", atom, owner_info);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => {
            init_metrics();
            run(args).await
        }
        Commands::Crd => print_crds(),
    }
}
