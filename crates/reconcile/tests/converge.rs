use std::collections::BTreeMap;

use atom_core::crd::{Author, AtomService, DatasetFeed, DownloadLink, Entry, OwnerAtom};
use atom_core::status::{CONDITION_RECONCILED, REASON_ERROR};
use atom_core::{
    Atom, AtomSpec, ConditionStatus, IngressRoute, Middleware, ObjectKey, OperationResult, OperatorConfig, OwnerInfo,
    OwnerInfoSpec, FINALIZER,
};
use atom_kubehub::ResourceStore;
use atom_reconcile::{
    CleanupError, CleanupHook, Outcome, PruneConfigHolders, ReconcileError, Reconciler, SpecTranslator, TranslateError,
    YamlTranslator,
};
use atom_store::{MemoryStore, Op};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::ResourceExt;

const NS: &str = "pdok";

fn link(data: &str) -> DownloadLink {
    DownloadLink { data: data.into(), ..Default::default() }
}

fn entry(name: &str, links: &[&str]) -> Entry {
    Entry { technical_name: name.into(), download_links: links.iter().map(|d| link(d)).collect(), ..Default::default() }
}

fn atom_with(feeds: Vec<DatasetFeed>) -> Atom {
    let mut a = Atom::new(
        "dataset",
        AtomSpec {
            lifecycle: None,
            service: AtomService {
                base_url: "https://service.example.com/owner/dataset/atom".into(),
                title: "Dataset".into(),
                owner_info_ref: "owner".into(),
                ..Default::default()
            },
            dataset_feeds: feeds,
        },
    );
    a.metadata.namespace = Some(NS.into());
    a.metadata.labels = Some([("dataset".to_string(), "dataset".to_string())].into_iter().collect());
    a
}

fn owner_info() -> OwnerInfo {
    let mut o = OwnerInfo::new(
        "owner",
        OwnerInfoSpec {
            atom: Some(OwnerAtom { author: Author { name: "Owner".into(), email: "owner@example.com".into() } }),
            ..Default::default()
        },
    );
    o.metadata.namespace = Some(NS.into());
    o
}

fn config() -> OperatorConfig {
    OperatorConfig { base_url: "https://service.example.com".into(), ..Default::default() }
}

fn key() -> ObjectKey {
    ObjectKey::new(NS, "dataset")
}

async fn seed(store: &MemoryStore, atom: &Atom, with_owner_info: bool) {
    store.create(atom).await.unwrap();
    if with_owner_info {
        store.create(&owner_info()).await.unwrap();
    }
}

fn reconciler(store: MemoryStore) -> Reconciler<MemoryStore> {
    Reconciler::new(store, YamlTranslator, PruneConfigHolders, config())
}

async fn live_atom(store: &MemoryStore) -> Atom {
    store.get::<Atom>(NS, "dataset").await.unwrap().unwrap()
}

/// Report every replica of the workload as running its current template.
async fn finish_rollout(store: &MemoryStore) {
    let mut d: Deployment = store.get(NS, "dataset-atom").await.unwrap().unwrap();
    let replicas = d.spec.as_ref().and_then(|s| s.replicas);
    d.status = Some(DeploymentStatus {
        observed_generation: d.metadata.generation,
        replicas,
        updated_replicas: replicas,
        ready_replicas: replicas,
        available_replicas: replicas,
        ..DeploymentStatus::default()
    });
    store.update_status(&d).await.unwrap();
}

#[tokio::test]
async fn scenario_a_no_feeds_converges() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    let r = reconciler(store);

    let outcome = r.reconcile(&key()).await.unwrap();
    let Outcome::Converged(results) = outcome else { panic!("expected convergence") };
    assert!(results.values().all(|r| *r == OperationResult::Created));

    let store = r.store();
    assert_eq!(store.all::<Deployment>(NS).len(), 1);
    assert_eq!(store.all::<Service>(NS).len(), 1);
    assert_eq!(store.all::<PodDisruptionBudget>(NS).len(), 1);
    assert_eq!(store.all::<ConfigMap>(NS).len(), 1);
    let routes = store.all::<IngressRoute>(NS);
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].spec.routes.len(), 2);

    let atom = live_atom(store).await;
    assert!(atom.finalizers().iter().any(|f| f == FINALIZER));
    let status = atom.status.unwrap();
    let cond = status.condition(CONDITION_RECONCILED).unwrap();
    assert_eq!(cond.status, ConditionStatus::True);
    assert_eq!(cond.observed_generation, Some(1));
    assert_eq!(status.operation_results, results);
}

#[tokio::test]
async fn scenario_b_one_rewrite_per_storage_prefix() {
    let feeds = vec![
        DatasetFeed {
            technical_name: "roads".into(),
            title: "Roads".into(),
            entries: vec![
                entry("r1", &["public/owner/roads/a.gpkg"]),
                entry("r2", &["public/owner/roads/b.gpkg"]),
                entry("r3", &["public/owner/roads/c.gpkg"]),
                entry("r4", &["other/bucket/d.zip"]),
            ],
            ..Default::default()
        },
        DatasetFeed { technical_name: "rivers".into(), title: "Rivers".into(), ..Default::default() },
    ];
    let store = MemoryStore::new();
    seed(&store, &atom_with(feeds), true).await;
    let r = reconciler(store);
    r.reconcile(&key()).await.unwrap();

    let store = r.store();
    let routes = store.all::<IngressRoute>(NS);
    let rules = &routes[0].spec.routes;
    assert_eq!(rules.len(), 4);
    let downloads: Vec<&str> = rules[3].middlewares.iter().map(|m| m.name.as_str()).collect();
    assert!(downloads.contains(&"dataset-atom-downloads-0"));
    assert!(downloads.contains(&"dataset-atom-downloads-1"));
    assert!(!downloads.contains(&"dataset-atom-downloads-2"));

    let rewrite0: Middleware = store.get(NS, "dataset-atom-downloads-0").await.unwrap().unwrap();
    let re = rewrite0.spec.replace_path_regex.unwrap();
    assert_eq!(re.regex, r"^/owner/dataset/atom/downloads/(a\.gpkg|b\.gpkg|c\.gpkg)$");
    assert_eq!(re.replacement, "/public/owner/roads/$1");
    let rewrite1: Middleware = store.get(NS, "dataset-atom-downloads-1").await.unwrap().unwrap();
    assert_eq!(rewrite1.spec.replace_path_regex.unwrap().replacement, "/other/bucket/$1");
}

struct Broken;

impl SpecTranslator for Broken {
    fn translate(&self, _: &Atom, _: &OwnerInfo) -> Result<String, TranslateError> {
        Err(TranslateError::Invalid("feed roads has no entries".into()))
    }
}

#[tokio::test]
async fn scenario_c_translator_failure_applies_nothing() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    let r = Reconciler::new(store, Broken, PruneConfigHolders, config());

    let err = r.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Translate(_)));
    let store = r.store();
    assert!(store.all::<Deployment>(NS).is_empty());
    assert!(store.all::<ConfigMap>(NS).is_empty());
    assert!(store.all::<Middleware>(NS).is_empty());
    assert_eq!(store.writes_of(Op::Create), 2);

    let cond = live_atom(store).await.status.unwrap().condition(CONDITION_RECONCILED).cloned().unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason, REASON_ERROR);
    assert!(cond.message.contains("feed roads has no entries"));
}

#[tokio::test]
async fn second_pass_writes_nothing() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![DatasetFeed {
        technical_name: "roads".into(),
        title: "Roads".into(),
        entries: vec![entry("r1", &["public/a/x.gpkg", "public/b/y.gpkg"])],
        ..Default::default()
    }]), true)
    .await;
    let r = reconciler(store);
    r.reconcile(&key()).await.unwrap();
    let before = live_atom(r.store()).await.status.unwrap();

    r.store().reset_writes();
    let outcome = r.reconcile(&key()).await.unwrap();
    assert_eq!(r.store().writes(), 0);
    let Outcome::Converged(results) = outcome else { panic!("expected convergence") };
    assert!(results.values().all(|r| *r == OperationResult::Unchanged));

    // the stored status still reports the first pass and its transition time
    let after = live_atom(r.store()).await.status.unwrap();
    assert_eq!(
        after.condition(CONDITION_RECONCILED).unwrap().last_transition_time,
        before.condition(CONDITION_RECONCILED).unwrap().last_transition_time
    );
}

#[tokio::test]
async fn drifted_workload_is_healed() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    let r = reconciler(store);
    r.reconcile(&key()).await.unwrap();

    let mut d: Deployment = r.store().get(NS, "dataset-atom").await.unwrap().unwrap();
    d.spec.as_mut().unwrap().replicas = Some(9);
    r.store().update(&d).await.unwrap();

    let Outcome::Converged(results) = r.reconcile(&key()).await.unwrap() else { panic!("expected convergence") };
    assert_eq!(results["Deployment/dataset-atom"], OperationResult::Updated);
    let d: Deployment = r.store().get(NS, "dataset-atom").await.unwrap().unwrap();
    assert_eq!(d.spec.unwrap().replicas, Some(2));
}

#[tokio::test]
async fn rotated_config_holder_outlives_the_rollout() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    let r = reconciler(store);
    r.reconcile(&key()).await.unwrap();
    finish_rollout(r.store()).await;
    let first = r.store().all::<ConfigMap>(NS)[0].name_any();

    let mut atom = live_atom(r.store()).await;
    atom.spec.service.title = "Renamed".into();
    r.store().update(&atom).await.unwrap();
    let Outcome::Converged(results) = r.reconcile(&key()).await.unwrap() else { panic!("expected convergence") };

    let d: Deployment = r.store().get(NS, "dataset-atom").await.unwrap().unwrap();
    let volumes = d.spec.unwrap().template.spec.unwrap().volumes.unwrap();
    let second = volumes[0].config_map.as_ref().unwrap().name.clone().unwrap();
    assert_ne!(first, second);
    assert!(second.starts_with("dataset-atom-generator-"));
    assert_eq!(results[&format!("ConfigMap/{}", second)], OperationResult::Created);

    // old pods still mount the first holder until the rollout finishes
    let names: Vec<String> = r.store().all::<ConfigMap>(NS).iter().map(|c| c.name_any()).collect();
    assert!(names.contains(&first));
    assert!(names.contains(&second));
    r.reconcile(&key()).await.unwrap();
    assert_eq!(r.store().all::<ConfigMap>(NS).len(), 2);

    finish_rollout(r.store()).await;
    r.reconcile(&key()).await.unwrap();
    let holders = r.store().all::<ConfigMap>(NS);
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].name_any(), second);
}

#[tokio::test]
async fn owner_label_change_is_rejected() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    let r = reconciler(store);
    r.reconcile(&key()).await.unwrap();

    let mut atom = live_atom(r.store()).await;
    atom.metadata.labels.as_mut().unwrap().insert("dataset".into(), "renamed".into());
    r.store().update(&atom).await.unwrap();

    let err = r.reconcile(&key()).await.unwrap_err();
    assert!(err.is_fatal());
    let svc: Service = r.store().get(NS, "dataset-atom").await.unwrap().unwrap();
    assert_eq!(svc.labels()["dataset"], "dataset");
    let status = live_atom(r.store()).await.status.unwrap();
    assert_eq!(status.condition(CONDITION_RECONCILED).unwrap().status, ConditionStatus::False);
    assert_eq!(status.operation_results["Service/dataset-atom"], OperationResult::Error);
}

#[tokio::test]
async fn missing_owner_info_still_converges_other_kinds() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), false).await;
    let r = reconciler(store);

    let err = r.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::OwnerInfo { .. }));
    let store = r.store();
    assert!(store.all::<ConfigMap>(NS).is_empty());
    assert!(store.all::<Deployment>(NS).is_empty());
    assert_eq!(store.all::<Service>(NS).len(), 1);
    assert_eq!(store.all::<IngressRoute>(NS).len(), 1);

    let status = live_atom(store).await.status.unwrap();
    assert_eq!(status.operation_results["Deployment/dataset-atom"], OperationResult::Error);
    assert_eq!(status.operation_results["Service/dataset-atom"], OperationResult::Created);
    assert!(status.condition(CONDITION_RECONCILED).unwrap().message.contains("not found"));
}

#[tokio::test]
async fn transient_store_failure_is_recorded_and_later_kinds_still_apply() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    store.inject_failure::<Service>(Op::Get, "connection reset");
    let r = reconciler(store);

    let err = r.reconcile(&key()).await.unwrap_err();
    assert!(!err.is_fatal());
    assert_eq!(r.store().all::<PodDisruptionBudget>(NS).len(), 1);
    let status = live_atom(r.store()).await.status.unwrap();
    assert_eq!(status.operation_results["Service/dataset-atom"], OperationResult::Error);

    r.store().clear_failures();
    r.reconcile(&key()).await.unwrap();
    assert_eq!(r.store().all::<Service>(NS).len(), 1);
}

#[tokio::test]
async fn removed_storage_prefix_prunes_its_rewrite() {
    let feed = |links: &[&str]| DatasetFeed {
        technical_name: "roads".into(),
        title: "Roads".into(),
        entries: vec![entry("r1", links)],
        ..Default::default()
    };
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![feed(&["public/a/x.gpkg", "public/b/y.gpkg"])]), true).await;
    let r = reconciler(store);
    r.reconcile(&key()).await.unwrap();
    assert_eq!(r.store().all::<Middleware>(NS).len(), 4);

    let mut atom = live_atom(r.store()).await;
    atom.spec.dataset_feeds = vec![feed(&["public/a/x.gpkg"])];
    r.store().update(&atom).await.unwrap();
    r.reconcile(&key()).await.unwrap();

    let names: Vec<String> = r.store().all::<Middleware>(NS).iter().map(|m| m.name_any()).collect();
    assert_eq!(names, vec!["dataset-atom-cors-headers", "dataset-atom-downloads-0", "dataset-atom-prefix-strip"]);
}

struct FailingHook;

#[async_trait::async_trait]
impl CleanupHook for FailingHook {
    async fn cleanup<S: ResourceStore>(&self, _: &S, _: &Atom) -> Result<(), CleanupError> {
        Err(CleanupError::Store(atom_kubehub::StoreError::Transport("bucket unreachable".into())))
    }
}

#[tokio::test]
async fn failing_cleanup_keeps_owner_until_it_succeeds() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    let r = Reconciler::new(store, YamlTranslator, FailingHook, config());
    r.reconcile(&key()).await.unwrap();

    r.store().delete::<Atom>(NS, "dataset").await.unwrap();
    let err = r.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Finalizer(_)));
    let atom = live_atom(r.store()).await;
    assert!(atom.metadata.deletion_timestamp.is_some());
    assert!(atom.finalizers().iter().any(|f| f == FINALIZER));
    assert_eq!(r.store().all::<Deployment>(NS).len(), 1);

    let status = atom.status.unwrap();
    let cond = status.condition(CONDITION_RECONCILED).unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert_eq!(cond.reason, REASON_ERROR);
    assert!(cond.message.contains("bucket unreachable"));
    assert_eq!(status.operation_results["Deployment/dataset-atom"], OperationResult::Created);
}

#[tokio::test]
async fn finalizer_write_failure_is_reported_on_the_condition() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    store.inject_failure::<Atom>(Op::Update, "etcd timeout");
    let r = reconciler(store);

    let err = r.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Finalizer(_)));
    assert!(r.store().all::<Deployment>(NS).is_empty());
    let atom = live_atom(r.store()).await;
    assert!(!atom.finalizers().iter().any(|f| f == FINALIZER));
    let cond = atom.status.unwrap().condition(CONDITION_RECONCILED).cloned().unwrap();
    assert_eq!(cond.status, ConditionStatus::False);
    assert!(cond.message.contains("adding finalizer"));
    assert!(cond.message.contains("etcd timeout"));
}

#[tokio::test]
async fn deletion_cleans_up_and_releases_owner() {
    let store = MemoryStore::new();
    seed(&store, &atom_with(vec![]), true).await;
    let r = reconciler(store);
    r.reconcile(&key()).await.unwrap();

    // an orphaned holder that lost its owner reference but kept the labels
    let mut orphan = ConfigMap::default();
    orphan.metadata.name = Some("dataset-atom-generator-bcdfghjkmn".into());
    orphan.metadata.namespace = Some(NS.into());
    orphan.metadata.labels = Some(
        [("dataset".to_string(), "dataset".to_string()), ("app".to_string(), "atom-service".to_string())]
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
    );
    r.store().create(&orphan).await.unwrap();

    r.store().delete::<Atom>(NS, "dataset").await.unwrap();
    assert_eq!(r.reconcile(&key()).await.unwrap(), Outcome::Finalized);

    let store = r.store();
    assert!(store.get::<Atom>(NS, "dataset").await.unwrap().is_none());
    assert!(store.all::<ConfigMap>(NS).is_empty());
    assert!(store.all::<Deployment>(NS).is_empty());
    assert!(store.all::<Middleware>(NS).is_empty());
    assert_eq!(r.reconcile(&key()).await.unwrap(), Outcome::Absent);
}
