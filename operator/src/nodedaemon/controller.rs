//! Reconciles the crash collector and exporter of every node hosting storage pods.
//!
//! Requests are keyed by node name. Node, storage pod and daemon deployment events all map
//! onto the node they concern. Deleted nodes stay in the node store as tombstones carrying a
//! deletion timestamp, so their reconcile runs under the same key, finds the node gone and
//! removes its daemons from every namespace.
use std::{
    collections::{hash_map::DefaultHasher, BTreeMap, BTreeSet, HashMap, HashSet},
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};

use futures::{channel::mpsc, future, stream::StreamExt, TryStreamExt};
use k8s_openapi::{
    api::{
        apps::v1::Deployment,
        core::v1::{Node, Pod, Secret, Toleration},
    },
    apimachinery::pkg::apis::meta::v1::Time,
    chrono::Utc,
};
use kube::{
    api::{DeleteParams, ListParams, Patch, PatchParams},
    runtime::{
        controller::Action,
        reflector::{self, ObjectRef, Store},
        watcher, Controller, WatchStreamExt,
    },
    Api, ResourceExt,
};
use opentelemetry::{global, KeyValue};
use tracing::{debug, error, info, warn};

use crate::{
    cephx::{self, CephxStatus},
    cluster::{CephCluster, EngineVersion, NodeDaemon, Phase},
    keyring::{self, CephAuth, KEYRING_FILE},
    labels::{app_selector, APP_LABEL, CLUSTER_LABEL, NODE_NAME_LABEL},
    monitoring::ServiceMonitor,
    nodedaemon::{
        metrics_service_spec, min_exporter_version, pruner, service_monitor, BuildError,
        NodeDaemonInputs, CRASH_COLLECTOR_APP, EXPORTER_APP, EXPORTER_SERVICE_NAME,
    },
    status::{self, set_cephx_status},
    utils::{apply_deployment, apply_service, delete_deployment, delete_service, owner_refs, Context},
    version::{CephVersion, ParseVersionError},
    CONTROLLER_NAME,
};

/// Requeue while the crash collector keyring secret does not exist yet.
pub const KEYRING_WAIT: Duration = Duration::from_secs(30);
/// Requeue while the cluster runs a different image than requested.
pub const UPGRADE_WAIT: Duration = Duration::from_secs(120);
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

// Pods carrying the cluster label that are not storage daemons.
const NON_STORAGE_POD_MARKERS: [&str; 3] = ["-canary-", "-crashcollector-", "-exporter-"];

/// Handle errors during reconciliation.
fn on_error(_node: Arc<Node>, _error: &Error, _cx: Arc<Context<impl CephAuth>>) -> Action {
    Action::requeue(ERROR_REQUEUE)
}

/// Errors produced by the reconcile function.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Key backend failure.
    #[error("App error: {source}")]
    App {
        /// Backend error.
        #[from]
        source: anyhow::Error,
    },
    /// Orchestrator API failure.
    #[error("Kube error: {source}")]
    Kube {
        /// Api error.
        #[from]
        source: kube::Error,
    },
    /// The desired deployment could not be built.
    #[error("Build error: {source}")]
    Build {
        /// Builder error.
        #[from]
        source: BuildError,
    },
    /// Invalid key rotation settings.
    #[error("Cephx error: {source}")]
    Cephx {
        /// Policy error.
        #[from]
        source: cephx::Error,
    },
    /// The keyring could not be rendered.
    #[error("Keyring error: {source}")]
    Keyring {
        /// Rendering error.
        #[from]
        source: keyring::Error,
    },
    /// The recorded engine version is malformed.
    #[error("Version error: {source}")]
    Version {
        /// Parse error.
        #[from]
        source: ParseVersionError,
    },
}

/// Start the node daemon controller.
pub async fn run<A: CephAuth + 'static>(cx: Arc<Context<A>>) {
    let client = cx.k_client.clone();
    let nodes: Api<Node> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());

    let (reader, writer) = reflector::store();
    let known = reader.clone();
    let node_stream = reflector::reflector(
        writer,
        watcher(nodes, watcher::Config::default()).map_ok(move |event| tombstone(&known, event)),
    )
    .applied_objects()
    .predicate_filter(node_hash);

    let mut placements = HashMap::new();
    let pod_stream = watcher(pods, watcher::Config::default().labels(CLUSTER_LABEL))
        .touched_objects()
        .try_filter(move |pod| future::ready(placement_changed(&mut placements, pod)));

    let (rollout_tx, rollout_rx) = mpsc::unbounded::<ObjectRef<Node>>();

    let daemon_selector = format!("{APP_LABEL} in ({CRASH_COLLECTOR_APP},{EXPORTER_APP})");
    Controller::for_stream(node_stream, reader)
        .watches(
            deployments,
            watcher::Config::default().labels(&daemon_selector),
            deployment_to_node,
        )
        .watches_stream(pod_stream, pod_to_node)
        .reconcile_on(rollout_rx)
        .shutdown_on_signal()
        .run(
            move |node, cx| reconcile(node, cx, rollout_tx.clone()),
            on_error,
            cx,
        )
        .for_each(|rec_res| async move {
            match rec_res {
                Ok((node, _)) => {
                    debug!(node.name, "reconcile success");
                }
                Err(err) => {
                    error!(?err, "reconcile error")
                }
            }
        })
        .await;
}

/// Keep deleted nodes in the store as tombstones so their reconcile is scheduled like any
/// other. A relist drops old tombstones and tombstones live nodes that vanished meanwhile.
fn tombstone(known: &Store<Node>, event: watcher::Event<Node>) -> watcher::Event<Node> {
    match event {
        watcher::Event::Deleted(node) => watcher::Event::Applied(mark_deleted(node)),
        watcher::Event::Restarted(mut nodes) => {
            let listed: HashSet<String> = nodes.iter().map(ResourceExt::name_any).collect();
            let vanished: Vec<Node> = known
                .state()
                .into_iter()
                .filter(|node| node.metadata.deletion_timestamp.is_none())
                .filter(|node| !listed.contains(&node.name_any()))
                .map(|node| mark_deleted(node.as_ref().clone()))
                .collect();
            nodes.extend(vanished);
            watcher::Event::Restarted(nodes)
        }
        applied => applied,
    }
}

fn mark_deleted(mut node: Node) -> Node {
    node.metadata
        .deletion_timestamp
        .get_or_insert_with(|| Time(Utc::now()));
    node
}

// Node changes that matter: spec, labels and deletion, never status.
fn node_hash(node: &Node) -> Option<u64> {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(&node.spec).ok()?.hash(&mut hasher);
    node.metadata.labels.hash(&mut hasher);
    node.metadata.deletion_timestamp.is_some().hash(&mut hasher);
    Some(hasher.finish())
}

/// True for pods of storage daemons: labelled with the cluster and not a helper pod.
pub fn is_storage_pod(pod: &Pod) -> bool {
    let name = pod.name_any();
    pod.labels().contains_key(CLUSTER_LABEL)
        && !NON_STORAGE_POD_MARKERS
            .iter()
            .any(|marker| name.contains(marker))
}

fn pod_node(pod: &Pod) -> Option<&str> {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref())
}

// Passes pods that are new, moved to another node or are being deleted.
fn placement_changed(placements: &mut HashMap<String, Option<String>>, pod: &Pod) -> bool {
    let key = format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any());
    if pod.metadata.deletion_timestamp.is_some() {
        placements.remove(&key);
        return true;
    }
    let node = pod_node(pod).map(str::to_owned);
    match placements.insert(key, node.clone()) {
        Some(previous) => previous != node,
        None => true,
    }
}

fn pod_to_node(pod: Pod) -> Option<ObjectRef<Node>> {
    if !is_storage_pod(&pod) {
        return None;
    }
    pod_node(&pod).map(ObjectRef::new)
}

fn deployment_to_node(deployment: Deployment) -> Option<ObjectRef<Node>> {
    deployment
        .labels()
        .get(NODE_NAME_LABEL)
        .map(|node| ObjectRef::new(node))
}

/// Perform a reconcile pass for a node
async fn reconcile(
    node: Arc<Node>,
    cx: Arc<Context<impl CephAuth>>,
    rollout: mpsc::UnboundedSender<ObjectRef<Node>>,
) -> Result<Action, Error> {
    let runs = global::meter("nodedaemon")
        .u64_counter("nodedaemon_reconcile_count")
        .with_description("Number of node daemon reconciles")
        .init();
    match reconcile_node(&node.name_any(), cx).await {
        Ok(pass) => {
            runs.add(1, &[KeyValue::new("result", "ok")]);
            for peer in pass.rollout {
                debug!(node = peer, "rolling out rotated key");
                // The receiver only goes away on shutdown.
                let _ = rollout.unbounded_send(ObjectRef::new(&peer));
            }
            Ok(pass
                .requeue
                .map(Action::requeue)
                .unwrap_or_else(Action::await_change))
        }
        Err(err) => {
            runs.add(1, &[KeyValue::new("result", "err")]);
            Err(err)
        }
    }
}

/// Outcome of a node pass.
#[derive(Debug, Default, PartialEq)]
pub struct NodePass {
    /// Delay before the node must be reconciled again, if any.
    pub requeue: Option<Duration>,
    /// Other nodes whose daemons must pick up a key rotated by this pass.
    pub rollout: BTreeSet<String>,
}

/// Bring the daemons of node `name` in line with every cluster that has storage pods.
///
/// A failing namespace does not stop the others, the first error is returned once all
/// namespaces were visited.
pub async fn reconcile_node(name: &str, cx: Arc<Context<impl CephAuth>>) -> Result<NodePass, Error> {
    let nodes: Api<Node> = Api::all(cx.k_client.clone());
    let Some(node) = nodes.get_opt(name).await? else {
        remove_node_daemons(cx, name).await?;
        return Ok(NodePass::default());
    };

    let pods: Api<Pod> = Api::all(cx.k_client.clone());
    let pods = pods
        .list(&ListParams::default().labels(CLUSTER_LABEL))
        .await?;
    let mut by_namespace: BTreeMap<String, Vec<Pod>> = BTreeMap::new();
    for pod in pods.items.into_iter().filter(is_storage_pod) {
        by_namespace
            .entry(pod.namespace().unwrap_or_default())
            .or_default()
            .push(pod);
    }

    let mut pass = NodePass::default();
    let mut first_err = None;
    for (ns, pods) in by_namespace {
        match reconcile_namespace(cx.clone(), &node, &ns, &pods).await {
            Ok(ns_pass) => {
                pass.requeue = sooner(pass.requeue, ns_pass.requeue);
                pass.rollout.extend(ns_pass.rollout);
            }
            Err(err) => {
                error!(ns, node = name, %err, "failed to reconcile node daemons");
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(pass),
    }
}

fn sooner(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

async fn reconcile_namespace(
    cx: Arc<Context<impl CephAuth>>,
    node: &Node,
    ns: &str,
    pods: &[Pod],
) -> Result<NodePass, Error> {
    let clusters: Api<CephCluster> = Api::namespaced(cx.k_client.clone(), ns);
    let clusters = clusters.list(&ListParams::default()).await?;
    let Some(cluster) = clusters.items.first() else {
        debug!(ns, "no ceph cluster in namespace");
        return Ok(NodePass::default());
    };
    if clusters.items.len() > 1 {
        warn!(
            ns,
            count = clusters.items.len(),
            cluster = cluster.name_any(),
            "multiple ceph clusters in namespace, using the first"
        );
    }

    let result = reconcile_cluster(cx.clone(), node, cluster, pods).await;
    match &result {
        Ok(pass) if pass.requeue.is_some() => {
            if let Err(err) = status::set_phase(&cx.k_client, cluster, Phase::Progressing).await {
                warn!(ns, %err, "failed to update phase");
            }
        }
        Ok(_) => status::report_reconcile(&cx, cluster, None).await,
        Err(err) => status::report_reconcile(&cx, cluster, Some(err)).await,
    }
    result
}

// `pods` are the storage pods of the cluster namespace on every node.
async fn reconcile_cluster(
    cx: Arc<Context<impl CephAuth>>,
    node: &Node,
    cluster: &CephCluster,
    pods: &[Pod],
) -> Result<NodePass, Error> {
    let ns = cluster.namespace().unwrap_or_default();
    let node_name = node.name_any();
    let crash_enabled = !cluster.spec.crash_collector.disable;
    let exporter_enabled = cluster.spec.monitoring.enabled;

    if !exporter_enabled {
        delete_daemons(cx.clone(), &ns, EXPORTER_APP, None).await?;
        delete_service(cx.clone(), &ns, EXPORTER_SERVICE_NAME).await?;
        delete_service_monitor(cx.clone(), &ns).await?;
    }
    if !crash_enabled {
        delete_daemons(cx.clone(), &ns, CRASH_COLLECTOR_APP, None).await?;
        pruner::delete_pruner(cx.clone(), &ns).await?;
    }
    if !crash_enabled && !exporter_enabled {
        debug!(ns, "node daemons disabled");
        return Ok(NodePass::default());
    }

    let secrets: Api<Secret> = Api::namespaced(cx.k_client.clone(), &ns);
    let crash_secret = NodeDaemon::CrashCollector.secret_name();
    if secrets.get_opt(&crash_secret).await?.is_none() {
        info!(ns, secret = crash_secret, "waiting for crash collector keyring");
        return Ok(NodePass {
            requeue: Some(KEYRING_WAIT),
            ..Default::default()
        });
    }

    let (running, desired) = match cluster.engine_version()? {
        EngineVersion::Unknown => {
            info!(ns, "ceph version not yet known");
            return Ok(NodePass::default());
        }
        EngineVersion::UpgradeInProgress {
            running_image,
            desired_image,
        } => {
            info!(ns, running_image, desired_image, "ceph upgrade in progress");
            return Ok(NodePass {
                requeue: Some(UPGRADE_WAIT),
                ..Default::default()
            });
        }
        EngineVersion::Ready { running, desired } => (running, desired),
    };

    let on_node: Vec<&Pod> = pods
        .iter()
        .filter(|pod| pod_node(pod) == Some(node_name.as_str()))
        .collect();
    if on_node.is_empty() {
        for app in [CRASH_COLLECTOR_APP, EXPORTER_APP] {
            delete_daemons(cx.clone(), &ns, app, Some(&node_name)).await?;
        }
        return Ok(NodePass::default());
    }

    let tolerations = toleration_union(&on_node);
    let versions = (&running, &desired);
    let mut rotated = false;
    if crash_enabled {
        rotated |= reconcile_daemon(
            cx.clone(),
            cluster,
            node,
            &tolerations,
            versions,
            NodeDaemon::CrashCollector,
        )
        .await?;
    }
    if exporter_enabled {
        if running.is_at_least(&min_exporter_version()) {
            rotated |= reconcile_daemon(
                cx.clone(),
                cluster,
                node,
                &tolerations,
                versions,
                NodeDaemon::Exporter,
            )
            .await?;
            apply_metrics(cx.clone(), cluster).await?;
        } else {
            debug!(ns, %running, "ceph version does not ship the exporter");
            delete_daemons(cx.clone(), &ns, EXPORTER_APP, Some(&node_name)).await?;
        }
    }
    if crash_enabled {
        pruner::reconcile_pruner(cx.clone(), cluster).await?;
    }

    let mut pass = NodePass::default();
    if rotated {
        pass.rollout = pods
            .iter()
            .filter_map(pod_node)
            .filter(|peer| *peer != node_name)
            .map(str::to_owned)
            .collect();
    }
    Ok(pass)
}

/// Union of the tolerations of `pods` in a stable order.
pub fn toleration_union(pods: &[&Pod]) -> Vec<Toleration> {
    let mut union: Vec<Toleration> = Vec::new();
    let all = pods
        .iter()
        .filter_map(|pod| pod.spec.as_ref()?.tolerations.as_ref())
        .flatten();
    for toleration in all {
        if !union.contains(toleration) {
            union.push(toleration.clone());
        }
    }
    union.sort_by_key(|t| {
        (
            t.key.clone(),
            t.operator.clone(),
            t.value.clone(),
            t.effect.clone(),
            t.toleration_seconds,
        )
    });
    union
}

// Key, keyring secret, deployment and key status of one daemon on one node, in that order.
// Returns whether the key was rotated.
async fn reconcile_daemon(
    cx: Arc<Context<impl CephAuth>>,
    cluster: &CephCluster,
    node: &Node,
    tolerations: &[Toleration],
    (running, desired): (&CephVersion, &CephVersion),
    daemon: NodeDaemon,
) -> Result<bool, Error> {
    let ns = cluster.namespace().unwrap_or_default();
    let cfg = &cluster.spec.security.cephx.daemon;
    let prior = cluster
        .cephx_status(daemon)
        .cloned()
        .unwrap_or_else(CephxStatus::uninitialized);
    let rotate = cephx::should_rotate(cfg, running, desired, &prior, false)?;

    let store = cx.key_store();
    let entity = daemon.entity();
    let key = if rotate {
        info!(ns, entity, "rotating key");
        store.rotate(&ns, entity).await?
    } else {
        store.generate(&ns, entity, &daemon.caps()).await?
    };
    let keyring = keyring::gen_keyring(entity, &key, &daemon.caps())?;
    let key_identifier = store
        .put(
            &ns,
            &daemon.secret_name(),
            owner_refs(cluster),
            BTreeMap::from_iter([(KEYRING_FILE.to_owned(), keyring.into_bytes())]),
        )
        .await?;

    let deployment = daemon.build(&NodeDaemonInputs {
        cluster,
        node,
        tolerations,
        version: running,
        key_identifier: &key_identifier,
    })?;
    apply_deployment(
        cx.clone(),
        &ns,
        owner_refs(cluster),
        &deployment.name,
        deployment.spec,
        Some(deployment.labels),
    )
    .await?;
    debug!(ns, name = deployment.name, "applied node daemon");

    let status = cephx::updated_status(rotate, cfg, running, &prior, cfg.key_type.as_deref());
    if status != prior {
        set_cephx_status(&cx.k_client, &ns, &cluster.name_any(), daemon, status).await?;
    }
    Ok(rotate)
}

async fn apply_metrics(
    cx: Arc<Context<impl CephAuth>>,
    cluster: &CephCluster,
) -> Result<(), kube::Error> {
    let ns = cluster.namespace().unwrap_or_default();
    let (spec, labels) = metrics_service_spec(cluster);
    apply_service(
        cx.clone(),
        &ns,
        owner_refs(cluster),
        EXPORTER_SERVICE_NAME,
        spec,
        Some(labels),
    )
    .await?;
    if !cluster.spec.monitoring.enable_service_monitor {
        return Ok(());
    }
    let monitors: Api<ServiceMonitor> = Api::namespaced(cx.k_client.clone(), &ns);
    match monitors
        .patch(
            EXPORTER_SERVICE_NAME,
            &PatchParams::apply(CONTROLLER_NAME),
            &Patch::Apply(service_monitor(cluster)),
        )
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => {
            warn!(ns, "ServiceMonitor resource is not installed, skipping");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn delete_service_monitor(
    cx: Arc<Context<impl CephAuth>>,
    ns: &str,
) -> Result<(), kube::Error> {
    let monitors: Api<ServiceMonitor> = Api::namespaced(cx.k_client.clone(), ns);
    match monitors
        .delete(EXPORTER_SERVICE_NAME, &DeleteParams::default())
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}

// Delete the daemons of `app` in `ns`, limited to one node when given.
async fn delete_daemons(
    cx: Arc<Context<impl CephAuth>>,
    ns: &str,
    app: &str,
    node: Option<&str>,
) -> Result<(), kube::Error> {
    let deployments: Api<Deployment> = Api::namespaced(cx.k_client.clone(), ns);
    let existing = deployments
        .list(&ListParams::default().labels(&app_selector(app, node)))
        .await?;
    for deployment in existing {
        let name = deployment.name_any();
        info!(ns, name, "deleting node daemon");
        delete_deployment(cx.clone(), ns, &name).await?;
    }
    Ok(())
}

// The node is gone, remove its daemons from every namespace.
async fn remove_node_daemons(
    cx: Arc<Context<impl CephAuth>>,
    node: &str,
) -> Result<(), kube::Error> {
    let deployments: Api<Deployment> = Api::all(cx.k_client.clone());
    for app in [CRASH_COLLECTOR_APP, EXPORTER_APP] {
        let existing = deployments
            .list(&ListParams::default().labels(&app_selector(app, Some(node))))
            .await?;
        for deployment in existing {
            let ns = deployment.namespace().unwrap_or_default();
            let name = deployment.name_any();
            info!(ns, name, node, "deleting daemon of removed node");
            delete_deployment(cx.clone(), &ns, &name).await?;
        }
    }
    Ok(())
}
