//! Writes of the status subresource.
//!
//! Status is the only object this operator read-modify-writes, so every write goes
//! through [`update_status`] which relies on the resource version for optimistic
//! concurrency and retries on conflict.
use std::{fmt::Debug, time::Duration};

use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::PostParams,
    runtime::events::{Event, EventType},
    Api, Client, Resource, ResourceExt,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::{
    cephx::CephxStatus,
    cluster::{CephCluster, NodeDaemon, Phase},
    keyring::CephAuth,
    mirror::CephFilesystemMirror,
    utils::Context,
};

const MAX_CONFLICT_RETRIES: usize = 5;
const CONFLICT_BACKOFF: Duration = Duration::from_millis(10);

/// Event reason of a failed reconcile.
pub const RECONCILE_FAILED: &str = "ReconcileFailed";
/// Event reason of a successful reconcile.
pub const RECONCILE_SUCCEEDED: &str = "ReconcileSucceeded";

/// Fetch `name`, let `mutate` edit it and replace its status.
///
/// `mutate` returns false when nothing changed, in which case nothing is written.
/// A missing object is not an error.
pub async fn update_status<K, F>(api: &Api<K>, name: &str, mut mutate: F) -> Result<(), kube::Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
    F: FnMut(&mut K) -> bool,
{
    let mut attempt = 1;
    loop {
        let Some(mut obj) = api.get_opt(name).await? else {
            debug!(name, "object is gone, skipping status update");
            return Ok(());
        };
        if !mutate(&mut obj) {
            return Ok(());
        }
        let data = serde_json::to_vec(&obj).map_err(kube::Error::SerdeError)?;
        match api.replace_status(name, &PostParams::default(), data).await {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(err)) if err.code == 409 && attempt < MAX_CONFLICT_RETRIES => {
                debug!(name, attempt, "status update conflict, retrying");
                attempt += 1;
                tokio::time::sleep(CONFLICT_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Record the key status of a node daemon on its cluster.
pub async fn set_cephx_status(
    client: &Client,
    ns: &str,
    cluster: &str,
    daemon: NodeDaemon,
    status: CephxStatus,
) -> Result<(), kube::Error> {
    let clusters: Api<CephCluster> = Api::namespaced(client.clone(), ns);
    update_status(&clusters, cluster, |cluster| {
        cluster.set_cephx_status(daemon, status.clone());
        true
    })
    .await
}

/// Resources that report the outcome of their last reconcile.
pub trait PhaseStatus {
    /// Record `phase` and the generation it applies to, false when already recorded.
    fn record_phase(&mut self, phase: Phase, observed_generation: Option<i64>) -> bool;
}

impl PhaseStatus for CephCluster {
    fn record_phase(&mut self, phase: Phase, observed_generation: Option<i64>) -> bool {
        let status = self.status.get_or_insert_with(Default::default);
        if status.phase == Some(phase) && status.observed_generation == observed_generation {
            return false;
        }
        status.phase = Some(phase);
        status.observed_generation = observed_generation;
        true
    }
}

impl PhaseStatus for CephFilesystemMirror {
    fn record_phase(&mut self, phase: Phase, observed_generation: Option<i64>) -> bool {
        let status = self.status.get_or_insert_with(Default::default);
        if status.phase == Some(phase) && status.observed_generation == observed_generation {
            return false;
        }
        status.phase = Some(phase);
        status.observed_generation = observed_generation;
        true
    }
}

/// Set the phase of `obj` without publishing an event.
pub async fn set_phase<K>(client: &Client, obj: &K, phase: Phase) -> Result<(), kube::Error>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + PhaseStatus
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug,
{
    let api: Api<K> = Api::namespaced(client.clone(), &obj.namespace().unwrap_or_default());
    let generation = obj.meta().generation;
    update_status(&api, &obj.name_any(), |o| o.record_phase(phase, generation)).await
}

/// Record the outcome of a reconcile as phase and event.
///
/// Failures to report are logged, they never change the outcome of the reconcile.
pub async fn report_reconcile<K>(
    cx: &Context<impl CephAuth>,
    obj: &K,
    error: Option<&(dyn std::error::Error + Send + Sync)>,
) where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + PhaseStatus
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug,
{
    let name = obj.name_any();
    let (phase, event) = match error {
        Some(err) => {
            warn!(name, %err, "reconcile failed");
            (
                Phase::Failed,
                Event {
                    type_: EventType::Warning,
                    reason: RECONCILE_FAILED.to_owned(),
                    note: Some(format!("failed to reconcile {name}: {err}")),
                    action: "Reconcile".to_owned(),
                    secondary: None,
                },
            )
        }
        None => (
            Phase::Ready,
            Event {
                type_: EventType::Normal,
                reason: RECONCILE_SUCCEEDED.to_owned(),
                note: Some(format!("successfully reconciled {name}")),
                action: "Reconcile".to_owned(),
                secondary: None,
            },
        ),
    };
    if let Err(err) = set_phase(&cx.k_client, obj, phase).await {
        warn!(name, %err, "failed to update phase");
    }
    if let Err(err) = cx.recorder(obj.object_ref(&())).publish(event).await {
        warn!(name, %err, "failed to publish event");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        cluster::{ClusterSpec, ClusterStatus},
        keyring::MockCephAuth,
        utils::test::timeout_after_1s,
    };

    const CLUSTER_PATH: &str = "/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephclusters/my-cluster";
    const STATUS_PATH: &str =
        "/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephclusters/my-cluster/status";

    fn cluster() -> CephCluster {
        let mut cluster = CephCluster::new("my-cluster", ClusterSpec::default());
        cluster.metadata.namespace = Some("rook-ceph".to_owned());
        cluster.metadata.generation = Some(3);
        cluster.metadata.resource_version = Some("100".to_owned());
        cluster
    }

    #[tokio::test]
    async fn cephx_status_retries_conflicts() {
        let (cx, mut fakeserver) = Context::test(MockCephAuth::new());
        let current = cluster();
        let mocksrv = tokio::spawn(async move {
            fakeserver.handle_get(CLUSTER_PATH, &current).await;
            fakeserver.handle_conflict("PUT", STATUS_PATH).await;
            fakeserver.handle_get(CLUSTER_PATH, &current).await;
            fakeserver.handle_replace_status(STATUS_PATH).await
        });
        set_cephx_status(
            &cx.k_client,
            "rook-ceph",
            "my-cluster",
            NodeDaemon::CrashCollector,
            CephxStatus {
                key_generation: 1,
                key_ceph_version: "17.2.0-0".to_owned(),
                key_type: None,
            },
        )
        .await
        .expect("status should be written");
        let written: CephCluster = timeout_after_1s(mocksrv).await.body_as();
        assert_eq!(
            written.cephx_status(NodeDaemon::CrashCollector),
            Some(&CephxStatus {
                key_generation: 1,
                key_ceph_version: "17.2.0-0".to_owned(),
                key_type: None,
            })
        );
        assert_eq!(
            written.metadata.resource_version.as_deref(),
            Some("100"),
            "writes are guarded by the resource version"
        );
    }

    #[tokio::test]
    async fn conflicts_are_bounded() {
        let (cx, mut fakeserver) = Context::test(MockCephAuth::new());
        let current = cluster();
        let mocksrv = tokio::spawn(async move {
            for _ in 0..MAX_CONFLICT_RETRIES {
                fakeserver.handle_get(CLUSTER_PATH, &current).await;
                fakeserver.handle_conflict("PUT", STATUS_PATH).await;
            }
        });
        let err = set_cephx_status(
            &cx.k_client,
            "rook-ceph",
            "my-cluster",
            NodeDaemon::Exporter,
            CephxStatus::uninitialized(),
        )
        .await
        .expect_err("conflicts should eventually surface");
        assert!(matches!(err, kube::Error::Api(e) if e.code == 409));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn missing_cluster_is_not_an_error() {
        let (cx, mut fakeserver) = Context::test(MockCephAuth::new());
        let mocksrv = tokio::spawn(async move {
            fakeserver.handle_not_found("GET", CLUSTER_PATH).await;
        });
        set_cephx_status(
            &cx.k_client,
            "rook-ceph",
            "my-cluster",
            NodeDaemon::Exporter,
            CephxStatus::uninitialized(),
        )
        .await
        .expect("nothing to do");
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn unchanged_phase_is_not_written() {
        let (cx, mut fakeserver) = Context::test(MockCephAuth::new());
        let mut current = cluster();
        current.status = Some(ClusterStatus {
            phase: Some(Phase::Ready),
            observed_generation: Some(3),
            ..Default::default()
        });
        let obj = current.clone();
        let mocksrv = tokio::spawn(async move {
            fakeserver.handle_get(CLUSTER_PATH, &current).await;
            fakeserver.assert_no_more_requests().await;
        });
        set_phase(&cx.k_client, &obj, Phase::Ready)
            .await
            .expect("phase should be set");
        drop(cx);
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn failure_is_reported() {
        let (cx, mut fakeserver) = Context::test(MockCephAuth::new());
        let current = cluster();
        let obj = current.clone();
        let mocksrv = tokio::spawn(async move {
            fakeserver.handle_get(CLUSTER_PATH, &current).await;
            let status = fakeserver.handle_replace_status(STATUS_PATH).await;
            let event = fakeserver.handle_event("rook-ceph").await;
            (status, event)
        });
        let err = anyhow::anyhow!("ceph auth get-or-create-key failed");
        report_reconcile(&cx, &obj, Some(&*err)).await;
        let (status, event) = timeout_after_1s(mocksrv).await;

        let written: CephCluster = status.body_as();
        let status = written.status.expect("status");
        assert_eq!(status.phase, Some(Phase::Failed));
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(event.body["reason"], "ReconcileFailed");
        assert_eq!(event.body["type"], "Warning");
        assert_eq!(event.body["regarding"]["name"], "my-cluster");
    }
}
