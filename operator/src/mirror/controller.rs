//! Reconciles CephFilesystemMirror objects into a cephfs-mirror deployment.
use std::{collections::BTreeMap, sync::Arc, time::Duration};

use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::ListParams,
    runtime::{
        controller::Action,
        watcher::{self, Config},
        Controller,
    },
    Api, ResourceExt,
};
use opentelemetry::{global, KeyValue};
use tracing::{debug, error, info};

use crate::{
    cephx::{self, CephxStatus},
    cluster::{CephCluster, EngineVersion, Phase},
    keyring::{self, CephAuth, KEYRING_FILE},
    labels::MANAGED_BY_LABEL_SELECTOR,
    mirror::{
        deployment::fs_mirror_caps, fs_mirror_deployment, min_fs_mirror_version,
        CephFilesystemMirror, FS_MIRROR_APP, FS_MIRROR_ENTITY,
    },
    nodedaemon::controller::UPGRADE_WAIT,
    status,
    utils::{apply_deployment, owner_refs, Context},
    version::{CephVersion, ParseVersionError},
};

/// Requeue while there is no cluster to mirror.
pub const CLUSTER_WAIT: Duration = Duration::from_secs(10);

/// Handle errors during reconciliation.
fn on_error(
    _mirror: Arc<CephFilesystemMirror>,
    _error: &Error,
    _cx: Arc<Context<impl CephAuth>>,
) -> Action {
    Action::requeue(Duration::from_secs(5))
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
    /// The cluster runs an engine without cephfs-mirror.
    #[error("cephfs-mirror needs ceph {minimum} or newer, cluster runs {running}")]
    UnsupportedVersion {
        /// Running version.
        running: CephVersion,
        /// Oldest supported version.
        minimum: CephVersion,
    },
}

/// Start a controller for the CephFilesystemMirror CRD.
pub async fn run<A: CephAuth + 'static>(cx: Arc<Context<A>>) {
    let mirrors: Api<CephFilesystemMirror> = Api::all(cx.k_client.clone());
    let deployments: Api<Deployment> = Api::all(cx.k_client.clone());

    Controller::new(mirrors, Config::default())
        .owns(
            deployments,
            watcher::Config::default().labels(MANAGED_BY_LABEL_SELECTOR),
        )
        .shutdown_on_signal()
        .run(reconcile, on_error, cx)
        .for_each(|rec_res| async move {
            match rec_res {
                Ok((mirror, _)) => {
                    debug!(mirror.name, "reconcile success");
                }
                Err(err) => {
                    error!(?err, "reconcile error")
                }
            }
        })
        .await;
}

/// Perform a reconcile pass for the CephFilesystemMirror CRD
async fn reconcile(
    mirror: Arc<CephFilesystemMirror>,
    cx: Arc<Context<impl CephAuth>>,
) -> Result<Action, Error> {
    let runs = global::meter("nodedaemon")
        .u64_counter("fs_mirror_reconcile_count")
        .with_description("Number of filesystem mirror reconciles")
        .init();
    let result = reconcile_mirror(&mirror, cx.clone()).await;
    match &result {
        Ok(Some(_)) => {}
        Ok(None) => status::report_reconcile(&cx, mirror.as_ref(), None).await,
        Err(err) => status::report_reconcile(&cx, mirror.as_ref(), Some(err)).await,
    }
    let outcome = if result.is_ok() { "ok" } else { "err" };
    runs.add(1, &[KeyValue::new("result", outcome)]);
    Ok(result?
        .map(Action::requeue)
        .unwrap_or_else(Action::await_change))
}

async fn reconcile_mirror(
    mirror: &CephFilesystemMirror,
    cx: Arc<Context<impl CephAuth>>,
) -> Result<Option<Duration>, Error> {
    let ns = mirror.namespace().unwrap_or_default();
    let name = mirror.name_any();
    if mirror.status.is_none() {
        status::set_phase(&cx.k_client, mirror, Phase::Progressing).await?;
    }

    let clusters: Api<CephCluster> = Api::namespaced(cx.k_client.clone(), &ns);
    let clusters = clusters.list(&ListParams::default()).await?;
    let Some(cluster) = clusters.items.first() else {
        info!(ns, name, "no ceph cluster to mirror yet");
        return Ok(Some(CLUSTER_WAIT));
    };

    let (running, desired) = match cluster.engine_version()? {
        EngineVersion::Unknown => {
            info!(ns, name, "ceph version not yet known");
            return Ok(Some(CLUSTER_WAIT));
        }
        EngineVersion::UpgradeInProgress { .. } => {
            info!(ns, name, "ceph upgrade in progress");
            return Ok(Some(UPGRADE_WAIT));
        }
        EngineVersion::Ready { running, desired } => (running, desired),
    };
    if !running.is_at_least(&min_fs_mirror_version()) {
        return Err(Error::UnsupportedVersion {
            running,
            minimum: min_fs_mirror_version(),
        });
    }

    let cfg = &cluster.spec.security.cephx.daemon;
    let prior = mirror
        .cephx_status()
        .cloned()
        .unwrap_or_else(CephxStatus::uninitialized);
    let rotate = cephx::should_rotate(cfg, &running, &desired, &prior, false)?;
    let store = cx.key_store();
    let caps = fs_mirror_caps();
    let key = if rotate {
        info!(ns, entity = FS_MIRROR_ENTITY, "rotating key");
        store.rotate(&ns, FS_MIRROR_ENTITY).await?
    } else {
        store.generate(&ns, FS_MIRROR_ENTITY, &caps).await?
    };
    let keyring = keyring::gen_keyring(FS_MIRROR_ENTITY, &key, &caps)?;
    let key_identifier = store
        .put(
            &ns,
            &keyring::secret_name(FS_MIRROR_APP),
            owner_refs(mirror),
            BTreeMap::from_iter([(KEYRING_FILE.to_owned(), keyring.into_bytes())]),
        )
        .await?;

    let deployment = fs_mirror_deployment(mirror, cluster, &running, &key_identifier);
    apply_deployment(
        cx.clone(),
        &ns,
        owner_refs(mirror),
        &deployment.name,
        deployment.spec,
        Some(deployment.labels),
    )
    .await?;

    let cephx_status = cephx::updated_status(rotate, cfg, &running, &prior, cfg.key_type.as_deref());
    if cephx_status != prior {
        let mirrors: Api<CephFilesystemMirror> = Api::namespaced(cx.k_client.clone(), &ns);
        status::update_status(&mirrors, &name, |mirror| {
            mirror.set_cephx_status(cephx_status.clone());
            true
        })
        .await?;
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    use mockall::predicate::{always, eq};
    use tracing_test::traced_test;

    use crate::{
        keyring::MockCephAuth,
        mirror::{FilesystemMirrorSpec, FilesystemMirrorStatus, LocalCephxStatus},
        nodedaemon::test::cluster,
        utils::test::{timeout_after_1s, ApiServerVerifier},
    };

    const MIRROR: &str =
        "/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephfilesystemmirrors/my-mirror";
    const MIRROR_STATUS: &str =
        "/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephfilesystemmirrors/my-mirror/status";
    const CLUSTERS: &str = "/apis/ceph.rook.io/v1/namespaces/rook-ceph/cephclusters";
    const SECRET: &str = "/api/v1/namespaces/rook-ceph/secrets/rook-ceph-fs-mirror-keyring";
    const DEPLOYMENT: &str = "/apis/apps/v1/namespaces/rook-ceph/deployments/rook-ceph-fs-mirror";

    fn mirror() -> CephFilesystemMirror {
        let mut mirror = CephFilesystemMirror::new("my-mirror", FilesystemMirrorSpec::default());
        mirror.metadata.namespace = Some("rook-ceph".to_owned());
        mirror.metadata.uid = Some("m1rr0r".to_owned());
        mirror.metadata.generation = Some(3);
        mirror
    }

    async fn expect_progressing(fakeserver: &mut ApiServerVerifier, mirror: &CephFilesystemMirror) {
        fakeserver.handle_get(MIRROR, mirror).await;
        let status: CephFilesystemMirror =
            fakeserver.handle_replace_status(MIRROR_STATUS).await.body_as();
        assert_eq!(status.status.unwrap().phase, Some(Phase::Progressing));
    }

    #[tokio::test]
    #[traced_test]
    async fn greenfield_mirror() {
        let mut auth = MockCephAuth::new();
        auth.expect_get_or_create_key()
            .with(eq("rook-ceph"), eq("client.fs-mirror"), always())
            .times(1)
            .returning(|_, _, _| Ok("AQBmirror==".to_owned()));
        let (cx, mut fakeserver) = Context::test(auth);
        let mirror = mirror();
        let cluster = cluster();
        let expected = mirror.clone();
        let mocksrv = tokio::spawn(async move {
            expect_progressing(&mut fakeserver, &expected).await;
            fakeserver
                .handle_list(CLUSTERS, "ceph.rook.io/v1", "CephClusterList", &[cluster])
                .await;
            fakeserver.handle_apply(SECRET, "5").await;
            let deployment: Deployment = fakeserver.handle_apply(DEPLOYMENT, "1").await.body_as();
            let owner = &deployment.metadata.owner_references.unwrap()[0];
            assert_eq!(owner.kind, "CephFilesystemMirror");
            let annotations = deployment
                .spec
                .unwrap()
                .template
                .metadata
                .unwrap()
                .annotations
                .unwrap();
            assert_eq!(
                annotations.get("cephx-key-identifier").map(String::as_str),
                Some("5")
            );

            fakeserver.handle_get(MIRROR, &expected).await;
            let status: CephFilesystemMirror =
                fakeserver.handle_replace_status(MIRROR_STATUS).await.body_as();
            assert_eq!(
                status.cephx_status(),
                Some(&CephxStatus {
                    key_generation: 1,
                    key_ceph_version: "17.2.0-0".to_owned(),
                    key_type: None,
                })
            );

            fakeserver.handle_get(MIRROR, &expected).await;
            let status: CephFilesystemMirror =
                fakeserver.handle_replace_status(MIRROR_STATUS).await.body_as();
            let status = status.status.unwrap();
            assert_eq!(status.phase, Some(Phase::Ready));
            assert_eq!(status.observed_generation, Some(3));
            let event = fakeserver.handle_event("rook-ceph").await;
            assert_eq!(event.body["reason"], "ReconcileSucceeded");
            fakeserver
        });
        reconcile(Arc::new(mirror), cx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await.assert_no_more_requests().await;
    }

    #[tokio::test]
    async fn waits_for_cluster() {
        let (cx, mut fakeserver) = Context::test(MockCephAuth::new());
        let mut mirror = mirror();
        mirror.status = Some(FilesystemMirrorStatus {
            phase: Some(Phase::Progressing),
            ..Default::default()
        });
        let mocksrv = tokio::spawn(async move {
            fakeserver
                .handle_list::<CephCluster>(CLUSTERS, "ceph.rook.io/v1", "CephClusterList", &[])
                .await;
            fakeserver
        });
        let requeue = reconcile_mirror(&mirror, cx).await.expect("reconciler");
        assert_eq!(requeue, Some(CLUSTER_WAIT));
        timeout_after_1s(mocksrv).await.assert_no_more_requests().await;
    }

    #[tokio::test]
    async fn old_engine_is_rejected() {
        let (cx, mut fakeserver) = Context::test(MockCephAuth::new());
        let mut mirror = mirror();
        mirror.status = Some(FilesystemMirrorStatus::default());
        let mut cluster = cluster();
        cluster.spec.ceph_version.image = "quay.io/ceph/ceph:v15.2.17".to_owned();
        if let Some(version) = cluster.status.as_mut().and_then(|s| s.version.as_mut()) {
            version.image = "quay.io/ceph/ceph:v15.2.17".to_owned();
            version.version = "15.2.17-0".to_owned();
        }
        let mocksrv = tokio::spawn(async move {
            fakeserver
                .handle_list(CLUSTERS, "ceph.rook.io/v1", "CephClusterList", &[cluster])
                .await;
            fakeserver
        });
        let err = reconcile_mirror(&mirror, cx).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { .. }), "{err}");
        timeout_after_1s(mocksrv).await.assert_no_more_requests().await;
    }

    #[tokio::test]
    async fn rotation_updates_mirror_status() {
        let mut auth = MockCephAuth::new();
        auth.expect_rotate_key()
            .with(eq("rook-ceph"), eq("client.fs-mirror"))
            .times(1)
            .returning(|_, _| Ok("AQBnext==".to_owned()));
        let (cx, mut fakeserver) = Context::test(auth);
        let mut mirror = mirror();
        mirror.status = Some(FilesystemMirrorStatus {
            phase: Some(Phase::Ready),
            observed_generation: Some(3),
            cephx: Some(LocalCephxStatus {
                daemon: Some(CephxStatus {
                    key_generation: 4,
                    key_ceph_version: "17.2.0-0".to_owned(),
                    key_type: None,
                }),
            }),
        });
        let mut cluster = cluster();
        cluster.spec.security.cephx.daemon.key_rotation_policy = Some("KeyGeneration".to_owned());
        cluster.spec.security.cephx.daemon.key_generation = 5;
        let expected = mirror.clone();
        let mocksrv = tokio::spawn(async move {
            fakeserver
                .handle_list(CLUSTERS, "ceph.rook.io/v1", "CephClusterList", &[cluster])
                .await;
            fakeserver.handle_apply(SECRET, "6").await;
            fakeserver.handle_apply(DEPLOYMENT, "2").await;
            fakeserver.handle_get(MIRROR, &expected).await;
            let status: CephFilesystemMirror =
                fakeserver.handle_replace_status(MIRROR_STATUS).await.body_as();
            assert_eq!(status.cephx_status().map(|s| s.key_generation), Some(5));
            fakeserver
        });
        reconcile_mirror(&mirror, cx).await.expect("reconciler");
        timeout_after_1s(mocksrv).await.assert_no_more_requests().await;
    }
}
