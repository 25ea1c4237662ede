//! Daily CronJob pruning old crash reports.
//!
//! Clusters older than 1.21 only serve batch/v1beta1 CronJobs, so the flavor is picked
//! from the server version and the other flavor is removed.
use std::sync::Arc;

use k8s_openapi::{
    api::{
        batch::v1::{CronJob, CronJobSpec, JobSpec, JobTemplateSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::{apis::meta::v1::OwnerReference, version::Info},
};
use kube::{
    api::{ApiResource, DeleteParams, DynamicObject, GroupVersionKind, Patch, PatchParams},
    core::ObjectMeta,
    Api, ResourceExt,
};
use tracing::{debug, info};

use crate::{
    cluster::{CephCluster, NodeDaemon},
    keyring::CephAuth,
    labels::{managed_labels_extend, selector_labels},
    utils::{owner_refs, Context},
    CONTROLLER_NAME,
};

use super::pod::{ceph_args_env, keyring_path, keyring_volume, mon_env, SERVICE_ACCOUNT};

/// Name of the pruner CronJob.
pub const PRUNER_NAME: &str = "rook-ceph-crashcollector-pruner";
const SCHEDULE: &str = "0 0 * * *";
const STARTING_DEADLINE_SECONDS: i64 = 60;

/// Which batch API serves the CronJob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronJobFlavor {
    /// batch/v1
    V1,
    /// batch/v1beta1
    V1Beta1,
}

impl CronJobFlavor {
    /// Flavor served by a cluster, batch/v1 when the version is unreadable.
    pub fn for_server(info: &Info) -> Self {
        match server_version(info) {
            Some(version) if version < (1, 21, 0) => CronJobFlavor::V1Beta1,
            _ => CronJobFlavor::V1,
        }
    }

    fn other(self) -> Self {
        match self {
            CronJobFlavor::V1 => CronJobFlavor::V1Beta1,
            CronJobFlavor::V1Beta1 => CronJobFlavor::V1,
        }
    }

    fn api_resource(self) -> ApiResource {
        let version = match self {
            CronJobFlavor::V1 => "v1",
            CronJobFlavor::V1Beta1 => "v1beta1",
        };
        ApiResource::from_gvk_with_plural(
            &GroupVersionKind::gvk("batch", version, "CronJob"),
            "cronjobs",
        )
    }
}

fn server_version(info: &Info) -> Option<(u32, u32, u32)> {
    let release = info
        .git_version
        .trim_start_matches('v')
        .split(|c| c == '-' || c == '+')
        .next()
        .unwrap_or_default();
    let mut parts = release.split('.').map(|part| part.parse::<u32>().ok());
    if let (Some(Some(major)), Some(Some(minor))) = (parts.next(), parts.next()) {
        return Some((major, minor, parts.next().flatten().unwrap_or(0)));
    }
    // Some distributions report minor versions like "20+".
    let digits = |s: &str| -> Option<u32> {
        s.chars()
            .take_while(char::is_ascii_digit)
            .collect::<String>()
            .parse()
            .ok()
    };
    Some((digits(&info.major)?, digits(&info.minor)?, 0))
}

/// CronJob spec pruning crash reports older than `days_to_retain`.
pub fn pruner_spec(cluster: &CephCluster, days_to_retain: u32) -> CronJobSpec {
    let daemon = NodeDaemon::CrashCollector;
    let (keyring, keyring_mount) = keyring_volume(&daemon.secret_name(), daemon.keyring_dir());
    let mut env = mon_env();
    env.push(ceph_args_env(&keyring_path(daemon.keyring_dir())));
    CronJobSpec {
        schedule: SCHEDULE.to_owned(),
        starting_deadline_seconds: Some(STARTING_DEADLINE_SECONDS),
        job_template: JobTemplateSpec {
            spec: Some(JobSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: selector_labels(PRUNER_NAME),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "ceph-crash-pruner".to_owned(),
                            image: Some(cluster.spec.ceph_version.image.clone()),
                            image_pull_policy: cluster
                                .spec
                                .ceph_version
                                .image_pull_policy
                                .clone(),
                            command: Some(vec![
                                "ceph".to_owned(),
                                "-n".to_owned(),
                                daemon.entity().to_owned(),
                                "crash".to_owned(),
                                "prune".to_owned(),
                                days_to_retain.to_string(),
                            ]),
                            env: Some(env),
                            volume_mounts: Some(vec![keyring_mount]),
                            resources: cluster.resources_for(daemon.component()),
                            ..Default::default()
                        }],
                        volumes: Some(vec![keyring]),
                        restart_policy: Some("Never".to_owned()),
                        priority_class_name: cluster.priority_class_name_for(daemon.component()),
                        service_account_name: Some(SERVICE_ACCOUNT.to_owned()),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn cron_job(ns: &str, orefs: Vec<OwnerReference>, spec: CronJobSpec) -> CronJob {
    CronJob {
        metadata: ObjectMeta {
            name: Some(PRUNER_NAME.to_owned()),
            namespace: Some(ns.to_owned()),
            owner_references: Some(orefs),
            labels: managed_labels_extend(selector_labels(PRUNER_NAME)),
            ..Default::default()
        },
        spec: Some(spec),
        ..Default::default()
    }
}

/// Run the pruner when crash collection is enabled with a retention, remove it otherwise.
pub async fn reconcile_pruner(
    cx: Arc<Context<impl CephAuth>>,
    cluster: &CephCluster,
) -> Result<(), kube::Error> {
    let ns = cluster.namespace().unwrap_or_default();
    let crash = &cluster.spec.crash_collector;
    if crash.disable || crash.days_to_retain == 0 {
        return delete_pruner(cx, &ns).await;
    }

    let info = cx.k_client.apiserver_version().await?;
    let flavor = CronJobFlavor::for_server(&info);
    delete_cron_job(cx.clone(), &ns, flavor.other()).await?;

    let ar = flavor.api_resource();
    let cron_job = cron_job(
        &ns,
        owner_refs(cluster),
        pruner_spec(cluster, crash.days_to_retain),
    );
    let mut obj = DynamicObject::new(PRUNER_NAME, &ar)
        .within(&ns)
        .data(serde_json::json!({ "spec": cron_job.spec }));
    obj.metadata = cron_job.metadata;
    let api: Api<DynamicObject> = Api::namespaced_with(cx.k_client.clone(), &ns, &ar);
    api.patch(
        PRUNER_NAME,
        &PatchParams::apply(CONTROLLER_NAME),
        &Patch::Apply(&obj),
    )
    .await?;
    debug!(ns, ?flavor, "applied crash pruner");
    Ok(())
}

/// Remove the pruner of both flavors.
pub async fn delete_pruner(
    cx: Arc<Context<impl CephAuth>>,
    ns: &str,
) -> Result<(), kube::Error> {
    delete_cron_job(cx.clone(), ns, CronJobFlavor::V1).await?;
    delete_cron_job(cx, ns, CronJobFlavor::V1Beta1).await
}

async fn delete_cron_job(
    cx: Arc<Context<impl CephAuth>>,
    ns: &str,
    flavor: CronJobFlavor,
) -> Result<(), kube::Error> {
    let api: Api<DynamicObject> =
        Api::namespaced_with(cx.k_client.clone(), ns, &flavor.api_resource());
    match api.delete(PRUNER_NAME, &DeleteParams::default()).await {
        Ok(_) => {
            info!(ns, ?flavor, "deleted crash pruner");
            Ok(())
        }
        Err(kube::Error::Api(err)) if err.reason == "NotFound" => Ok(()),
        Err(e) => Err(e),
    }
}
