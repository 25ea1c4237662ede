use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::DeploymentSpec,
        core::v1::{Container, PodSecurityContext, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{core::ObjectMeta, ResourceExt};

use crate::{
    cluster::NodeDaemon,
    labels::{node_daemon_labels, CEPH_VERSION_LABEL, CLUSTER_LABEL, HOSTNAME_LABEL},
};

use super::{
    pod::{
        ceph_args_env, ceph_security_context, chown_init_container, dataless_volumes,
        host_networking, keyring_path, keyring_volume, mon_env, node_hostname, pod_labels,
        root_security_context, tolerations, truncated_name, SERVICE_ACCOUNT,
    },
    BuildError, DaemonDeployment, NodeDaemonInputs, CRASH_COLLECTOR_APP,
    KEY_IDENTIFIER_ANNOTATION,
};

const CRASH_DIR: &str = "/var/lib/ceph/crash";
const LOG_DIR: &str = "/var/log/ceph";

/// Crash collector deployment pinned to the node of `inputs`.
pub fn crash_collector_deployment(
    inputs: &NodeDaemonInputs,
) -> Result<DaemonDeployment, BuildError> {
    let daemon = NodeDaemon::CrashCollector;
    let cluster = inputs.cluster;
    let hostname = node_hostname(inputs.node)?;
    let selector = node_daemon_labels(CRASH_COLLECTOR_APP, &hostname, &inputs.node.name_any());

    let mut labels = pod_labels(cluster.labels_for(daemon.component()), &selector);
    labels.insert(
        CLUSTER_LABEL.to_owned(),
        cluster.namespace().unwrap_or_default(),
    );
    let mut annotations = cluster.annotations_for(daemon.component());
    annotations.insert(
        KEY_IDENTIFIER_ANNOTATION.to_owned(),
        inputs.key_identifier.to_owned(),
    );

    let (mut volumes, mut mounts) = dataless_volumes(cluster);
    let (keyring, keyring_mount) = keyring_volume(&daemon.secret_name(), daemon.keyring_dir());
    volumes.push(keyring);
    let dir_mounts = mounts.clone();
    mounts.push(keyring_mount);

    let mut env = mon_env();
    env.push(ceph_args_env(&keyring_path(daemon.keyring_dir())));

    let image = Some(cluster.spec.ceph_version.image.clone());
    let image_pull_policy = cluster.spec.ceph_version.image_pull_policy.clone();
    let (host_network, dns_policy) = host_networking(cluster);

    let mut deployment_labels = selector.clone();
    deployment_labels.insert(CEPH_VERSION_LABEL.to_owned(), inputs.version.to_string());

    Ok(DaemonDeployment {
        name: truncated_name(CRASH_COLLECTOR_APP, &hostname),
        labels: deployment_labels,
        spec: DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    init_containers: Some(vec![
                        Container {
                            name: "make-container-crash-dir".to_owned(),
                            image: image.clone(),
                            image_pull_policy: image_pull_policy.clone(),
                            command: Some(vec!["mkdir".to_owned(), "-p".to_owned()]),
                            args: Some(vec![format!("{CRASH_DIR}/posted")]),
                            volume_mounts: Some(dir_mounts.clone()),
                            security_context: Some(root_security_context()),
                            ..Default::default()
                        },
                        chown_init_container(cluster, &[LOG_DIR, CRASH_DIR], dir_mounts),
                    ]),
                    containers: vec![Container {
                        name: "ceph-crash".to_owned(),
                        image,
                        image_pull_policy,
                        command: Some(vec!["ceph-crash".to_owned()]),
                        env: Some(env),
                        volume_mounts: Some(mounts),
                        security_context: Some(ceph_security_context()),
                        resources: cluster.resources_for(daemon.component()),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    host_network,
                    dns_policy,
                    node_selector: Some(BTreeMap::from_iter([(
                        HOSTNAME_LABEL.to_owned(),
                        hostname,
                    )])),
                    tolerations: tolerations(inputs.tolerations),
                    priority_class_name: cluster.priority_class_name_for(daemon.component()),
                    restart_policy: Some("Always".to_owned()),
                    security_context: Some(PodSecurityContext::default()),
                    service_account_name: Some(SERVICE_ACCOUNT.to_owned()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        },
    })
}
