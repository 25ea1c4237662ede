use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{DeploymentSpec, DeploymentStrategy},
        core::v1::{
            Container, ContainerPort, PodSecurityContext, PodSpec, PodTemplateSpec, ServicePort,
            ServiceSpec,
        },
    },
    apimachinery::pkg::{apis::meta::v1::LabelSelector, util::intstr::IntOrString},
};
use kube::{core::ObjectMeta, Resource, ResourceExt};

use crate::{
    cluster::{CephCluster, NetworkMode, NodeDaemon},
    labels::{
        node_daemon_labels, APP_LABEL, CEPH_VERSION_LABEL, CLUSTER_LABEL, HOSTNAME_LABEL,
        MANAGED_BY_CLUSTER_LABEL,
    },
    monitoring::{
        service_monitor_labels, Endpoint, NamespaceSelector, RelabelConfig, ServiceMonitor,
        ServiceMonitorSpec,
    },
};

use super::{
    pod::{
        ceph_args_env, ceph_security_context, dataless_volumes, host_networking,
        host_path_volume, keyring_path, keyring_volume, mon_env, node_hostname, pod_labels,
        tolerations, truncated_name, SERVICE_ACCOUNT,
    },
    BuildError, DaemonDeployment, NodeDaemonInputs, EXPORTER_APP, KEY_IDENTIFIER_ANNOTATION,
};

/// Port the exporter serves metrics on.
pub const EXPORTER_PORT: i32 = 9926;
/// Name of the metrics port.
pub const EXPORTER_PORT_NAME: &str = "ceph-exporter-http-metrics";
/// Name of the metrics service and service monitor.
pub const EXPORTER_SERVICE_NAME: &str = "rook-ceph-exporter";

const SOCK_DIR: &str = "/run/ceph";

/// Exporter deployment pinned to the node of `inputs`.
pub fn exporter_deployment(inputs: &NodeDaemonInputs) -> Result<DaemonDeployment, BuildError> {
    let daemon = NodeDaemon::Exporter;
    let cluster = inputs.cluster;
    let hostname = node_hostname(inputs.node)?;
    let selector = node_daemon_labels(EXPORTER_APP, &hostname, &inputs.node.name_any());

    let mut labels = pod_labels(cluster.labels_for(daemon.component()), &selector);
    labels.insert(
        CLUSTER_LABEL.to_owned(),
        cluster.namespace().unwrap_or_default(),
    );
    let mut annotations = cluster.annotations_for(daemon.component());
    if !cluster.has_component_annotations(daemon.component()) {
        annotations.insert("prometheus.io/scrape".to_owned(), "true".to_owned());
        annotations.insert("prometheus.io/port".to_owned(), EXPORTER_PORT.to_string());
    }
    annotations.insert(
        KEY_IDENTIFIER_ANNOTATION.to_owned(),
        inputs.key_identifier.to_owned(),
    );

    let (mut volumes, mut mounts) = dataless_volumes(cluster);
    let base = cluster.spec.data_dir_host_path.trim_end_matches('/');
    let (sock, sock_mount) =
        host_path_volume("ceph-daemons-sock-dir", &format!("{base}/exporter"), SOCK_DIR);
    let (keyring, keyring_mount) = keyring_volume(&daemon.secret_name(), daemon.keyring_dir());
    volumes.extend([sock, keyring]);
    mounts.extend([sock_mount, keyring_mount]);

    let mut env = mon_env();
    env.push(ceph_args_env(&keyring_path(daemon.keyring_dir())));

    let (host_network, dns_policy) = host_networking(cluster);

    let mut deployment_labels = selector.clone();
    deployment_labels.insert(CEPH_VERSION_LABEL.to_owned(), inputs.version.to_string());

    Ok(DaemonDeployment {
        name: truncated_name(EXPORTER_APP, &hostname),
        labels: deployment_labels,
        spec: DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_owned()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(annotations),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "ceph-exporter".to_owned(),
                        image: Some(cluster.spec.ceph_version.image.clone()),
                        image_pull_policy: cluster.spec.ceph_version.image_pull_policy.clone(),
                        command: Some(vec!["ceph-exporter".to_owned()]),
                        args: Some(exporter_args(cluster)),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            name: Some(EXPORTER_PORT_NAME.to_owned()),
                            container_port: EXPORTER_PORT,
                            protocol: Some("TCP".to_owned()),
                            ..Default::default()
                        }]),
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

fn exporter_args(cluster: &CephCluster) -> Vec<String> {
    let mut args = vec![
        "--sock-dir".to_owned(),
        SOCK_DIR.to_owned(),
        "--port".to_owned(),
        EXPORTER_PORT.to_string(),
        "--prio-limit".to_owned(),
        cluster.exporter_prio_limit().to_string(),
        "--stats-period".to_owned(),
        cluster.exporter_stats_period().to_string(),
    ];
    // Listen on the IPv6 wildcard, which also accepts IPv4 on dual stack hosts.
    if matches!(
        cluster.spec.network.mode,
        NetworkMode::DualStack | NetworkMode::Ipv6
    ) {
        args.extend(["--addrs".to_owned(), "::".to_owned()]);
    }
    args
}

fn service_selector(cluster: &CephCluster) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        (APP_LABEL.to_owned(), EXPORTER_APP.to_owned()),
        (
            CLUSTER_LABEL.to_owned(),
            cluster.namespace().unwrap_or_default(),
        ),
    ])
}

/// Service in front of every exporter of a cluster, with its labels.
pub fn metrics_service_spec(cluster: &CephCluster) -> (ServiceSpec, BTreeMap<String, String>) {
    let selector = service_selector(cluster);
    (
        ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(EXPORTER_PORT_NAME.to_owned()),
                port: EXPORTER_PORT,
                protocol: Some("TCP".to_owned()),
                target_port: Some(IntOrString::Int(EXPORTER_PORT)),
                ..Default::default()
            }]),
            selector: Some(selector.clone()),
            type_: Some("ClusterIP".to_owned()),
            ..Default::default()
        },
        selector,
    )
}

/// ServiceMonitor scraping the exporter service of a cluster.
pub fn service_monitor(cluster: &CephCluster) -> ServiceMonitor {
    let ns = cluster.namespace().unwrap_or_default();
    let relabelings = cluster
        .labels()
        .get(MANAGED_BY_CLUSTER_LABEL)
        .map(|managed_by| {
            vec![RelabelConfig {
                action: Some("replace".to_owned()),
                target_label: "managedBy".to_owned(),
                replacement: Some(managed_by.clone()),
            }]
        });
    let mut monitor = ServiceMonitor::new(
        EXPORTER_SERVICE_NAME,
        ServiceMonitorSpec {
            namespace_selector: Some(NamespaceSelector {
                match_names: vec![ns.clone()],
            }),
            selector: LabelSelector {
                match_labels: Some(service_selector(cluster)),
                ..Default::default()
            },
            endpoints: vec![Endpoint {
                port: EXPORTER_PORT_NAME.to_owned(),
                path: Some("/metrics".to_owned()),
                interval: Some(format!("{}s", cluster.exporter_stats_period())),
                honor_labels: Some(true),
                relabelings,
            }],
        },
    );
    monitor.metadata.namespace = Some(ns);
    monitor.metadata.labels = Some(service_monitor_labels());
    monitor.metadata.owner_references = cluster.controller_owner_ref(&()).map(|oref| vec![oref]);
    monitor
}
