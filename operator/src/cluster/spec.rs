use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cephx::{CephxConfig, CephxStatus};

/// Primary CRD for creating and managing a Ceph cluster.
#[derive(CustomResource, Serialize, Deserialize, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephCluster",
    plural = "cephclusters",
    status = "ClusterStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Container image of the Ceph daemons.
    #[serde(default)]
    pub ceph_version: CephVersionSpec,
    /// Path on the host where daemon data, logs and crash dumps are kept.
    #[serde(default = "default_data_dir_host_path")]
    pub data_dir_host_path: String,
    /// Network of the daemon pods.
    #[serde(default)]
    pub network: NetworkSpec,
    /// Crash collector settings.
    #[serde(default)]
    pub crash_collector: CrashCollectorSpec,
    /// Metrics settings.
    #[serde(default)]
    pub monitoring: MonitoringSpec,
    /// Authentication settings.
    #[serde(default)]
    pub security: SecuritySpec,
    /// Extra labels keyed by component, `all` applies to every component.
    pub labels: Option<BTreeMap<String, BTreeMap<String, String>>>,
    /// Extra annotations keyed by component, `all` applies to every component.
    pub annotations: Option<BTreeMap<String, BTreeMap<String, String>>>,
    /// Priority class names keyed by component, `all` is the fallback.
    pub priority_class_names: Option<BTreeMap<String, String>>,
    /// Resource requirements keyed by component.
    pub resources: Option<BTreeMap<String, ResourceRequirements>>,
}

pub(crate) fn default_data_dir_host_path() -> String {
    "/var/lib/rook".to_owned()
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            ceph_version: Default::default(),
            data_dir_host_path: default_data_dir_host_path(),
            network: Default::default(),
            crash_collector: Default::default(),
            monitoring: Default::default(),
            security: Default::default(),
            labels: None,
            annotations: None,
            priority_class_names: None,
            resources: None,
        }
    }
}

/// Ceph image selection.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephVersionSpec {
    /// Image reference, the tag carries the version.
    #[serde(default)]
    pub image: String,
    /// Pull policy of the image.
    pub image_pull_policy: Option<String>,
}

/// Network settings of the daemons.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Network mode of the daemon pods.
    #[serde(default)]
    pub mode: NetworkMode,
}

/// How daemon pods are networked.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum NetworkMode {
    /// Pods use the host network namespace.
    #[serde(rename = "host")]
    Host,
    /// Pods use the cluster pod network.
    #[default]
    #[serde(rename = "pod")]
    Pod,
    /// Pod network with both IPv4 and IPv6 addresses.
    #[serde(rename = "dual-stack")]
    DualStack,
    /// Pod network with IPv6 addresses.
    #[serde(rename = "ipv6")]
    Ipv6,
}

/// Crash collector settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CrashCollectorSpec {
    /// Do not run crash collectors.
    #[serde(default)]
    pub disable: bool,
    /// Days crash reports are kept, zero keeps them forever.
    #[serde(default)]
    pub days_to_retain: u32,
}

/// Metrics settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSpec {
    /// Run the metrics exporter on every node with storage daemons.
    #[serde(default)]
    pub enabled: bool,
    /// Publish a prometheus-operator ServiceMonitor for the exporters.
    #[serde(default)]
    pub enable_service_monitor: bool,
    /// Exporter tuning.
    pub exporter: Option<ExporterSpec>,
}

/// Exporter tuning.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExporterSpec {
    /// Only performance counters with at least this priority are exported.
    pub perf_counters_prio_limit: Option<i64>,
    /// Seconds between daemon socket polls.
    pub stats_period_seconds: Option<i64>,
}

/// Authentication settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    /// Cephx settings.
    #[serde(default)]
    pub cephx: ClusterCephxSpec,
}

/// Cephx settings.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCephxSpec {
    /// Key lifecycle of the daemon keys.
    #[serde(default)]
    pub daemon: CephxConfig,
}

/// Status of a CephCluster.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Outcome of the last reconcile.
    pub phase: Option<Phase>,
    /// Generation of the spec the last reconcile acted on.
    pub observed_generation: Option<i64>,
    /// Version of the running daemons.
    pub version: Option<ClusterVersion>,
    /// Keys of the node daemons.
    pub cephx: Option<ClusterCephxStatus>,
}

/// Running engine.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterVersion {
    /// Image the daemons run.
    pub image: String,
    /// Version in `<major>.<minor>.<extra>-<build>` form.
    pub version: String,
}

/// Keys of the node daemons.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClusterCephxStatus {
    /// Crash collector key.
    pub crash_collector: Option<CephxStatus>,
    /// Exporter key.
    pub ceph_exporter: Option<CephxStatus>,
}

/// Outcome of a reconcile as shown to users.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub enum Phase {
    /// Resources are being created.
    Progressing,
    /// The last reconcile succeeded.
    Ready,
    /// The last reconcile failed.
    Failed,
}
