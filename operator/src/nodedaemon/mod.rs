//! Crash collector and exporter daemons that run next to the storage daemons of a node.
//!
//! Builders in this module are pure: they turn a cluster, a node and the resource
//! version of the daemon keyring into the desired deployment. The controller applies
//! the result and owns the key lifecycle.
pub mod controller;
mod crash;
mod exporter;
pub(crate) mod pod;
pub mod pruner;

use std::collections::BTreeMap;

use k8s_openapi::api::{
    apps::v1::DeploymentSpec,
    core::v1::{Node, Toleration},
};

use crate::{
    cluster::{CephCluster, NodeDaemon, CRASH_COLLECTOR_COMPONENT, EXPORTER_COMPONENT},
    keyring,
    version::CephVersion,
};

pub use crash::crash_collector_deployment;
pub use exporter::{
    exporter_deployment, metrics_service_spec, service_monitor, EXPORTER_PORT,
    EXPORTER_PORT_NAME, EXPORTER_SERVICE_NAME,
};

/// App name of the crash collector.
pub const CRASH_COLLECTOR_APP: &str = "rook-ceph-crashcollector";
/// App name of the exporter.
pub const EXPORTER_APP: &str = "rook-ceph-exporter";
/// Pod template annotation carrying the keyring secret resource version.
pub const KEY_IDENTIFIER_ANNOTATION: &str = "cephx-key-identifier";

/// Oldest engine shipping ceph-exporter.
pub fn min_exporter_version() -> CephVersion {
    CephVersion::new(17, 2, 5)
}

/// Everything a node daemon deployment is built from.
pub struct NodeDaemonInputs<'a> {
    /// Owning cluster.
    pub cluster: &'a CephCluster,
    /// Node the daemon is pinned to.
    pub node: &'a Node,
    /// Tolerations of the storage pods on the node.
    pub tolerations: &'a [Toleration],
    /// Running engine version.
    pub version: &'a CephVersion,
    /// Resource version of the keyring secret.
    pub key_identifier: &'a str,
}

/// A deployment to apply.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonDeployment {
    /// Deployment name.
    pub name: String,
    /// Deployment labels.
    pub labels: BTreeMap<String, String>,
    /// Deployment spec.
    pub spec: DeploymentSpec,
}

/// Errors building node daemons.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum BuildError {
    /// Daemons are pinned with the hostname label.
    #[error("node {node} has no {label} label")]
    MissingHostnameLabel {
        /// Node name.
        node: String,
        /// The missing label.
        label: &'static str,
    },
}

impl NodeDaemon {
    /// App label and name prefix.
    pub fn app(self) -> &'static str {
        match self {
            NodeDaemon::CrashCollector => CRASH_COLLECTOR_APP,
            NodeDaemon::Exporter => EXPORTER_APP,
        }
    }

    /// Component key of labels, annotations and resources.
    pub fn component(self) -> &'static str {
        match self {
            NodeDaemon::CrashCollector => CRASH_COLLECTOR_COMPONENT,
            NodeDaemon::Exporter => EXPORTER_COMPONENT,
        }
    }

    /// Cephx entity of the daemon key.
    pub fn entity(self) -> &'static str {
        match self {
            NodeDaemon::CrashCollector => "client.crash",
            NodeDaemon::Exporter => "client.ceph-exporter",
        }
    }

    /// Caps of the daemon key as service and capability pairs.
    pub fn caps(self) -> Vec<String> {
        let caps: &[&str] = match self {
            NodeDaemon::CrashCollector => &["mon", "allow profile crash", "mgr", "allow rw"],
            NodeDaemon::Exporter => &[
                "mon",
                "allow profile ceph-exporter",
                "mgr",
                "allow r",
                "osd",
                "allow r",
                "mds",
                "allow r",
            ],
        };
        caps.iter().map(|cap| cap.to_string()).collect()
    }

    /// Name of the keyring secret.
    pub fn secret_name(self) -> String {
        match self {
            NodeDaemon::CrashCollector => keyring::secret_name("rook-ceph-crash-collector"),
            NodeDaemon::Exporter => keyring::secret_name(EXPORTER_APP),
        }
    }

    /// Directory the keyring secret is mounted at.
    pub fn keyring_dir(self) -> &'static str {
        match self {
            NodeDaemon::CrashCollector => "/etc/ceph/crash-collector-keyring-store/",
            NodeDaemon::Exporter => "/etc/ceph/exporter-keyring-store/",
        }
    }

    /// Build the deployment of this daemon for a node.
    pub fn build(self, inputs: &NodeDaemonInputs) -> Result<DaemonDeployment, BuildError> {
        match self {
            NodeDaemon::CrashCollector => crash_collector_deployment(inputs),
            NodeDaemon::Exporter => exporter_deployment(inputs),
        }
    }
}
