//! Place all spec types into the cluster module.
mod spec;

pub use spec::*;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;

use crate::{
    cephx::CephxStatus,
    version::{CephVersion, ParseVersionError},
};

/// Component key that applies to every component.
pub const ALL_COMPONENTS: &str = "all";
/// Component key of the crash collector.
pub const CRASH_COLLECTOR_COMPONENT: &str = "crashcollector";
/// Component key of the exporter.
pub const EXPORTER_COMPONENT: &str = "exporter";
/// Component key of the filesystem mirror.
pub const FS_MIRROR_COMPONENT: &str = "fs-mirror";

/// Default minimum priority of exported performance counters.
pub const DEFAULT_PRIO_LIMIT: i64 = 5;
/// Default seconds between exporter polls.
pub const DEFAULT_STATS_PERIOD: i64 = 5;

/// Node daemons that hold a cephx key recorded in the cluster status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDaemon {
    /// Ships crash dumps to the cluster.
    CrashCollector,
    /// Serves daemon performance counters to prometheus.
    Exporter,
}

/// What is known about the engine versions of a cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineVersion {
    /// No version has been recorded yet.
    Unknown,
    /// The recorded version is for a different image.
    UpgradeInProgress {
        /// Image the daemons run.
        running_image: String,
        /// Image the spec asks for.
        desired_image: String,
    },
    /// Versions to reconcile with.
    Ready {
        /// Version the daemons run.
        running: CephVersion,
        /// Version parsed from the image tag, zero when unknown.
        desired: CephVersion,
    },
}

impl CephCluster {
    /// Labels for a component, component labels win over `all`.
    pub fn labels_for(&self, component: &str) -> BTreeMap<String, String> {
        merged(self.spec.labels.as_ref(), component)
    }

    /// Annotations for a component, component annotations win over `all`.
    pub fn annotations_for(&self, component: &str) -> BTreeMap<String, String> {
        merged(self.spec.annotations.as_ref(), component)
    }

    /// True when annotations were given for exactly this component.
    pub fn has_component_annotations(&self, component: &str) -> bool {
        self.spec
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(component))
            .is_some_and(|annotations| !annotations.is_empty())
    }

    /// Priority class name of a component, falling back to `all`.
    pub fn priority_class_name_for(&self, component: &str) -> Option<String> {
        let names = self.spec.priority_class_names.as_ref()?;
        names
            .get(component)
            .or_else(|| names.get(ALL_COMPONENTS))
            .cloned()
    }

    /// Resource requirements of a component.
    pub fn resources_for(&self, component: &str) -> Option<ResourceRequirements> {
        self.spec.resources.as_ref()?.get(component).cloned()
    }

    /// Recorded key status of a node daemon.
    pub fn cephx_status(&self, daemon: NodeDaemon) -> Option<&CephxStatus> {
        let cephx = self.status.as_ref()?.cephx.as_ref()?;
        match daemon {
            NodeDaemon::CrashCollector => cephx.crash_collector.as_ref(),
            NodeDaemon::Exporter => cephx.ceph_exporter.as_ref(),
        }
    }

    /// Record the key status of a node daemon.
    pub fn set_cephx_status(&mut self, daemon: NodeDaemon, status: CephxStatus) {
        let cephx = self
            .status
            .get_or_insert_with(Default::default)
            .cephx
            .get_or_insert_with(Default::default);
        match daemon {
            NodeDaemon::CrashCollector => cephx.crash_collector = Some(status),
            NodeDaemon::Exporter => cephx.ceph_exporter = Some(status),
        }
    }

    /// Exporter counter priority limit.
    pub fn exporter_prio_limit(&self) -> i64 {
        self.spec
            .monitoring
            .exporter
            .as_ref()
            .and_then(|exporter| exporter.perf_counters_prio_limit)
            .unwrap_or(DEFAULT_PRIO_LIMIT)
    }

    /// Exporter polling period.
    pub fn exporter_stats_period(&self) -> i64 {
        self.spec
            .monitoring
            .exporter
            .as_ref()
            .and_then(|exporter| exporter.stats_period_seconds)
            .unwrap_or(DEFAULT_STATS_PERIOD)
    }

    /// Resolve the running and desired engine versions.
    pub fn engine_version(&self) -> Result<EngineVersion, ParseVersionError> {
        let Some(recorded) = self.status.as_ref().and_then(|s| s.version.as_ref()) else {
            return Ok(EngineVersion::Unknown);
        };
        if recorded.version.is_empty() {
            return Ok(EngineVersion::Unknown);
        }
        if recorded.image != self.spec.ceph_version.image {
            return Ok(EngineVersion::UpgradeInProgress {
                running_image: recorded.image.clone(),
                desired_image: self.spec.ceph_version.image.clone(),
            });
        }
        let running = CephVersion::parse_status(&recorded.version)?;
        let desired = CephVersion::from_image(&self.spec.ceph_version.image).unwrap_or_default();
        Ok(EngineVersion::Ready { running, desired })
    }
}

fn merged(
    by_component: Option<&BTreeMap<String, BTreeMap<String, String>>>,
    component: &str,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    if let Some(by_component) = by_component {
        for key in [ALL_COMPONENTS, component] {
            if let Some(values) = by_component.get(key) {
                out.extend(values.clone());
            }
        }
    }
    out
}
