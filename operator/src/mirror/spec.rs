use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{cephx::CephxStatus, cluster::Phase};

/// Runs the cephfs-mirror daemon of the cluster in the same namespace.
#[derive(CustomResource, Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "ceph.rook.io",
    version = "v1",
    kind = "CephFilesystemMirror",
    plural = "cephfilesystemmirrors",
    status = "FilesystemMirrorStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemMirrorSpec {
    /// Extra labels of the mirror pod.
    pub labels: Option<BTreeMap<String, String>>,
    /// Extra annotations of the mirror pod.
    pub annotations: Option<BTreeMap<String, String>>,
    /// Priority class of the mirror pod.
    pub priority_class_name: Option<String>,
    /// Resource requirements of the mirror container.
    pub resources: Option<ResourceRequirements>,
}

/// Status of a CephFilesystemMirror.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemMirrorStatus {
    /// Outcome of the last reconcile.
    pub phase: Option<Phase>,
    /// Generation of the spec the last reconcile acted on.
    pub observed_generation: Option<i64>,
    /// Key of the mirror daemon.
    pub cephx: Option<LocalCephxStatus>,
}

/// Key of a daemon owned by the resource itself.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalCephxStatus {
    /// Daemon key.
    pub daemon: Option<CephxStatus>,
}
