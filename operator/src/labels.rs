use std::collections::BTreeMap;

/// Label selecting the pods and deployments of one app.
pub const APP_LABEL: &str = "app";
/// Well known node label holding the hostname.
pub const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";
/// Label carrying the name of the node a daemon runs for.
pub const NODE_NAME_LABEL: &str = "node_name";
/// Label carried by every storage daemon pod, valued with the cluster namespace.
pub const CLUSTER_LABEL: &str = "rook_cluster";
/// Cluster label naming the system that manages the cluster.
pub const MANAGED_BY_CLUSTER_LABEL: &str = "rook.io/managedBy";
/// Label recording the engine version of a daemon deployment.
pub const CEPH_VERSION_LABEL: &str = "ceph-version";

/// Create lables that can be used as a unique selector for a given app name.
pub fn selector_labels(app: &str) -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        APP_LABEL.to_owned(),
        app.to_owned(),
    )]))
}

/// Selector labels of a per node daemon.
pub fn node_daemon_labels(app: &str, hostname: &str, node: &str) -> BTreeMap<String, String> {
    BTreeMap::from_iter([
        (APP_LABEL.to_owned(), app.to_owned()),
        (HOSTNAME_LABEL.to_owned(), hostname.to_owned()),
        (NODE_NAME_LABEL.to_owned(), node.to_owned()),
    ])
}

/// Label selector string for the daemons of `app`, optionally limited to one node.
pub fn app_selector(app: &str, node: Option<&str>) -> String {
    match node {
        Some(node) => format!("{APP_LABEL}={app},{NODE_NAME_LABEL}={node}"),
        None => format!("{APP_LABEL}={app}"),
    }
}

/// Manage by label
pub const MANAGED_BY_LABEL_SELECTOR: &str = "app.kubernetes.io/managed-by=rook-ceph-operator";

/// Labels that indicate the resource is managed by the operator.
pub fn managed_labels() -> Option<BTreeMap<String, String>> {
    Some(BTreeMap::from_iter(vec![(
        "app.kubernetes.io/managed-by".to_owned(),
        "rook-ceph-operator".to_owned(),
    )]))
}

/// Managed labels plus extra labels.
pub fn managed_labels_extend(
    labels: Option<BTreeMap<String, String>>,
) -> Option<BTreeMap<String, String>> {
    let mut managed = managed_labels().unwrap_or_default();
    if let Some(labels) = labels {
        managed.extend(labels);
    }
    Some(managed)
}
