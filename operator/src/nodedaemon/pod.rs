//! Pod pieces shared by the node daemons and the filesystem mirror.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, EnvVar, EnvVarSource, HostPathVolumeSource, Node,
    SecretKeySelector, SecretVolumeSource, SecurityContext, Toleration, Volume, VolumeMount,
};
use kube::ResourceExt;
use sha2::{Digest, Sha256};

use crate::{
    cluster::{CephCluster, NetworkMode},
    keyring::KEYRING_FILE,
    labels::HOSTNAME_LABEL,
};

use super::BuildError;

/// Service account of the daemon pods.
pub const SERVICE_ACCOUNT: &str = "rook-ceph-default";
/// Secret holding the monitor endpoints.
pub const MON_SECRET: &str = "rook-ceph-config";
/// Config map with user overrides of the ceph config.
pub const CONFIG_OVERRIDE: &str = "rook-config-override";
/// Uid and gid of the ceph user in the daemon image.
pub const CEPH_USER_ID: i64 = 167;

const MAX_NAME_LEN: usize = 63;
const HASHED_NAME_LEN: usize = 32;

/// `<app>-<hostname>`, with the hostname replaced by a hash when the result is too long.
pub fn truncated_name(app: &str, hostname: &str) -> String {
    let name = format!("{app}-{hostname}");
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let digest = hex::encode(Sha256::digest(hostname.as_bytes()));
    format!("{app}-{}", &digest[..HASHED_NAME_LEN])
}

/// Hostname label of a node.
pub fn node_hostname(node: &Node) -> Result<String, BuildError> {
    node.labels()
        .get(HOSTNAME_LABEL)
        .filter(|hostname| !hostname.is_empty())
        .cloned()
        .ok_or_else(|| BuildError::MissingHostnameLabel {
            node: node.name_any(),
            label: HOSTNAME_LABEL,
        })
}

/// Monitor endpoints from the mon secret, defined before anything referencing them.
pub fn mon_env() -> Vec<EnvVar> {
    [("MON_HOST", "mon_host"), ("MON_INITIAL_MEMBERS", "mon_initial_members")]
        .into_iter()
        .map(|(name, key)| EnvVar {
            name: name.to_owned(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: Some(MON_SECRET.to_owned()),
                    key: key.to_owned(),
                    optional: None,
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect()
}

/// CEPH_ARGS pointing the ceph tools at the monitors and a keyring.
pub fn ceph_args_env(keyring_path: &str) -> EnvVar {
    EnvVar {
        name: "CEPH_ARGS".to_owned(),
        value: Some(format!("-m $(MON_HOST) -k {keyring_path}")),
        ..Default::default()
    }
}

/// Volume of a keyring secret mounted read-only at `dir`.
pub fn keyring_volume(secret: &str, dir: &str) -> (Volume, VolumeMount) {
    let name = secret.to_owned();
    (
        Volume {
            name: name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_owned()),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeMount {
            name,
            mount_path: dir.to_owned(),
            read_only: Some(true),
            ..Default::default()
        },
    )
}

/// Path of the keyring file of a secret mounted at `dir`.
pub fn keyring_path(dir: &str) -> String {
    format!("{}/{KEYRING_FILE}", dir.trim_end_matches('/'))
}

/// A host directory mounted into the pod.
pub fn host_path_volume(name: &str, host_path: &str, mount_path: &str) -> (Volume, VolumeMount) {
    (
        Volume {
            name: name.to_owned(),
            host_path: Some(HostPathVolumeSource {
                path: host_path.to_owned(),
                type_: Some("DirectoryOrCreate".to_owned()),
            }),
            ..Default::default()
        },
        VolumeMount {
            name: name.to_owned(),
            mount_path: mount_path.to_owned(),
            ..Default::default()
        },
    )
}

/// Config override, log and crash directories of a daemon that keeps no data.
pub fn dataless_volumes(cluster: &CephCluster) -> (Vec<Volume>, Vec<VolumeMount>) {
    let ns = cluster.namespace().unwrap_or_default();
    let base = cluster.spec.data_dir_host_path.trim_end_matches('/');
    let override_volume = (
        Volume {
            name: CONFIG_OVERRIDE.to_owned(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(CONFIG_OVERRIDE.to_owned()),
                optional: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        },
        VolumeMount {
            name: CONFIG_OVERRIDE.to_owned(),
            mount_path: "/etc/ceph".to_owned(),
            read_only: Some(true),
            ..Default::default()
        },
    );
    let log = host_path_volume(
        "rook-ceph-log",
        &format!("{base}/{ns}/log"),
        "/var/log/ceph",
    );
    let crash = host_path_volume(
        "rook-ceph-crash",
        &format!("{base}/{ns}/crash"),
        "/var/lib/ceph/crash",
    );
    [override_volume, log, crash].into_iter().unzip()
}

/// Security context of daemons running as the ceph user.
pub fn ceph_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(CEPH_USER_ID),
        run_as_group: Some(CEPH_USER_ID),
        run_as_non_root: Some(true),
        ..Default::default()
    }
}

/// Security context of init containers preparing host directories.
pub fn root_security_context() -> SecurityContext {
    SecurityContext {
        run_as_user: Some(0),
        privileged: Some(false),
        ..Default::default()
    }
}

/// Init container handing host directories over to the ceph user.
pub fn chown_init_container(
    cluster: &CephCluster,
    dirs: &[&str],
    mounts: Vec<VolumeMount>,
) -> Container {
    let mut args = vec![
        "--verbose".to_owned(),
        "--recursive".to_owned(),
        "ceph:ceph".to_owned(),
    ];
    args.extend(dirs.iter().map(|dir| dir.to_string()));
    Container {
        name: "chown-container-data-dir".to_owned(),
        image: Some(cluster.spec.ceph_version.image.clone()),
        image_pull_policy: cluster.spec.ceph_version.image_pull_policy.clone(),
        command: Some(vec!["chown".to_owned()]),
        args: Some(args),
        volume_mounts: Some(mounts),
        security_context: Some(root_security_context()),
        ..Default::default()
    }
}

/// Host network and the dns policy that goes with it.
pub fn host_networking(cluster: &CephCluster) -> (Option<bool>, Option<String>) {
    match cluster.spec.network.mode {
        NetworkMode::Host => (Some(true), Some("ClusterFirstWithHostNet".to_owned())),
        _ => (None, None),
    }
}

/// Merge labels with `selector`, the selector wins on conflicting keys.
pub fn pod_labels(
    extra: BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut labels = extra;
    labels.extend(selector.clone());
    labels
}

/// Tolerations as a pod spec field.
pub fn tolerations(tolerations: &[Toleration]) -> Option<Vec<Toleration>> {
    (!tolerations.is_empty()).then(|| tolerations.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::nodedaemon::test::{cluster, node};

    #[test]
    fn short_names_are_kept() {
        assert_eq!(
            truncated_name("rook-ceph-crashcollector", "node-a"),
            "rook-ceph-crashcollector-node-a"
        );
    }

    #[test]
    fn long_names_are_hashed() {
        let hostname = "a-very-long-hostname.with.several.domain.components.example.com";
        let name = truncated_name("rook-ceph-crashcollector", hostname);
        assert!(name.len() <= MAX_NAME_LEN, "{name}");
        assert!(name.starts_with("rook-ceph-crashcollector-"));
        assert_eq!(name, truncated_name("rook-ceph-crashcollector", hostname));
        assert_ne!(
            name,
            truncated_name("rook-ceph-crashcollector", &format!("{hostname}.net"))
        );
    }

    #[test]
    fn hostname_label_is_required() {
        let mut n = node("testnode");
        assert_eq!(node_hostname(&n), Ok("testnode".to_owned()));
        n.metadata.labels = None;
        assert_eq!(
            node_hostname(&n),
            Err(BuildError::MissingHostnameLabel {
                node: "testnode".to_owned(),
                label: HOSTNAME_LABEL,
            })
        );
    }

    #[test]
    fn mon_env_precedes_ceph_args() {
        let names: Vec<_> = mon_env().into_iter().map(|env| env.name).collect();
        assert_eq!(names, ["MON_HOST", "MON_INITIAL_MEMBERS"]);
        assert_eq!(
            ceph_args_env("/etc/ceph/keyring-store/keyring").value.as_deref(),
            Some("-m $(MON_HOST) -k /etc/ceph/keyring-store/keyring")
        );
    }

    #[test]
    fn dataless_volumes_live_under_the_namespace() {
        let (volumes, mounts) = dataless_volumes(&cluster());
        let paths: Vec<_> = volumes
            .iter()
            .filter_map(|v| v.host_path.as_ref().map(|h| h.path.as_str()))
            .collect();
        assert_eq!(
            paths,
            ["/var/lib/rook/rook-ceph/log", "/var/lib/rook/rook-ceph/crash"]
        );
        let mount_paths: Vec<_> = mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(mount_paths, ["/etc/ceph", "/var/log/ceph", "/var/lib/ceph/crash"]);
    }
}
