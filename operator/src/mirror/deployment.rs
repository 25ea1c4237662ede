use k8s_openapi::{
    api::{
        apps::v1::DeploymentSpec,
        core::v1::{
            Container, ExecAction, PodSecurityContext, PodSpec, PodTemplateSpec, Probe,
        },
    },
    apimachinery::pkg::apis::meta::v1::LabelSelector,
};
use kube::{core::ObjectMeta, ResourceExt};

use crate::{
    cluster::{CephCluster, FS_MIRROR_COMPONENT},
    labels::{selector_labels, CEPH_VERSION_LABEL, CLUSTER_LABEL},
    nodedaemon::{
        pod::{
            ceph_args_env, ceph_security_context, dataless_volumes, host_networking,
            keyring_path, keyring_volume, mon_env, SERVICE_ACCOUNT,
        },
        DaemonDeployment, KEY_IDENTIFIER_ANNOTATION,
    },
    version::CephVersion,
};

use super::{CephFilesystemMirror, FS_MIRROR_ENTITY};

/// App label and deployment name of the mirror daemon.
pub const FS_MIRROR_APP: &str = "rook-ceph-fs-mirror";
pub(super) const FS_MIRROR_KEYRING_DIR: &str = "/etc/ceph/fs-mirror-keyring-store/";

/// Caps of the mirror key as service and capability pairs.
pub(super) fn fs_mirror_caps() -> Vec<String> {
    [
        "mon",
        "allow profile cephfs-mirror",
        "mgr",
        "allow r",
        "mds",
        "allow r",
        "osd",
        "allow rw tag cephfs metadata=*, allow r tag cephfs data=*",
    ]
    .iter()
    .map(|cap| cap.to_string())
    .collect()
}

fn admin_socket_probe() -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "env".to_owned(),
                "-i".to_owned(),
                "sh".to_owned(),
                "-c".to_owned(),
                format!("ceph --admin-daemon /run/ceph/ceph-{FS_MIRROR_ENTITY}.asok status"),
            ]),
        }),
        initial_delay_seconds: Some(10),
        period_seconds: Some(10),
        timeout_seconds: Some(5),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Deployment of the mirror daemon.
pub fn fs_mirror_deployment(
    mirror: &CephFilesystemMirror,
    cluster: &CephCluster,
    version: &CephVersion,
    key_identifier: &str,
) -> DaemonDeployment {
    let selector = selector_labels(FS_MIRROR_APP).unwrap_or_default();
    let mut labels = cluster.labels_for(FS_MIRROR_COMPONENT);
    labels.extend(mirror.spec.labels.clone().unwrap_or_default());
    labels.extend(selector.clone());
    labels.insert(CLUSTER_LABEL.to_owned(), mirror.namespace().unwrap_or_default());

    let mut annotations = cluster.annotations_for(FS_MIRROR_COMPONENT);
    annotations.extend(mirror.spec.annotations.clone().unwrap_or_default());
    annotations.insert(
        KEY_IDENTIFIER_ANNOTATION.to_owned(),
        key_identifier.to_owned(),
    );

    let (mut volumes, mut mounts) = dataless_volumes(cluster);
    let (keyring, keyring_mount) = keyring_volume(
        &crate::keyring::secret_name(FS_MIRROR_APP),
        FS_MIRROR_KEYRING_DIR,
    );
    volumes.push(keyring);
    mounts.push(keyring_mount);

    let mut env = mon_env();
    env.push(ceph_args_env(&keyring_path(FS_MIRROR_KEYRING_DIR)));

    let (host_network, dns_policy) = host_networking(cluster);
    let mut deployment_labels = selector.clone();
    deployment_labels.insert(CEPH_VERSION_LABEL.to_owned(), version.to_string());

    DaemonDeployment {
        name: FS_MIRROR_APP.to_owned(),
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
                    containers: vec![Container {
                        name: "cephfs-mirror".to_owned(),
                        image: Some(cluster.spec.ceph_version.image.clone()),
                        image_pull_policy: cluster.spec.ceph_version.image_pull_policy.clone(),
                        command: Some(vec!["cephfs-mirror".to_owned()]),
                        args: Some(vec![
                            "--foreground".to_owned(),
                            "-n".to_owned(),
                            FS_MIRROR_ENTITY.to_owned(),
                        ]),
                        env: Some(env),
                        volume_mounts: Some(mounts),
                        liveness_probe: Some(admin_socket_probe()),
                        security_context: Some(ceph_security_context()),
                        resources: mirror
                            .spec
                            .resources
                            .clone()
                            .or_else(|| cluster.resources_for(FS_MIRROR_COMPONENT)),
                        ..Default::default()
                    }],
                    volumes: Some(volumes),
                    host_network,
                    dns_policy,
                    priority_class_name: mirror
                        .spec
                        .priority_class_name
                        .clone()
                        .or_else(|| cluster.priority_class_name_for(FS_MIRROR_COMPONENT)),
                    restart_policy: Some("Always".to_owned()),
                    security_context: Some(PodSecurityContext::default()),
                    service_account_name: Some(SERVICE_ACCOUNT.to_owned()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeMap;

    use expect_test::expect;

    use crate::{
        mirror::FilesystemMirrorSpec,
        nodedaemon::test::cluster,
    };

    fn mirror() -> CephFilesystemMirror {
        let mut mirror = CephFilesystemMirror::new(
            "my-mirror",
            FilesystemMirrorSpec {
                labels: Some(BTreeMap::from_iter([
                    ("app".to_owned(), "override".to_owned()),
                    ("tier".to_owned(), "dr".to_owned()),
                ])),
                priority_class_name: Some("mirror-critical".to_owned()),
                ..Default::default()
            },
        );
        mirror.metadata.namespace = Some("rook-ceph".to_owned());
        mirror
    }

    #[test]
    fn mirror_deployment() {
        let deployment =
            fs_mirror_deployment(&mirror(), &cluster(), &CephVersion::new(17, 2, 0), "5");
        assert_eq!(deployment.name, "rook-ceph-fs-mirror");
        let template = deployment.spec.template;
        let meta = template.metadata.unwrap();
        let labels = meta.labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some(FS_MIRROR_APP));
        assert_eq!(labels.get("tier").map(String::as_str), Some("dr"));
        assert_eq!(
            meta.annotations.unwrap().get(KEY_IDENTIFIER_ANNOTATION).map(String::as_str),
            Some("5")
        );
        let pod = template.spec.unwrap();
        assert_eq!(pod.priority_class_name.as_deref(), Some("mirror-critical"));
        let container = &pod.containers[0];
        expect![[r#"
            [
                "--foreground",
                "-n",
                "client.fs-mirror",
            ]
        "#]]
        .assert_debug_eq(container.args.as_ref().unwrap());
        expect![[r#"
            [
                "env",
                "-i",
                "sh",
                "-c",
                "ceph --admin-daemon /run/ceph/ceph-client.fs-mirror.asok status",
            ]
        "#]]
        .assert_debug_eq(
            container
                .liveness_probe
                .as_ref()
                .and_then(|probe| probe.exec.as_ref())
                .and_then(|exec| exec.command.as_ref())
                .unwrap(),
        );
    }
}
