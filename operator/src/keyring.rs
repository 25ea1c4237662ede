//! Cephx keyrings and where they are kept.
//!
//! Keys are issued by the cluster through [`CephAuth`] and persisted as Secrets with a
//! single `keyring` file.

/// File name of the keyring inside a keyring secret.
pub const KEYRING_FILE: &str = "keyring";

/// Errors rendering a keyring file.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// No key material.
    #[error("empty key for {entity}")]
    EmptyKey {
        /// Cephx entity, i.e. client.crash.
        entity: String,
    },
    /// Caps must come in service and capability pairs.
    #[error("caps for {entity} must be service and capability pairs, got {count} values")]
    OddCaps {
        /// Cephx entity, i.e. client.crash.
        entity: String,
        /// Number of caps values given.
        count: usize,
    },
}

/// Name of the secret holding the keyring of a resource.
pub fn secret_name(resource: &str) -> String {
    format!("{resource}-keyring")
}

/// Render a keyring file for `entity`.
///
/// `caps` alternate between a service and its capability, i.e. `["mon", "allow r"]`.
pub fn gen_keyring(entity: &str, key: &str, caps: &[String]) -> Result<String, Error> {
    if key.is_empty() {
        return Err(Error::EmptyKey {
            entity: entity.to_owned(),
        });
    }
    if caps.len() % 2 != 0 {
        return Err(Error::OddCaps {
            entity: entity.to_owned(),
            count: caps.len(),
        });
    }
    let mut keyring = format!("[{entity}]\n\tkey = {key}\n");
    for pair in caps.chunks(2) {
        keyring.push_str(&format!("\tcaps {} = \"{}\"\n", pair[0], pair[1]));
    }
    Ok(keyring)
}

#[cfg(feature = "controller")]
pub use store::{CephAuth, CephCli, KeyStore};

#[cfg(all(test, feature = "controller"))]
pub use store::MockCephAuth;

#[cfg(feature = "controller")]
mod store {
    use std::{collections::BTreeMap, path::PathBuf, time::Duration};

    use anyhow::{anyhow, bail, Context as _, Result};
    use async_trait::async_trait;
    use k8s_openapi::{
        api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::OwnerReference, ByteString,
    };
    use kube::{
        api::{Patch, PatchParams},
        core::ObjectMeta,
        Api, Client,
    };
    use tracing::debug;

    use crate::{labels::managed_labels, CONTROLLER_NAME};

    /// Key management surface of a Ceph cluster.
    #[cfg_attr(test, mockall::automock)]
    #[async_trait]
    pub trait CephAuth: Send + Sync {
        /// Return the key of `entity`, creating it with `caps` when it does not exist.
        async fn get_or_create_key(
            &self,
            namespace: &str,
            entity: &str,
            caps: &[String],
        ) -> Result<String>;
        /// Replace the key of an existing `entity` and return the new key.
        async fn rotate_key(&self, namespace: &str, entity: &str) -> Result<String>;
    }

    /// [`CephAuth`] backed by the `ceph` command line tool.
    pub struct CephCli {
        config_dir: PathBuf,
        timeout: Duration,
    }

    impl CephCli {
        /// Use the per-namespace config and admin keyring below `config_dir`.
        pub fn new(config_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
            Self {
                config_dir: config_dir.into(),
                timeout,
            }
        }

        async fn run(&self, namespace: &str, args: &[&str]) -> Result<Vec<u8>> {
            let dir = self.config_dir.join(namespace);
            let mut cmd = tokio::process::Command::new("ceph");
            cmd.args(args)
                .arg("--conf")
                .arg(dir.join(format!("{namespace}.config")))
                .arg("--keyring")
                .arg(dir.join("client.admin.keyring"))
                .args(["--format", "json"])
                .kill_on_drop(true);
            // Only the subcommand is logged, never the output.
            let what = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
            debug!(namespace, command = what, "running ceph");
            let output = tokio::time::timeout(self.timeout, cmd.output())
                .await
                .map_err(|_| anyhow!("ceph {what} timed out after {:?}", self.timeout))?
                .with_context(|| format!("failed to run ceph {what}"))?;
            if !output.status.success() {
                bail!(
                    "ceph {what} failed with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            Ok(output.stdout)
        }
    }

    #[async_trait]
    impl CephAuth for CephCli {
        async fn get_or_create_key(
            &self,
            namespace: &str,
            entity: &str,
            caps: &[String],
        ) -> Result<String> {
            let mut args = vec!["auth", "get-or-create-key", entity];
            args.extend(caps.iter().map(String::as_str));
            let out = self.run(namespace, &args).await?;
            parse_key(&out).with_context(|| format!("no key for {entity}"))
        }

        async fn rotate_key(&self, namespace: &str, entity: &str) -> Result<String> {
            let out = self.run(namespace, &["auth", "rotate", entity]).await?;
            parse_key(&out).with_context(|| format!("no rotated key for {entity}"))
        }
    }

    // Accepts both `{"key": ..}` and `[{"entity": .., "key": ..}]`.
    pub(super) fn parse_key(out: &[u8]) -> Result<String> {
        let value: serde_json::Value = serde_json::from_slice(out)?;
        let entry = match &value {
            serde_json::Value::Array(entries) => entries.first(),
            other => Some(other),
        };
        entry
            .and_then(|entry| entry.get("key"))
            .and_then(|key| key.as_str())
            .filter(|key| !key.is_empty())
            .map(str::to_owned)
            .ok_or_else(|| anyhow!("key missing from ceph output"))
    }

    /// Issues keys and persists keyrings.
    pub struct KeyStore<'a, A> {
        client: &'a Client,
        auth: &'a A,
    }

    impl<'a, A: CephAuth> KeyStore<'a, A> {
        /// Create a key store over a cluster auth backend.
        pub fn new(client: &'a Client, auth: &'a A) -> Self {
            Self { client, auth }
        }

        /// Key of `entity`, created with `caps` on first use.
        pub async fn generate(&self, ns: &str, entity: &str, caps: &[String]) -> Result<String> {
            self.auth.get_or_create_key(ns, entity, caps).await
        }

        /// New key for an existing `entity`.
        pub async fn rotate(&self, ns: &str, entity: &str) -> Result<String> {
            self.auth.rotate_key(ns, entity).await
        }

        /// Create or update a secret and return its resource version.
        pub async fn put(
            &self,
            ns: &str,
            secret_name: &str,
            orefs: Vec<OwnerReference>,
            files: BTreeMap<String, Vec<u8>>,
        ) -> Result<String, kube::Error> {
            let serverside = PatchParams::apply(CONTROLLER_NAME);
            let secrets: Api<Secret> = Api::namespaced(self.client.clone(), ns);
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(secret_name.to_owned()),
                    owner_references: Some(orefs),
                    labels: managed_labels(),
                    ..ObjectMeta::default()
                },
                data: Some(
                    files
                        .into_iter()
                        .map(|(name, content)| (name, ByteString(content)))
                        .collect(),
                ),
                type_: Some("kubernetes.io/rook".to_owned()),
                ..Default::default()
            };
            let secret = secrets
                .patch(secret_name, &serverside, &Patch::Apply(secret))
                .await?;
            Ok(secret.metadata.resource_version.unwrap_or_default())
        }
    }
}
