//! Decides when cephx keys are rotated and what status to report afterwards.
//!
//! Everything here is pure: callers supply the configured policy, the running and
//! desired engine versions and the status recorded for the key.
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::version::{CephVersion, ParseVersionError};

/// Key version recorded for a key that has never been created.
pub const UNINITIALIZED: &str = "Uninitialized";

/// Oldest engine that supports `ceph auth rotate`.
pub fn min_rotation_version() -> CephVersion {
    CephVersion::new(17, 2, 0)
}

/// User configuration of the key lifecycle for one daemon kind.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephxConfig {
    /// One of Disabled, KeyGeneration or WithCephVersionUpdate. Unset means Disabled.
    pub key_rotation_policy: Option<String>,
    /// With the KeyGeneration policy, keys are rotated until the recorded generation
    /// reaches this value.
    #[serde(default)]
    pub key_generation: u32,
    /// Cipher type of the key.
    pub key_type: Option<String>,
}

/// Observed state of a cephx key.
#[derive(Serialize, Deserialize, Debug, Default, PartialEq, Eq, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephxStatus {
    /// Number of times the key has been created or rotated.
    #[serde(default)]
    pub key_generation: u32,
    /// Engine version that created the key, [`UNINITIALIZED`] or empty when unknown.
    #[serde(default)]
    pub key_ceph_version: String,
    /// Cipher type of the key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<String>,
}

impl CephxStatus {
    /// Status of a key that must still be created.
    pub fn uninitialized() -> Self {
        Self {
            key_ceph_version: UNINITIALIZED.to_owned(),
            ..Default::default()
        }
    }

    /// True when the key has never been created.
    pub fn is_uninitialized(&self) -> bool {
        self.key_ceph_version == UNINITIALIZED
    }
}

/// Errors deciding on key rotation.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// The configured policy is not one we know.
    #[error("unknown cephx key rotation policy {0:?}")]
    UnknownPolicy(String),
    /// The recorded key version could not be parsed.
    #[error("invalid cephx status: {0}")]
    Version(#[from] ParseVersionError),
}

/// Known key rotation policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRotationPolicy {
    /// Never rotate, except when the key type changes.
    Disabled,
    /// Rotate whenever the configured generation exceeds the recorded one.
    KeyGeneration,
    /// Rotate whenever the engine is upgraded past the version that created the key.
    WithCephVersionUpdate,
}

impl FromStr for KeyRotationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "Disabled" => Ok(Self::Disabled),
            "KeyGeneration" => Ok(Self::KeyGeneration),
            "WithCephVersionUpdate" => Ok(Self::WithCephVersionUpdate),
            other => Err(Error::UnknownPolicy(other.to_owned())),
        }
    }
}

impl CephxConfig {
    /// Parsed rotation policy, unset is Disabled.
    pub fn policy(&self) -> Result<KeyRotationPolicy, Error> {
        self.key_rotation_policy
            .as_deref()
            .unwrap_or_default()
            .parse()
    }

    // Configured generation, only meaningful under the KeyGeneration policy.
    fn generation_floor(&self) -> u32 {
        match self.policy() {
            Ok(KeyRotationPolicy::KeyGeneration) => self.key_generation,
            _ => 0,
        }
    }
}

/// Decide whether the key described by `status` must be rotated now.
pub fn should_rotate(
    cfg: &CephxConfig,
    running: &CephVersion,
    desired: &CephVersion,
    status: &CephxStatus,
    ignore_key_type: bool,
) -> Result<bool, Error> {
    if running < &min_rotation_version() {
        return Ok(false);
    }
    if status.is_uninitialized() {
        // Created on this pass instead.
        return Ok(false);
    }

    let key_type_changed = !ignore_key_type
        && cfg
            .key_type
            .as_deref()
            .is_some_and(|key_type| status.key_type.as_deref() != Some(key_type));

    match cfg.policy()? {
        KeyRotationPolicy::Disabled => Ok(key_type_changed),
        KeyRotationPolicy::KeyGeneration => {
            Ok(cfg.key_generation > status.key_generation || key_type_changed)
        }
        KeyRotationPolicy::WithCephVersionUpdate => {
            if desired.is_zero() {
                return Ok(false);
            }
            if status.key_ceph_version.is_empty() {
                // Brownfield key, rotate once so the status records a version.
                return Ok(true);
            }
            let created_by = CephVersion::parse_status(&status.key_ceph_version)?;
            Ok(desired.release() > created_by.release())
        }
    }
}

/// Status to record after a pass that did or did not rotate the key.
pub fn updated_status(
    did_rotate: bool,
    cfg: &CephxConfig,
    running: &CephVersion,
    prior: &CephxStatus,
    key_type: Option<&str>,
) -> CephxStatus {
    if prior.is_uninitialized() {
        return CephxStatus {
            key_generation: cfg.generation_floor().max(1),
            key_ceph_version: running.without_commit_id().to_string(),
            key_type: key_type.map(str::to_owned),
        };
    }
    if !did_rotate {
        return prior.clone();
    }
    CephxStatus {
        key_generation: prior
            .key_generation
            .saturating_add(1)
            .max(cfg.generation_floor()),
        key_ceph_version: running.without_commit_id().to_string(),
        key_type: key_type.map(str::to_owned),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(policy: Option<&str>, key_generation: u32) -> CephxConfig {
        CephxConfig {
            key_rotation_policy: policy.map(str::to_owned),
            key_generation,
            key_type: None,
        }
    }

    fn status(key_generation: u32, key_ceph_version: &str) -> CephxStatus {
        CephxStatus {
            key_generation,
            key_ceph_version: key_ceph_version.to_owned(),
            key_type: None,
        }
    }

    fn v(major: u32, minor: u32, extra: u32) -> CephVersion {
        CephVersion::new(major, minor, extra)
    }

    #[test]
    fn too_old_to_rotate() {
        let old = v(16, 2, 15);
        for policy in [None, Some("Disabled"), Some("KeyGeneration"), Some("InVaLiD")] {
            assert_eq!(
                should_rotate(&cfg(policy, 9), &old, &v(18, 2, 0), &status(1, "16.2.0-0"), false),
                Ok(false),
                "{policy:?}"
            );
        }
    }

    #[test]
    fn uninitialized_never_rotates() {
        for policy in [None, Some("KeyGeneration"), Some("WithCephVersionUpdate")] {
            assert_eq!(
                should_rotate(
                    &cfg(policy, 5),
                    &v(18, 2, 0),
                    &v(19, 2, 0),
                    &CephxStatus::uninitialized(),
                    false
                ),
                Ok(false),
                "{policy:?}"
            );
        }
    }

    #[test]
    fn disabled() {
        let running = v(18, 2, 0);
        for policy in [None, Some(""), Some("Disabled")] {
            assert_eq!(
                should_rotate(&cfg(policy, 7), &running, &v(19, 0, 0), &status(1, ""), false),
                Ok(false),
                "{policy:?}"
            );
        }
    }

    #[test]
    fn key_type_change_forces_rotation() {
        let running = v(18, 2, 0);
        let mut config = cfg(Some("Disabled"), 0);
        config.key_type = Some("aes256k".to_owned());
        let mut current = status(1, "18.2.0-0");
        current.key_type = Some("aes".to_owned());

        assert_eq!(
            should_rotate(&config, &running, &running, &current, false),
            Ok(true)
        );
        assert_eq!(
            should_rotate(&config, &running, &running, &current, true),
            Ok(false),
            "key type ignored"
        );
        current.key_type = Some("aes256k".to_owned());
        assert_eq!(
            should_rotate(&config, &running, &running, &current, false),
            Ok(false),
            "key type unchanged"
        );

        config.key_rotation_policy = Some("KeyGeneration".to_owned());
        current.key_type = None;
        assert_eq!(
            should_rotate(&config, &running, &running, &current, false),
            Ok(true),
            "key generation policy also honors key type"
        );
    }

    #[test]
    fn key_generation() {
        let running = v(17, 2, 0);
        let gen = |configured, recorded| {
            should_rotate(
                &cfg(Some("KeyGeneration"), configured),
                &running,
                &running,
                &status(recorded, "17.2.0-0"),
                false,
            )
        };
        assert_eq!(gen(2, 1), Ok(true));
        assert_eq!(gen(1, 1), Ok(false));
        assert_eq!(gen(0, 1), Ok(false));
        assert_eq!(gen(3, 5), Ok(false));
        assert_eq!(
            should_rotate(
                &cfg(Some("KeyGeneration"), 2),
                &running,
                &running,
                &status(0, ""),
                false
            ),
            Ok(true),
            "brownfield"
        );
    }

    #[test]
    fn with_ceph_version_update() {
        let policy = cfg(Some("WithCephVersionUpdate"), 0);
        let running = v(18, 2, 0);
        let check = |desired: &CephVersion, recorded: &str| {
            should_rotate(&policy, &running, desired, &status(1, recorded), false)
        };

        assert_eq!(check(&CephVersion::default(), "17.2.0-0"), Ok(false), "desired unknown");
        assert_eq!(check(&v(18, 2, 0), ""), Ok(true), "brownfield");
        assert_eq!(check(&v(18, 2, 0), "17.2.6-0"), Ok(true), "upgraded");
        assert_eq!(check(&v(18, 2, 0), "18.2.0-0"), Ok(false), "same version");
        assert_eq!(check(&v(18, 2, 0), "18.2.1-0"), Ok(false), "downgrade");
        let with_commit = CephVersion {
            commit_id: "5dd24139a1eada541a3bc16b6941c5dde975e26d".to_owned(),
            ..v(18, 2, 0)
        };
        assert_eq!(check(&with_commit, "18.2.0-0"), Ok(false), "commit ignored");
        assert_eq!(
            check(&v(18, 2, 0), "v17.2.6"),
            Err(Error::Version(ParseVersionError("v17.2.6".to_owned())))
        );
    }

    #[test]
    fn dated_image_tag_rotates_once() {
        let policy = cfg(Some("WithCephVersionUpdate"), 0);
        let running = CephVersion::parse_status("18.2.0-0").unwrap();
        let desired = CephVersion::from_image("quay.io/ceph/ceph:v18.2.0-20230801").unwrap();
        let mut current = status(1, "17.2.6-0");
        let mut rotations = 0;
        for _ in 0..3 {
            let rotate = should_rotate(&policy, &running, &desired, &current, false).unwrap();
            if rotate {
                rotations += 1;
            }
            current = updated_status(rotate, &policy, &running, &current, None);
        }
        assert_eq!(rotations, 1);
        assert_eq!(current, status(2, "18.2.0-0"));
    }

    #[test]
    fn build_number_does_not_trigger_rotation() {
        let policy = cfg(Some("WithCephVersionUpdate"), 0);
        let running = CephVersion::parse_status("18.2.0-3").unwrap();
        let desired = CephVersion {
            build: 9,
            ..v(18, 2, 0)
        };
        assert_eq!(
            should_rotate(&policy, &running, &desired, &status(2, "18.2.0-3"), false),
            Ok(false)
        );
    }

    #[test]
    fn generation_saturates() {
        let rotated = updated_status(
            true,
            &cfg(Some("Disabled"), 0),
            &v(18, 2, 0),
            &status(u32::MAX, "18.2.0-0"),
            None,
        );
        assert_eq!(rotated.key_generation, u32::MAX);
    }

    #[test]
    fn rotation_supported_by_version() {
        let policy = cfg(Some("KeyGeneration"), 4);
        let recorded = status(1, "");
        assert_eq!(
            should_rotate(&policy, &v(20, 2, 2), &v(20, 2, 2), &recorded, false),
            Ok(true)
        );
        assert_eq!(
            should_rotate(&policy, &v(16, 2, 14), &v(16, 2, 14), &recorded, false),
            Ok(false)
        );
    }

    #[test]
    fn unknown_policy() {
        assert_eq!(
            should_rotate(
                &cfg(Some("InVaLiD"), 0),
                &v(18, 2, 0),
                &v(18, 2, 0),
                &status(1, "18.2.0-0"),
                false
            ),
            Err(Error::UnknownPolicy("InVaLiD".to_owned()))
        );
    }

    #[test]
    fn status_after_first_creation() {
        let running = v(17, 2, 0);
        let prior = CephxStatus::uninitialized();
        for did_rotate in [false, true] {
            assert_eq!(
                updated_status(did_rotate, &cfg(None, 0), &running, &prior, None),
                status(1, "17.2.0-0")
            );
        }
        assert_eq!(
            updated_status(false, &cfg(Some("KeyGeneration"), 3), &running, &prior, None),
            status(3, "17.2.0-0")
        );
        assert_eq!(
            updated_status(false, &cfg(Some("Disabled"), 3), &running, &prior, None),
            status(1, "17.2.0-0"),
            "generation only counts under KeyGeneration"
        );
    }

    #[test]
    fn status_without_rotation_is_kept() {
        let running = v(18, 2, 0);
        for prior in [status(0, ""), status(4, "17.2.0-0")] {
            assert_eq!(
                updated_status(false, &cfg(Some("KeyGeneration"), 9), &running, &prior, None),
                prior
            );
        }
    }

    #[test]
    fn status_after_rotation() {
        let running = CephVersion {
            commit_id: "abc".to_owned(),
            ..v(18, 2, 1)
        };
        assert_eq!(
            updated_status(true, &cfg(Some("KeyGeneration"), 2), &running, &status(1, "17.2.0-0"), None),
            status(2, "18.2.1-0")
        );
        assert_eq!(
            updated_status(true, &cfg(Some("KeyGeneration"), 7), &running, &status(1, "17.2.0-0"), None),
            status(7, "18.2.1-0")
        );
        assert_eq!(
            updated_status(true, &cfg(Some("WithCephVersionUpdate"), 7), &running, &status(0, ""), None),
            status(1, "18.2.1-0"),
            "brownfield"
        );
        let rotated = updated_status(
            true,
            &cfg(Some("Disabled"), 0),
            &running,
            &status(3, "18.2.0-0"),
            Some("aes256k"),
        );
        assert_eq!(rotated.key_generation, 4);
        assert_eq!(rotated.key_type.as_deref(), Some("aes256k"));
    }

    #[test]
    fn generation_is_monotonic() {
        let running = v(18, 2, 0);
        let config = cfg(Some("KeyGeneration"), 0);
        let mut current = CephxStatus::uninitialized();
        let mut last = 0;
        for configured in [1, 1, 3, 2, 2, 6, 0] {
            let config = CephxConfig {
                key_generation: configured,
                ..config.clone()
            };
            let rotate = should_rotate(&config, &running, &running, &current, false).unwrap();
            current = updated_status(rotate, &config, &running, &current, None);
            assert!(current.key_generation >= last);
            last = current.key_generation;
        }
        assert_eq!(current.key_generation, 6);
    }
}
