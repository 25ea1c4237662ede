//! Place all spec types into the mirror module.
mod spec;

pub use spec::*;

#[cfg(feature = "controller")]
pub mod controller;
#[cfg(feature = "controller")]
mod deployment;

#[cfg(feature = "controller")]
pub use deployment::{fs_mirror_deployment, FS_MIRROR_APP};

use crate::{cephx::CephxStatus, version::CephVersion};

/// Cephx entity of the mirror daemon.
pub const FS_MIRROR_ENTITY: &str = "client.fs-mirror";

/// Oldest engine shipping cephfs-mirror.
pub fn min_fs_mirror_version() -> CephVersion {
    CephVersion::new(16, 2, 0)
}

impl CephFilesystemMirror {
    /// Recorded key status of the mirror daemon.
    pub fn cephx_status(&self) -> Option<&CephxStatus> {
        self.status.as_ref()?.cephx.as_ref()?.daemon.as_ref()
    }

    /// Record the key status of the mirror daemon.
    pub fn set_cephx_status(&mut self, status: CephxStatus) {
        self.status
            .get_or_insert_with(Default::default)
            .cephx
            .get_or_insert_with(Default::default)
            .daemon = Some(status);
    }
}
