//! Provides API for the node daemon operator and related tooling.
#![warn(missing_docs)]

/// Cephx key rotation policy.
pub mod cephx;
/// Cluster module for the CephCluster resource.
pub mod cluster;
/// Keyring rendering and key storage.
pub mod keyring;
/// Labels module for managing resource labels.
#[cfg(feature = "controller")]
pub(crate) mod labels;
/// MDS liveness decision procedure.
pub mod mds;
/// Filesystem mirror resource and controller.
pub mod mirror;
/// Monitoring module for prometheus-operator resources.
pub mod monitoring;
/// Per node crash collector and exporter daemons.
#[cfg(feature = "controller")]
pub mod nodedaemon;
/// Status subresource writers.
#[cfg(feature = "controller")]
pub mod status;
/// Utils module for shared utility functions.
#[cfg(feature = "controller")]
pub mod utils;
/// Ceph engine versions.
pub mod version;

/// Field manager name used for server side apply and the event reporter.
#[cfg(feature = "controller")]
const CONTROLLER_NAME: &str = "rook-ceph-nodedaemon";
