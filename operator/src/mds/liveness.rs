//! Liveness of a metadata server as seen in the filesystem map.
//!
//! The probe is healthy when the daemon holds a rank in its filesystem or is a standby.
//! Failing to read the map is never a reason to restart the daemon: a monitor outage
//! would otherwise turn into an MDS restart storm.
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{ExecAction, Probe};
use serde::{Deserialize, Deserializer};

/// Seconds before the first probe.
pub const INITIAL_DELAY_SECONDS: i32 = 30;
/// Seconds between probes.
pub const PERIOD_SECONDS: i32 = 30;
/// Seconds a single probe may take.
pub const TIMEOUT_SECONDS: i32 = 25;
/// Seconds the fs map query may take, less than the probe timeout.
pub const COMMAND_TIMEOUT_SECONDS: u64 = 20;
/// Consecutive failures before a restart.
pub const FAILURE_THRESHOLD: i32 = 5;

/// The parts of `ceph fs dump --format json` the probe reads.
#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct FsMap {
    /// Every filesystem with its MDS map.
    #[serde(default, deserialize_with = "null_as_default")]
    pub filesystems: Vec<Filesystem>,
    /// Daemons waiting for a rank.
    #[serde(default, deserialize_with = "null_as_default")]
    pub standbys: Vec<MdsInfo>,
}

/// A filesystem entry of the fs map.
#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct Filesystem {
    /// MDS map of the filesystem.
    #[serde(default, deserialize_with = "null_as_default")]
    pub mdsmap: MdsMap,
}

/// MDS map of a single filesystem.
#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct MdsMap {
    /// Name of the filesystem.
    #[serde(default, deserialize_with = "null_as_default")]
    pub fs_name: String,
    /// Daemons holding a rank, keyed by gid.
    #[serde(default, deserialize_with = "null_as_default")]
    pub info: BTreeMap<String, MdsInfo>,
    /// Daemons following an active rank.
    #[serde(default, deserialize_with = "null_as_default")]
    pub standby_replay_map: BTreeMap<String, serde_json::Value>,
}

/// An MDS daemon entry.
#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct MdsInfo {
    /// Daemon id, i.e. `myfs-a`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    /// Daemon state, i.e. `up:active`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub state: String,
}

// Ceph emits `null` for empty collections in some releases.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Role of a daemon in the fs map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Holds a rank of the probed filesystem.
    Ranked,
    /// Follows an active rank of some filesystem.
    StandbyReplay,
    /// Waiting for a rank.
    Standby,
    /// Not present in the map.
    Missing,
}

impl Role {
    /// Probe exit code for the role.
    pub fn exit_code(self) -> i32 {
        match self {
            Role::Missing => 1,
            _ => 0,
        }
    }
}

/// Find the role of `daemon` with respect to filesystem `fs_name`.
pub fn evaluate(map: &FsMap, fs_name: &str, daemon: &str) -> Role {
    let ranked = map
        .filesystems
        .iter()
        .filter(|fs| fs.mdsmap.fs_name == fs_name)
        .any(|fs| fs.mdsmap.info.values().any(|info| info.name == daemon));
    if ranked {
        return Role::Ranked;
    }

    let replaying = map.filesystems.iter().any(|fs| {
        fs.mdsmap
            .standby_replay_map
            .values()
            .any(|entry| entry.get("name").and_then(|name| name.as_str()) == Some(daemon))
    });
    if replaying {
        return Role::StandbyReplay;
    }

    if map.standbys.iter().any(|standby| standby.name == daemon) {
        return Role::Standby;
    }
    Role::Missing
}

/// Exit code for the output of an fs map query.
///
/// Query failures and unparseable output are healthy.
pub fn exit_code<E>(query: Result<Vec<u8>, E>, fs_name: &str, daemon: &str) -> i32 {
    let Ok(output) = query else {
        return 0;
    };
    match serde_json::from_slice::<FsMap>(&output) {
        Ok(map) => evaluate(&map, fs_name, daemon).exit_code(),
        Err(_) => 0,
    }
}

/// Shell script implementing [`evaluate`] with `ceph` and `jq`.
///
/// Expects `MON_HOST` and `MON_INITIAL_MEMBERS` in the environment.
pub fn probe_script(fs_name: &str, daemon: &str, keyring: &str) -> String {
    format!(
        r#"outp="$(timeout {timeout} ceph fs dump --mon-host="$MON_HOST" --mon-initial-members="$MON_INITIAL_MEMBERS" --keyring '{keyring}' --name 'mds.{daemon}' --format json 2>/dev/null)"
rc=$?
if [ "$rc" -ne 0 ]; then
	echo "ceph fs dump failed with exit code $rc, not restarting mds.{daemon}"
	exit 0
fi
if ! printf '%s' "$outp" | jq -e 'type == "object"' >/dev/null 2>&1; then
	echo "fs map is not a json object, not restarting mds.{daemon}"
	exit 0
fi
if printf '%s' "$outp" | jq -e --arg fs '{fs_name}' --arg mds '{daemon}' '
	([.filesystems[]? | select(.mdsmap.fs_name == $fs) | .mdsmap.info // {{}} | .[]? | objects | select(.name == $mds)] | length > 0)
	or ([.filesystems[]? | .mdsmap.standby_replay_map // {{}} | .[]? | objects | select(.name == $mds)] | length > 0)
	or ([.standbys[]? | objects | select(.name == $mds)] | length > 0)
' >/dev/null 2>&1; then
	exit 0
fi
echo "mds.{daemon} holds no rank in filesystem {fs_name} and is not a standby"
exit 1
"#,
        timeout = COMMAND_TIMEOUT_SECONDS,
    )
}

/// Liveness probe of the MDS container.
pub fn liveness_probe(fs_name: &str, daemon: &str, keyring: &str) -> Probe {
    Probe {
        exec: Some(ExecAction {
            command: Some(vec![
                "bash".to_owned(),
                "-c".to_owned(),
                probe_script(fs_name, daemon, keyring),
            ]),
        }),
        initial_delay_seconds: Some(INITIAL_DELAY_SECONDS),
        period_seconds: Some(PERIOD_SECONDS),
        timeout_seconds: Some(TIMEOUT_SECONDS),
        failure_threshold: Some(FAILURE_THRESHOLD),
        success_threshold: Some(1),
        ..Default::default()
    }
}

/// Query the fs map and evaluate it in process.
#[cfg(feature = "controller")]
pub async fn check(
    fs_name: &str,
    daemon: &str,
    keyring: &str,
    mon_host: &str,
    mon_initial_members: &str,
) -> i32 {
    use std::time::Duration;
    use tracing::warn;

    let mut cmd = tokio::process::Command::new("ceph");
    cmd.args(["fs", "dump"])
        .arg(format!("--mon-host={mon_host}"))
        .arg(format!("--mon-initial-members={mon_initial_members}"))
        .args(["--keyring", keyring])
        .arg(format!("--name=mds.{daemon}"))
        .args(["--format", "json"])
        .kill_on_drop(true);
    let query = match tokio::time::timeout(
        Duration::from_secs(COMMAND_TIMEOUT_SECONDS),
        cmd.output(),
    )
    .await
    {
        Ok(Ok(output)) if output.status.success() => Ok(output.stdout),
        Ok(Ok(output)) => Err(format!("exit status {}", output.status)),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("timed out".to_owned()),
    };
    if let Err(err) = &query {
        warn!(%err, daemon, "failed to query fs map, assuming healthy");
    }
    exit_code(query, fs_name, daemon)
}
