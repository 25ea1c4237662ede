//! Operator for the per-node auxiliary daemons of a Ceph cluster.
#![deny(missing_docs)]

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::Client;
use opentelemetry::{global, KeyValue};
use tracing::info;

use nodedaemon_common::telemetry;
use nodedaemon_operator::{keyring::CephCli, mds, mirror, nodedaemon, utils::Context};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OTLP collector endpoint, telemetry export is off when unset.
    #[arg(long, env = "NODEDAEMON_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

/// Available Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the node daemon and filesystem mirror controllers
    Daemon {
        /// Directory holding a config and admin keyring per cluster namespace.
        #[arg(long, env = "ROOK_CONFIG_DIR", default_value = "/var/lib/rook")]
        config_dir: PathBuf,
        /// Timeout for a single ceph command.
        #[arg(long, env = "ROOK_CEPH_COMMAND_TIMEOUT", default_value_t = 15)]
        ceph_timeout_secs: u64,
        /// Do not run the filesystem mirror controller.
        #[arg(long)]
        disable_fs_mirror: bool,
    },
    /// Decide whether an MDS daemon is alive, exits 0 when it is
    MdsLiveness {
        /// Filesystem the daemon serves.
        #[arg(long)]
        filesystem: String,
        /// Daemon name, i.e. myfs-a.
        #[arg(long)]
        daemon_id: String,
        /// Keyring of the daemon.
        #[arg(long)]
        keyring: String,
        /// Monitor addresses.
        #[arg(long, env = "MON_HOST")]
        mon_host: String,
        /// Initial monitor members.
        #[arg(long, env = "MON_INITIAL_MEMBERS")]
        mon_initial_members: String,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Daemon { .. } => "daemon",
            Command::MdsLiveness { .. } => "mds-liveness",
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    // Probes run without telemetry.
    if let Command::MdsLiveness {
        filesystem,
        daemon_id,
        keyring,
        mon_host,
        mon_initial_members,
    } = &args.command
    {
        let code = mds::liveness::check(
            filesystem,
            daemon_id,
            keyring,
            mon_host,
            mon_initial_members,
        )
        .await;
        std::process::exit(code);
    }

    let metrics_controller = telemetry::init(args.otlp_endpoint.clone()).await?;

    let meter = global::meter("nodedaemon");
    let runs = meter
        .u64_counter("nodedaemon_operator_runs")
        .with_description("Number of starts of the operator")
        .init();
    runs.add(1, &[KeyValue::new("command", args.command.name())]);

    info!(?args.command, ?args.otlp_endpoint, "starting operator");
    if let Command::Daemon {
        config_dir,
        ceph_timeout_secs,
        disable_fs_mirror,
    } = args.command
    {
        let client = Client::try_default().await?;
        let auth = CephCli::new(config_dir, Duration::from_secs(ceph_timeout_secs));
        let cx = Arc::new(Context::new(client, auth));
        if disable_fs_mirror {
            nodedaemon::controller::run(cx).await;
        } else {
            tokio::join!(
                nodedaemon::controller::run(cx.clone()),
                mirror::controller::run(cx),
            );
        }
    }

    // Flush traces and metrics before shutdown
    telemetry::shutdown(metrics_controller)?;
    Ok(())
}
