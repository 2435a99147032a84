//! Failover daemon binary.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, time::Duration};
use switchgear::{config::FailoverConfig, FailoverNode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "switchgear", about = "Failover control plane for NAT data planes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the failover daemon
    Failover(FailoverArgs),
}

#[derive(Debug, Args)]
struct FailoverArgs {
    /// Floating IP address to monitor for ownership
    #[arg(long = "eni-ip")]
    eni_ip: String,

    /// Port for RPC communication between nodes
    #[arg(long, default_value_t = 1022)]
    port: u16,

    /// Path to the local data plane's unix socket
    #[arg(long = "local-socket")]
    local_socket: PathBuf,

    /// Destination CIDR block for route table updates
    #[arg(long = "destination-cidr", default_value = "")]
    destination_cidr: String,

    /// Leader election check interval
    #[arg(long = "leader-check-interval", value_parser = humantime::parse_duration, default_value = "30s")]
    leader_check_interval: Duration,

    /// State sync interval when acting as secondary
    #[arg(long = "sync-interval", value_parser = humantime::parse_duration, default_value = "10s")]
    sync_interval: Duration,

    /// Heartbeat interval (keep below 50ms for three beats inside 150ms)
    #[arg(long = "heartbeat-interval", value_parser = humantime::parse_duration, default_value = "40ms")]
    heartbeat_interval: Duration,

    /// Number of missed heartbeats before failover
    #[arg(long = "heartbeat-miss-threshold", default_value_t = 3)]
    heartbeat_miss_threshold: u32,

    /// Disable ENI ownership checks for testing
    #[arg(long = "disable-eni-check")]
    disable_eni_check: bool,

    /// Force role to 'primary' or 'secondary' for testing
    #[arg(long = "force-role", default_value = "")]
    force_role: String,
}

impl FailoverArgs {
    fn into_config(self) -> FailoverConfig {
        FailoverConfig {
            eni_ip: self.eni_ip,
            port: self.port,
            local_socket: self.local_socket,
            destination_cidr: if self.destination_cidr.is_empty() {
                None
            } else {
                Some(self.destination_cidr)
            },
            leader_check_interval: self.leader_check_interval,
            sync_interval: self.sync_interval,
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_miss_threshold: self.heartbeat_miss_threshold,
            disable_eni_check: self.disable_eni_check,
            force_role: self.force_role,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Failover(args) => run_failover(args.into_config()).await,
    }
}

async fn run_failover(mut config: FailoverConfig) -> anyhow::Result<()> {
    config.validate().context("failed to validate failover config")?;

    // The cloud fabric adapter is deployment-specific and injected through
    // the library API; this binary runs the fabric-less test mode.
    let node = FailoverNode::start(config, None).await?;

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("exiting gracefully");
    node.stop().await;
    Ok(())
}
