//! Burrow - expose local services on public subdomains
//!
//! Runs the relay server: remote tunnel clients request a tenant over HTTP,
//! dial back into the tenant's port, and public traffic for
//! `<tenant>.<domain>` is relayed over those connections.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use burrow_control::{ClientManager, ManagerConfig};
use burrow_server::{DispatchServer, ServerConfig};

/// Burrow - reverse tunnel relay server
#[derive(Parser, Debug)]
#[command(name = "burrow")]
#[command(about = "Burrow - expose local services on public subdomains")]
#[command(version)]
#[command(long_version = concat!(
    env!("GIT_TAG"),
    "\nCommit: ", env!("GIT_HASH"),
    "\nBuilt: ", env!("BUILD_TIME")
))]
struct Cli {
    /// Address to listen on for public traffic
    #[arg(long, env = "BURROW_ADDRESS", default_value = "0.0.0.0")]
    address: IpAddr,

    /// Port to listen on for public traffic
    #[arg(long, env = "PORT", default_value = "3000")]
    port: u16,

    /// Base domain tenants live under (e.g. burrow.example.com).
    /// If unset, the tenant is everything left of the last two labels of Host.
    #[arg(long, env = "BURROW_DOMAIN")]
    domain: Option<String>,

    /// Advertise https:// tunnel URLs (TLS terminated upstream)
    #[arg(long, env = "BURROW_SECURE")]
    secure: bool,

    /// Maximum tunnel sockets a single tenant may hold open
    #[arg(long, env = "BURROW_MAX_SOCKETS", default_value = "10")]
    max_sockets: usize,

    /// How long a tenant may go without any tunnel socket (milliseconds)
    #[arg(long, env = "BURROW_GRACE_PERIOD_MS", default_value = "1000")]
    grace_period_ms: u64,

    /// Where requests for the bare domain are redirected
    #[arg(
        long,
        env = "BURROW_LANDING",
        default_value = "https://localtunnel.github.io/www/"
    )]
    landing: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Setup logging; RUST_LOG wins unless --verbose is given
fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    info!(version = env!("GIT_TAG"), commit = env!("GIT_HASH"), "Burrow starting...");

    let manager = ClientManager::new(ManagerConfig {
        max_sockets: cli.max_sockets,
        grace_period: Duration::from_millis(cli.grace_period_ms),
        tunnel_bind_addr: cli.address,
    });

    let config = ServerConfig {
        bind_addr: SocketAddr::new(cli.address, cli.port),
        domain: cli.domain,
        secure: cli.secure,
        landing_page: cli.landing,
    };

    let server = DispatchServer::bind(config, manager)
        .await
        .context("Failed to start burrow server")?;
    server.run().await.context("Burrow server stopped")?;

    Ok(())
}
