//! HostMesh - cluster membership and inter-node messaging
//!
//! Runs one mesh host: joins (or founds) the mesh through the configured
//! coordinators and keeps its connections until interrupted.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use hostmesh_cluster::{HostMessenger, InMemoryCoordinateStore, LoggingFaultSink, ProcessExit};
use hostmesh_core::config::{parse_coordinator_list, MeshConfig};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "hostmesh")]
#[command(author = "HostMesh Team")]
#[command(version = hostmesh_core::VERSION)]
#[command(about = "Cluster membership and inter-node messaging", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, global = true, env = "HOSTMESH_CONFIG")]
    config: Option<String>,

    /// Comma separated coordinator list (host[:port])
    #[arg(long, env = "HOSTMESH_COORDINATORS")]
    coordinators: Option<String>,

    /// Internal interface for mesh traffic
    #[arg(long, env = "HOSTMESH_INTERNAL_INTERFACE")]
    interface: Option<String>,

    /// Internal port for mesh traffic
    #[arg(short, long, env = "HOSTMESH_INTERNAL_PORT")]
    port: Option<u16>,

    /// Display name advertised to other hosts
    #[arg(long, env = "HOSTMESH_DISPLAY_NAME")]
    name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HOSTMESH_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the mesh and run until interrupted
    Start {
        /// Wait until this many hosts have joined before reporting ready
        #[arg(long)]
        expect_hosts: Option<usize>,
    },

    /// Print the effective configuration
    Config,

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Load or create config
    let mut config = if let Some(config_path) = &cli.config {
        MeshConfig::from_file(config_path)?
    } else {
        MeshConfig::from_env()
    };

    // Override with CLI args
    if let Some(coordinators) = &cli.coordinators {
        config.mesh.coordinators = parse_coordinator_list(coordinators);
    }
    if let Some(interface) = cli.interface {
        config.node.internal_interface = interface;
    }
    if let Some(port) = cli.port {
        config.node.internal_port = port;
    }
    if let Some(name) = cli.name {
        config.node.display_name = Some(name);
    }
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    init_logging(&config);

    match cli.command {
        Some(Commands::Version) => print_banner(),
        Some(Commands::Config) => {
            config.validate()?;
            print!("{}", toml::to_string_pretty(&config)?);
        }
        Some(Commands::Start { expect_hosts }) => {
            print_banner();
            run_node(config, expect_hosts).await?;
        }
        None => {
            print_banner();
            run_node(config, None).await?;
        }
    }

    Ok(())
}

fn init_logging(config: &MeshConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_target(true))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_target(true))
            .with(filter)
            .init();
    }
}

fn print_banner() {
    println!(
        r#"
    _   _           _   __  __           _
   | | | | ___  ___| |_|  \/  | ___  ___| |__
   | |_| |/ _ \/ __| __| |\/| |/ _ \/ __| '_ \
   |  _  | (_) \__ \ |_| |  | |  __/\__ \ | | |
   |_| |_|\___/|___/\__|_|  |_|\___||___/_| |_|

   Cluster Membership and Messaging
   Version: {}
"#,
        hostmesh_core::VERSION
    );
}

async fn run_node(config: MeshConfig, expect_hosts: Option<usize>) -> anyhow::Result<()> {
    info!("Coordinators: {}", config.mesh.coordinators.join(", "));
    let join_timeout = config.mesh.join_timeout();

    let messenger = HostMessenger::builder(config)
        .coordinate_store(Arc::new(InMemoryCoordinateStore::new()))
        .fault_sink(Arc::new(LoggingFaultSink))
        .fatal_handler(Arc::new(ProcessExit))
        .build()?;
    messenger.start().await?;

    if let Some(expected) = expect_hosts {
        info!("Waiting for {} hosts to join", expected);
        messenger.wait_for_group_join(expected, join_timeout).await?;
    }
    info!(
        "Host {} ready, listening on {}",
        messenger.local_host_id(),
        messenger
            .listen_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    );

    let mut status = tokio::time::interval(Duration::from_secs(60));
    status.tick().await;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!("Failed to listen for shutdown signal: {}", e);
                }
                break;
            }
            _ = status.tick() => {
                let failed = messenger.failed_hosts();
                info!(
                    live = ?messenger.live_host_ids(),
                    failed = failed.len(),
                    "Mesh status"
                );
            }
        }
    }

    info!("Shutting down");
    messenger.shutdown();
    Ok(())
}
