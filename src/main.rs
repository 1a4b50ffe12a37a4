//! Launcher for the coordinator and the per-host agent.

use clap::{Parser, Subcommand};
use eyre::{Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use varys::agent::{Agent, AgentConfig};
use varys::coordinator::{Coordinator, CoordinatorConfig, IdentityPolicy};

#[derive(Parser, Debug)]
#[command(name = "varys")]
#[command(about = "Coflow-aware cluster data transfer fabric", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cluster coordinator
    Coordinator {
        /// Listen address, host:port
        #[arg(long, default_value = "0.0.0.0:1606")]
        listen: String,
    },
    /// Run a per-host agent
    Agent {
        /// Coordinator address, varys://host:port
        #[arg(long)]
        master: String,

        /// Host to bind and advertise to the coordinator
        #[arg(long)]
        host: String,

        /// Agent id; defaults to a generated one
        #[arg(long)]
        slave_id: Option<String>,

        /// Control port for local clients (0 = ephemeral)
        #[arg(long, default_value_t = 1607)]
        port: u16,

        /// Data port (0 = ephemeral)
        #[arg(long, default_value_t = 1608)]
        comm_port: u16,
    },
}

fn setup_logging(verbose: bool) {
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Command::Coordinator { listen } => {
            let listener = TcpListener::bind(&listen)
                .await
                .with_context(|| format!("cannot bind coordinator on {listen}"))?;
            let coordinator = Coordinator::new(CoordinatorConfig::default(), Box::new(IdentityPolicy));
            coordinator.run(listener).await;
        }
        Command::Agent {
            master,
            host,
            slave_id,
            port,
            comm_port,
        } => {
            let mut config = AgentConfig::new(master, host);
            config.port = port;
            config.comm_port = comm_port;
            if let Some(slave_id) = slave_id {
                config.slave_id = slave_id;
            }
            // VARYS_* environment overrides win over flag defaults.
            let config = config.apply_env();
            let running = Agent::start(config).await.context("agent failed to start")?;
            info!(
                slave_id = %running.slave_id,
                port = running.port,
                comm_port = running.comm_port,
                "agent started"
            );
            running.join.await?.context("agent terminated")?;
        }
    }

    Ok(())
}
