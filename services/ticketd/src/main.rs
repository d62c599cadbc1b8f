use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use ticketd::{NodeConfig, ServeError, TicketServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_STORAGE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "ticketd", about = "Replicated movie-ticket booking node")]
struct Cli {
    /// Path to this node's JSON configuration
    #[arg(long)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match NodeConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %cli.config.display(), error = %e, "configuration rejected");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let server = match TicketServer::start(config).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "startup failed");
            return ExitCode::from(match e {
                ServeError::Config(_) => EXIT_CONFIG,
                ServeError::Bind { .. } => EXIT_BIND,
                ServeError::Storage(_) => EXIT_STORAGE,
                ServeError::Raft(_) => EXIT_CONFIG,
            });
        }
    };

    if tokio::signal::ctrl_c().await.is_err() {
        error!("cannot listen for shutdown signal");
    } else {
        info!("shutdown signal received");
    }
    server.stop().await;

    ExitCode::SUCCESS
}
