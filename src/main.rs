use clap::{Parser, Subcommand};
use hashchain::config::NodeConfig;
use hashchain::runtime::Runtime;
use hashchain::storage::{BlockStore, SledStorage};
use hashchain::validation::validate_chain;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "hashchain", about = "Proof-of-work ledger node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a node and serve its HTTP API
    Serve {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Address to listen on, e.g. 127.0.0.1:5000
        #[arg(long)]
        listen: Option<String>,
        /// Directory of the on-disk block log
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Peer to register at startup (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
    },
    /// Check the chain stored in a block log
    Verify {
        #[arg(long)]
        data_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Serve {
            config,
            listen,
            data_dir,
            peers,
        } => serve(config, listen, data_dir, peers).await,
        Command::Verify { data_dir } => verify(data_dir),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "fatal");
            ExitCode::FAILURE
        }
    }
}

async fn serve(
    config_path: Option<PathBuf>,
    listen: Option<String>,
    data_dir: Option<PathBuf>,
    peers: Vec<String>,
) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let mut config = match config_path {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    if let Some(listen) = listen {
        config.listen_addr = listen;
    }
    if data_dir.is_some() {
        config.data_dir = data_dir;
    }
    config.peers.extend(peers);

    let runtime = Arc::new(Runtime::open(&config)?);
    let listener = TcpListener::bind(&config.listen_addr).await?;

    let shutdown = CancellationToken::new();
    let server = tokio::spawn(hashchain::http::serve(
        listener,
        Arc::clone(&runtime),
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    server.await??;
    Ok(ExitCode::SUCCESS)
}

fn verify(data_dir: PathBuf) -> Result<ExitCode, Box<dyn std::error::Error>> {
    let store = SledStorage::new(&data_dir)?;
    let chain = store.load_chain()?;
    match validate_chain(&chain) {
        Ok(()) => {
            info!(length = chain.len(), "chain is valid");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!(length = chain.len(), error = %e, "chain is invalid");
            Ok(ExitCode::FAILURE)
        }
    }
}
