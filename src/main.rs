//! rtcproxy entry point
//!
//! Loads the configuration, connects to the signaling bus (with retries),
//! starts the peer-connection manager and the local SOCKS5 listener, and
//! runs until ctrl-c. Exits nonzero when the listener cannot bind or the
//! signaling server stays unreachable.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use rtcproxy::{
    config::Config,
    manager::PeerManager,
    server::ProxyServer,
    signaling::{SignalClient, SignalEvent},
    Error, Result,
};

/// Command line arguments
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Config file
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Subcommand
    #[clap(subcommand)]
    command: Option<Commands>,
}

/// Subcommands
#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy
    Run {
        /// Config file
        #[clap(short, long, value_parser)]
        config: Option<PathBuf>,
    },
    /// Generate a default config file
    GenerateConfig {
        /// Output file
        #[clap(short, long, value_parser)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    info!("{} v{}", rtcproxy::NAME, rtcproxy::VERSION);

    let args = Args::parse();
    match args.command {
        Some(Commands::GenerateConfig { output }) => {
            let config = Config::default();
            let toml = toml::to_string_pretty(&config)?;
            std::fs::write(&output, toml)?;
            info!("generated config file: {}", output.display());
            Ok(())
        }
        Some(Commands::Run { config }) => run(config.or(args.config)).await,
        None => run(args.config).await,
    }
}

async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = match config_path {
        Some(path) => {
            info!("loading config from {}", path.display());
            Config::from_file(path)?
        }
        None => {
            info!("using default config");
            Config::default()
        }
    };
    config.validate()?;

    let (client, events) = connect_signaling(&config).await?;
    let manager = PeerManager::new(&config, client.sender())?;
    tokio::spawn(manager.clone().run(events));

    let server = ProxyServer::bind(&config, manager).await?;
    tokio::select! {
        result = server.run() => {
            error!("listener stopped");
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            client.close().await;
            Ok(())
        }
    }
}

/// Connect to the signaling bus, retrying per the configuration.
async fn connect_signaling(
    config: &Config,
) -> Result<(SignalClient, tokio::sync::mpsc::Receiver<SignalEvent>)> {
    let url = &config.signal.server;
    let attempts = config.signal.connect_retries.max(1);
    let mut last_error = Error::Signaling("no connect attempts made".into());
    for attempt in 1..=attempts {
        match SignalClient::connect(url, &config.signal.user).await {
            Ok(connected) => return Ok(connected),
            Err(e) => {
                warn!(attempt, attempts, "signaling connect failed: {}", e);
                last_error = e;
                if attempt < attempts {
                    tokio::time::sleep(config.retry_delay()).await;
                }
            }
        }
    }
    error!("signaling server unreachable: {}", url);
    Err(last_error)
}
