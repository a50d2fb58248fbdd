//! astnode: a demo endpoint for astrun.
//!
//! `astnode serve` hosts the demo namespace on a TCP port. `astnode client`
//! registers with a server and stays connected so others can reach it through
//! the server. `astnode demo` registers, runs a call sequence against the
//! server (or, with `--peer`, against another client), and exits.

mod demo;

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use astrun::Config;
use astrun::Engine;
use astrun::tcp::TcpConnector;
use astrun::tcp::TcpListener;
use clap::Parser;
use clap::Subcommand;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "astnode")]
#[command(about = "Host or call into an astrun namespace over TCP")]
struct Cli {
    /// JSON config file; flags override its fields
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Endpoint name
    #[arg(short, long, global = true)]
    name: Option<String>,

    /// Shared registration token
    #[arg(short, long, global = true)]
    token: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the demo namespace
    Serve {
        #[arg(long, default_value = "127.0.0.1:7700")]
        listen: String,
    },
    /// Register with a server and wait for calls
    Client {
        #[arg(long, default_value = "127.0.0.1:7700")]
        server: String,
    },
    /// Register with a server and run the demo calls
    Demo {
        #[arg(long, default_value = "127.0.0.1:7700")]
        server: String,

        /// Run against this peer through the server instead
        #[arg(long)]
        peer: Option<String>,
    },
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => Config::default(),
    };
    if let Some(name) = &cli.name {
        config.name = name.clone();
    }
    if let Some(token) = &cli.token {
        config.token = Some(token.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .with_target(false)
        .compact()
        .init();

    let config = load_config(&cli)?;
    let engine = Engine::new(config);
    demo::install(&engine);

    match cli.command {
        Command::Serve { listen } => {
            let listener = TcpListener::bind(&listen).await?;
            info!(addr = %listener.local_addr()?, name = %engine.name(), "listening");

            let serving = engine.clone();
            let server = tokio::spawn(async move { serving.serve(listener).await });

            tokio::signal::ctrl_c().await?;
            info!("shutdown signal received");
            engine.close().await;
            server.await??;
        }
        Command::Client { server } => {
            let server_name = engine.connect(&TcpConnector::new(server)).await?;
            info!(server = %server_name, name = %engine.name(), "connected, waiting for calls");

            tokio::signal::ctrl_c().await?;
            engine.close().await;
        }
        Command::Demo { server, peer } => {
            let server_name = engine.connect(&TcpConnector::new(server)).await?;
            info!(server = %server_name, "connected");

            let target = match peer {
                Some(peer) => engine.peer(peer),
                None => engine.server(),
            };
            let outcome = demo::run(target).await;
            engine.close().await;
            outcome?;
        }
    }

    Ok(())
}
