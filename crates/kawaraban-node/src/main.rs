//! Kawaraban node daemon
//!
//! Runs one bulletin board node: joins the swarm through the given seeds,
//! serves the wire protocol, and keeps its caches fresh in the background.
//!
//! ## Usage
//!
//! ```bash
//! # First node of a fresh swarm
//! kawaraban --port 8000
//!
//! # Join an existing swarm
//! kawaraban --port 8000 --seed other.example:8000/server
//!
//! # Behind a fixed public address
//! kawaraban --advertise board.example:8000/server --seed other.example:8000/server
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use kawaraban_core::{server, BbsEngine, Config};

/// Kawaraban - serverless bulletin board node
#[derive(Parser)]
#[command(name = "kawaraban")]
#[command(version = "0.1.0")]
#[command(about = "Serverless peer-replicated bulletin board node")]
struct Cli {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8000)]
    port: u16,

    /// Data directory for the database
    #[arg(short, long, default_value = "data")]
    data_dir: PathBuf,

    /// Seed peer address (host:port/path), repeatable
    #[arg(short, long = "seed")]
    seeds: Vec<String>,

    /// Externally visible address (host:port/path); learned from the
    /// first seed reply when omitted
    #[arg(long = "advertise")]
    advertised_addr: Option<String>,

    /// Spam ruleset file, one regex per line
    #[arg(long)]
    spam_rules: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("kawaraban={0},kawaraban_core={0}", default_level))),
        )
        .init();

    let config = Config {
        port: cli.port,
        data_dir: cli.data_dir,
        seeds: cli.seeds,
        advertised_addr: cli.advertised_addr,
        spam_rules: cli.spam_rules,
        ..Config::default()
    };

    let listen: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let engine = Arc::new(BbsEngine::new(config).context("engine setup failed")?);

    let maintenance = engine.start().await;
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("cannot listen on {listen}"))?;
    info!(%listen, "Node up");

    tokio::select! {
        result = server::serve(engine.clone(), listener) => {
            result.context("server exited")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    for task in maintenance {
        task.abort();
    }
    engine.shutdown().await;
    Ok(())
}
