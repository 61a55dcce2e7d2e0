use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use servmesh::{generate_secret_key, Node, NodeConfig, Reply, SecretKey};

#[derive(Clone, Debug)]
struct SecretKeyArg(SecretKey);

impl FromStr for SecretKeyArg {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let key = SecretKey::from_hex(s.trim())
            .context("secret key must be 128 hex characters (64 bytes)")?;
        Ok(SecretKeyArg(key))
    }
}

#[derive(Parser, Debug)]
#[command(name = "servmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address (repeatable). Defaults to an auto-selected loopback port.
    #[arg(short, long, value_name = "ADDR")]
    bind: Vec<String>,

    /// Address advertised to peers, if different from the bound one.
    #[arg(long, value_name = "ADDR")]
    public_addr: Option<String>,

    #[arg(short = 'B', long = "bootstrap", value_name = "ADDR")]
    bootstrap: Vec<String>,

    /// Hex-encoded 64-byte secret key. A fresh one is generated if omitted.
    #[arg(long, value_name = "HEX")]
    secret_key: Option<SecretKeyArg>,

    /// Print a new secret key and exit.
    #[arg(long)]
    generate_key: bool,

    /// Serve an `echo` service that returns each request body.
    #[arg(long)]
    echo: bool,

    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        println!("{}", generate_secret_key().to_hex());
        return Ok(());
    }

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let secret = match args.secret_key {
        Some(SecretKeyArg(key)) => key,
        None => generate_secret_key(),
    };

    let mut config = NodeConfig::default().with_secret_key(secret);
    config.bind_addrs = args.bind;
    config.public_addr = args.public_addr;
    config.addrs = args.bootstrap;
    if args.echo {
        config = config.service("echo", |ctx: servmesh::Context| async move {
            let body = ctx.body.bytes().await?;
            Ok::<_, anyhow::Error>(Reply::new(body))
        });
    }

    let node = Node::start(config).await.context("failed to start node")?;
    if let Some(identity) = node.identity().await {
        info!("Node identity: {}", identity);
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                info!(
                    peers = node.peers().await.len(),
                    connections = node.providers().await.len(),
                    "status"
                );
            }
        }
    }

    if let Err(e) = node.shutdown().await {
        warn!(error = %e, "shutdown failed");
    }
    Ok(())
}
