//! keygate reference authority
//!
//! Serves the keygate license protocol over HTTP from an in-memory store
//! seeded with cards, users and recharge codes.
//!
//! Usage:
//!   keygate-authority --port 8443 --seed authority-seed.json
//!
//! All state lives in memory and is lost on exit. `RUST_LOG` overrides the
//! log filter.

use std::{fs, path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use keygate_authority::{build_router, log_filter, AuthorityInfo};
use keygate_license::{MemoryAuthority, Seed};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "keygate-authority")]
#[command(about = "keygate reference license authority")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "8443")]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind: String,

    /// Path to a JSON seed file (cards, users, recharge codes, policy)
    #[arg(short, long)]
    seed: Option<PathBuf>,

    /// Software id to serve when no seed file is given
    #[arg(long, default_value = "demo")]
    software_id: String,

    /// Enable verbose debug logging (ignored when RUST_LOG is set)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let rust_log = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(args.verbose, rust_log.as_deref()))
        .with_target(false)
        .compact()
        .init();

    info!("keygate authority starting...");
    let seed = load_seed(args.seed.as_ref(), &args.software_id)?;
    let authority = Arc::new(
        MemoryAuthority::from_seed(seed).context("Failed to build authority from seed")?,
    );
    let about = AuthorityInfo::of(&authority);

    let addr = format!("{}:{}", args.bind, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    println!("\n========================================");
    println!("  keygate Authority Running");
    println!("========================================");
    println!("  Software:   {}", about.software_id);
    println!("  Listening:  {}", addr);
    println!("  Public key: {}", about.public_key);
    println!("========================================\n");

    axum::serve(listener, build_router(authority))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    info!("keygate authority stopped");
    Ok(())
}

fn load_seed(path: Option<&PathBuf>, software_id: &str) -> Result<Seed> {
    let Some(path) = path else {
        warn!("No seed file given, serving an empty authority for {software_id:?}");
        return Ok(Seed {
            software_id: software_id.to_string(),
            ..Seed::default()
        });
    };

    info!("Loading seed from {:?}", path);
    let raw = fs::read_to_string(path).context("Failed to read seed file")?;
    let seed: Seed = serde_json::from_str(&raw).context("Failed to parse seed file")?;
    info!(
        cards = seed.cards.len(),
        users = seed.users.len(),
        recharge_codes = seed.recharge_codes.len(),
        "Seed loaded"
    );
    Ok(seed)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
