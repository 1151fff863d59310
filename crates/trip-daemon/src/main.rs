//! trip-daemon - the TRIP verifier service.
//!
//! Binds a Unix socket, serves the framed byte protocol, and holds the
//! process-global resources: the verifier signing key, the
//! trusted-identity registry, and the optional chain store. The signing
//! key and trusted registry are initialized once at startup; changing
//! either means restarting the daemon (an explicit administrative
//! transition).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trip_core::config::VerifierConfig;
use trip_core::crypto::{TrustedRegistry, load_or_generate_signing_key};
use trip_core::store::ChainStore;
use trip_daemon::server::handle_connection;
use trip_daemon::service::VerifierService;

/// TRIP verifier daemon.
#[derive(Parser, Debug)]
#[command(name = "trip-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the verifier configuration file.
    #[arg(short, long, default_value = "trip.toml")]
    config: PathBuf,

    /// Path to the Unix socket to serve.
    #[arg(long, default_value = "trip-verifier.sock")]
    socket: PathBuf,

    /// Path to the verifier signing key (created on first start).
    #[arg(long, default_value = "verifier.key")]
    key: PathBuf,

    /// Path to the chain store database; omit for memory-only
    /// operation.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Path to a trusted-identity registry file; omit to serve every
    /// identity.
    #[arg(long)]
    trusted: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    let config = if args.config.exists() {
        VerifierConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!(path = %args.config.display(), "no config file; using protocol defaults");
        VerifierConfig::default()
    };

    let signing_key =
        load_or_generate_signing_key(&args.key).context("failed to load signing key")?;
    info!(
        verifier = %hex::encode(&signing_key.verifying_key().to_bytes()[..8]),
        "verifier identity loaded"
    );

    let trusted = match &args.trusted {
        Some(path) => {
            let registry =
                TrustedRegistry::from_file(path).context("failed to load trusted registry")?;
            info!(identities = registry.len(), "trusted registry loaded");
            registry
        },
        None => TrustedRegistry::open(),
    };

    let store = match &args.db {
        Some(path) => Some(Arc::new(
            ChainStore::open(path).context("failed to open chain store")?,
        )),
        None => None,
    };

    let service = Arc::new(VerifierService::new(config, signing_key, trusted, store));
    let recovered = service.recover().context("chain recovery failed")?;
    if recovered > 0 {
        info!(identities = recovered, "recovery complete");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?
        .block_on(serve(service, &args.socket))
}

async fn serve(service: Arc<VerifierService>, socket: &PathBuf) -> Result<()> {
    if socket.exists() {
        std::fs::remove_file(socket).context("failed to remove stale socket")?;
    }
    let listener = UnixListener::bind(socket).context("failed to bind socket")?;
    info!(socket = %socket.display(), "verifier listening");

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM")?;
    let mut connection_id: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        connection_id += 1;
                        let peer = format!("conn-{connection_id}");
                        tokio::spawn(handle_connection(
                            Arc::clone(&service),
                            stream,
                            peer,
                        ));
                    },
                    Err(err) => warn!(%err, "accept failed"),
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received; shutting down");
                break;
            },
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                break;
            },
        }
    }

    let _ = std::fs::remove_file(socket);
    Ok(())
}
