//! trip-analyze - offline chain analysis.
//!
//! Reads a canonical breadcrumb batch from a file, runs the full
//! validation and criticality pipeline, and prints the verdict. Useful
//! for inspecting exported chains without a running daemon.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use trip_core::breadcrumb::decode_batch;
use trip_core::config::VerifierConfig;
use trip_core::criticality::CriticalityEngine;
use trip_core::identity::IdentityState;

/// Offline TRIP chain analyzer.
#[derive(Parser, Debug)]
#[command(name = "trip-analyze")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a canonical CBOR breadcrumb batch.
    chain: PathBuf,

    /// Path to a verifier configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit the verdict as JSON instead of the summary line.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => VerifierConfig::from_file(path).context("failed to load configuration")?,
        None => VerifierConfig::default(),
    };

    let bytes = std::fs::read(&args.chain)
        .with_context(|| format!("failed to read {}", args.chain.display()))?;
    let crumbs = decode_batch(&bytes).context("chain is not a canonical breadcrumb batch")?;
    let Some(first) = crumbs.first() else {
        bail!("chain file contains no breadcrumbs");
    };
    let identity = first.identity;
    drop(crumbs);

    let mut state = IdentityState::new(identity, config.clone());
    state
        .ingest_batch(&bytes)
        .context("chain failed validation")?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock before epoch")?
        .as_secs();
    let engine = CriticalityEngine::new(config);
    let verdict = state.verdict(&engine, now);

    if args.json {
        let value = serde_json::json!({
            "identity": identity.to_hex(),
            "alpha": verdict.alpha,
            "r_squared": verdict.r_squared,
            "band": verdict.band.map(|b| b.label()),
            "beta": verdict.beta,
            "kappa_km": verdict.kappa_km,
            "tail_quality": verdict.tail_quality,
            "ks_distance": verdict.ks_distance,
            "predictability": verdict.predictability,
            "confidence": verdict.confidence,
            "trust_score": verdict.trust_score,
            "classification": verdict.classification.label(),
            "alert": verdict.alert.label(),
            "regime": verdict.regime.label(),
            "breadcrumbs": verdict.breadcrumb_count,
            "unique_cells": verdict.unique_cells,
            "epochs": verdict.epoch_count,
            "mean_energy": verdict.mean_energy,
            "consistency_warning": verdict.consistency_warning,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{}", verdict.summary());
    }

    Ok(())
}
