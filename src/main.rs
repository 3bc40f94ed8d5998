//! CLI entry point for the granule downloader.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::Parser;
use granule_core::auth::TOKEN_ENV_VAR;
use granule_core::orchestrator::payload_stats;
use granule_core::{
    CatalogQuery, CmrQuery, CollectionKey, DownloadReport, HttpFetcherFactory, NetrcAuthenticator,
    Orchestrator, RecordsFileQuery, store,
};
use tracing::{debug, error, info, warn};

mod cli;
mod config;
mod output;

use cli::Args;
use config::ResolvedConfig;

/// Exit code for fatal errors.
const EXIT_FAILURE: u8 = 1;
/// Exit code after Ctrl-C (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    if let Err(e) = init_tracing(&args) {
        eprintln!("Error: {e:#}");
        return ExitCode::from(EXIT_FAILURE);
    }
    debug!(?args, "CLI arguments parsed");

    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal error");
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn init_tracing(args: &Args) -> Result<()> {
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match &args.log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create log directory '{}'", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file '{}'", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

async fn run(args: Args) -> Result<ExitCode> {
    let file_config = match &args.config {
        Some(path) => Some(config::load_file_config(path)?),
        None => config::load_default_file_config()?,
    };
    let resolved = config::resolve(&args, file_config.as_ref());

    if args.stats {
        let path = payload_path(&args, &resolved)?;
        let report = payload_stats(&path)
            .with_context(|| format!("Failed to read stats for '{}'", path.display()))?;
        output::print_lines(&output::stats_report_lines(&report));
        return Ok(ExitCode::SUCCESS);
    }

    let orchestrator = build_orchestrator(&resolved)?;

    if args.verify {
        let path = payload_path(&args, &resolved)?;
        let report = orchestrator
            .verify(&path)
            .with_context(|| format!("Failed to verify '{}'", path.display()))?;
        output::print_lines(&output::verify_report_lines(&report));
        return Ok(ExitCode::SUCCESS);
    }

    let report = if args.retry {
        let path = payload_path(&args, &resolved)?;
        orchestrator.retry(&path).await?
    } else if let Some(path) = &args.payload_file {
        orchestrator.download_payload(path).await?
    } else {
        let key = collection_key(&args, &resolved)?;
        let query: Box<dyn CatalogQuery> = match &args.records_file {
            Some(records) => Box::new(RecordsFileQuery::new(records)),
            None => Box::new(CmrQuery::new()?),
        };
        orchestrator.download(&key, query.as_ref()).await?
    };

    Ok(finish(&report))
}

fn build_orchestrator(resolved: &ResolvedConfig) -> Result<Orchestrator> {
    let netrc = match &resolved.netrc_file {
        Some(path) => NetrcAuthenticator::new(path),
        None => NetrcAuthenticator::from_home()?,
    }
    .with_token(std::env::var(TOKEN_ENV_VAR).ok());

    let fetchers = HttpFetcherFactory::new(
        resolved.connect_timeout_secs,
        resolved.read_timeout_secs,
        resolved.retry_policy.clone(),
    );

    let orchestrator = Orchestrator::new(resolved.settings.clone(), fetchers, netrc)?;
    let interrupted = orchestrator.interrupt_flag();
    spawn_interrupt_listener(interrupted);
    Ok(orchestrator)
}

fn spawn_interrupt_listener(interrupted: Arc<AtomicBool>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight downloads and saving state");
            interrupted.store(true, Ordering::SeqCst);
        }
    });
}

fn collection_key(args: &Args, resolved: &ResolvedConfig) -> Result<CollectionKey> {
    let (Some(shortname), Some(version)) = (&args.shortname, &args.collection_version) else {
        bail!("--shortname and --version are required unless --payload-file is given");
    };
    Ok(CollectionKey::new(shortname, version)
        .with_temporal(args.temporal)
        .with_limit(resolved.limit))
}

/// Explicit `--payload-file`, else the newest snapshot matching the collection.
fn payload_path(args: &Args, resolved: &ResolvedConfig) -> Result<PathBuf> {
    if let Some(path) = &args.payload_file {
        return Ok(path.clone());
    }
    let key = collection_key(args, resolved)?;
    let cache_dir = &resolved.settings.cache_dir;
    match store::find_latest(cache_dir, &key)? {
        Some(path) => {
            info!(path = %path.display(), "using latest payload");
            Ok(path)
        }
        None => bail!(
            "No payload for {key} in '{}'. Run a download first or pass --payload-file.",
            cache_dir.display()
        ),
    }
}

fn finish(report: &DownloadReport) -> ExitCode {
    output::print_lines(&output::download_report_lines(report));
    if report.interrupted {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if report.auth_failure.is_some() {
        ExitCode::from(EXIT_FAILURE)
    } else {
        ExitCode::SUCCESS
    }
}
