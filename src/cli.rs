//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{ArgGroup, Parser};

use granule_core::TemporalRange;

/// Download every granule of an Earthdata collection, resumably.
///
/// A collection is resolved once into a payload snapshot in the cache
/// directory; later runs resume from that snapshot. Interrupt at any time
/// with Ctrl-C and run the same command again to continue.
#[derive(Parser, Debug)]
#[command(name = "granule-downloader")]
#[command(author, version, about)]
// `--version` names the collection version, not the program version.
#[command(disable_version_flag = true)]
#[command(group(ArgGroup::new("mode").args(["stats", "retry", "verify"]).multiple(false)))]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Collection short name, e.g. GEDI02_B
    #[arg(short = 's', long, requires = "version")]
    pub shortname: Option<String>,

    /// Collection version, e.g. 002
    #[arg(long = "version", id = "version", requires = "shortname")]
    pub collection_version: Option<String>,

    /// Acquisition date range, YYYY-MM-DD,YYYY-MM-DD
    #[arg(short = 't', long)]
    pub temporal: Option<TemporalRange>,

    /// Maximum number of granules to catalog (0 for no limit) [default: 2000]
    #[arg(short = 'n', long)]
    pub limit: Option<usize>,

    /// Directory for downloaded files [default: ./data]
    #[arg(short = 'd', long)]
    pub download_dir: Option<PathBuf>,

    /// Directory for payload snapshots, ledgers and failure records [default: ./cache]
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Maximum concurrent asset downloads (1-100) [default: 4]
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Completed assets between state checkpoints [default: 10]
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub checkpoint_every: Option<u32>,

    /// Transport attempts per link for transient failures (1-10) [default: 5]
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_retries: Option<u32>,

    /// Show payload statistics and exit
    #[arg(long)]
    pub stats: bool,

    /// Move failed assets back to pending and download them again
    #[arg(long)]
    pub retry: bool,

    /// Re-check completed assets on disk and reopen the ones with missing files
    #[arg(long)]
    pub verify: bool,

    /// Payload snapshot to operate on instead of resolving one from the collection
    #[arg(short = 'p', long)]
    pub payload_file: Option<PathBuf>,

    /// Build the payload from cached granule records instead of querying CMR
    #[arg(long, conflicts_with = "payload_file")]
    pub records_file: Option<PathBuf>,

    /// Query CMR again even when a matching payload snapshot exists
    #[arg(long, conflicts_with = "payload_file")]
    pub refresh: bool,

    /// Netrc file holding Earthdata credentials [default: ~/.netrc]
    #[arg(long)]
    pub netrc_file: Option<PathBuf>,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Config file [default: $XDG_CONFIG_HOME/granule-downloader/config.toml]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}
