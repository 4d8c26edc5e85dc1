//! `demagnetize`: a thin CLI around the `demagnetizer` library.
//!
//! Owns argument parsing, batch-file line reading, invoking the fetch
//! coordinator, and writing the resulting bytes. No fetch logic lives here;
//! that's the library's job.
use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use demagnetizer::{FetchConfig, FetchCoordinator, Magnet};
use tracing_subscriber::EnvFilter;

const CREATED_BY: &str = concat!("demagnetize/", env!("CARGO_PKG_VERSION"));

#[derive(Parser)]
#[command(name = "demagnetize", about = "Turn magnet links into .torrent files")]
struct Cli {
    /// `error`, `warn`, `info`, `debug` or `trace`, or an `EnvFilter` spec.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch metadata for a single magnet link.
    Get {
        magnet: String,
        /// Output path. `{name}`/`{hash}` placeholders are substituted;
        /// `-` means stdout.
        #[arg(short, long, default_value = "{name}.torrent")]
        outfile: String,
    },
    /// Fetch metadata for every magnet link in a file, one per line.
    /// Blank lines and `#`-comments are ignored.
    Batch {
        file: PathBuf,
        #[arg(short, long, default_value = "{name}.torrent")]
        outfile: String,
    },
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let coordinator = FetchCoordinator::new(FetchConfig::default());

    let failures = match cli.command {
        Command::Get { magnet, outfile } => run_one(&coordinator, &magnet, &outfile).await,
        Command::Batch { file, outfile } => run_batch(&coordinator, &file, &outfile).await,
    };

    if failures == 0 {
        std::process::ExitCode::SUCCESS
    } else {
        std::process::ExitCode::FAILURE
    }
}

/// Runs one magnet to completion, writing the result per `outfile_template`.
/// Returns the number of failures (0 or 1), so `run_batch` can sum them
/// into the process exit code.
async fn run_one(coordinator: &FetchCoordinator, magnet_uri: &str, outfile_template: &str) -> usize {
    let magnet = match Magnet::parse(magnet_uri) {
        Ok(m) => m,
        Err(e) => {
            tracing::error!(magnet = magnet_uri, error = %e, "invalid magnet link");
            return 1;
        }
    };

    match coordinator.fetch(&magnet).await {
        Ok(blob) => {
            let created_at = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let torrent_bytes = demagnetizer::torrent::output::compose(&blob, &magnet.trackers, created_at, CREATED_BY);
            let outfile = demagnetizer::torrent::output::render_outfile_template(outfile_template, &blob, &magnet.info_hash);
            if let Err(e) = write_output(&outfile, &torrent_bytes) {
                tracing::error!(error = %e, "failed to write output");
                return 1;
            }
            tracing::info!(magnet = magnet_uri, outfile, "fetched metadata");
            0
        }
        Err(e) => {
            tracing::error!(magnet = magnet_uri, error = %e, "fetch failed");
            1
        }
    }
}

async fn run_batch(coordinator: &FetchCoordinator, file: &PathBuf, outfile_template: &str) -> usize {
    let contents = match std::fs::read_to_string(file) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(file = %file.display(), error = %e, "failed to read batch file");
            return 1;
        }
    };

    let mut failures = 0;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        failures += run_one(coordinator, line, outfile_template).await;
    }
    failures
}

fn write_output(outfile: &str, bytes: &[u8]) -> std::io::Result<()> {
    if outfile == "-" {
        std::io::stdout().write_all(bytes)
    } else {
        std::fs::write(outfile, bytes)
    }
}
