use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crates_proxy::cache::artifact::ArtifactStore;
use crates_proxy::cache::current_timestamp_ms;
use crates_proxy::cache::inflight::InFlightTable;
use crates_proxy::cache::sweeper::Sweeper;
use crates_proxy::cache::versions::VersionRegistry;
use crates_proxy::config::{Config, data_dir, log_path};

#[derive(Parser)]
#[command(name = "crates-proxy")]
#[command(version, about = "Caching proxy server for crates.io downloads")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the proxy server (default)
    Serve,
    /// Purge expired cache entries and exit
    Sweep,
    /// Print cache statistics and exit
    Stats,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}

/// Logs go to a file under the data directory; the returned guard must
/// stay alive so buffered lines are flushed on exit.
fn setup_logging(level: &str) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let log_path = log_path();
    std::fs::create_dir_all(data_dir())?;
    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "crates-proxy.log".to_string());
    let appender = tracing_appender::rolling::never(data_dir(), file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}

fn build_sweeper(config: &Config) -> anyhow::Result<Sweeper> {
    let store = Arc::new(ArtifactStore::new(&config.cache.storage_root)?);
    let versions = Arc::new(VersionRegistry::new(&config.db_path())?);
    Ok(Sweeper::new(
        store,
        versions,
        Arc::new(InFlightTable::new()),
        config.ttl_artifact_ms(),
        config.ttl_version_ms(),
    ))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config)?;
    let _log_guard = setup_logging(&config.logging.level)?;

    match cli.command {
        Some(Command::Sweep) => {
            let report = build_sweeper(&config)?.sweep(current_timestamp_ms())?;
            println!(
                "removed {} artifacts and {} records, reclaimed {} bytes",
                report.artifacts_removed, report.records_removed, report.bytes_reclaimed
            );
            Ok(())
        }
        Some(Command::Stats) => {
            let stats = build_sweeper(&config)?.stats(current_timestamp_ms())?;
            println!("total entries: {}", stats.total_entries);
            println!("fresh entries: {}", stats.fresh_entries);
            println!("stale entries: {}", stats.stale_entries);
            println!("total bytes:   {}", stats.total_bytes);
            Ok(())
        }
        Some(Command::Serve) | None => tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
            .block_on(crates_proxy::server::run(config)),
    }
}
