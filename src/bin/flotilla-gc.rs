//! Garbage collector for Flotilla test machines.
//!
//! Deletes Scaleway servers and private images older than the grace period,
//! whichever process created them. Exits non-zero when configuration is
//! invalid or any listing or deletion fails.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flotilla::config::{ConfigError, ScalewayConfig};
use flotilla::gc::{GarbageCollector, GcError, GcSummary};
use flotilla::provider::ProviderError;
use flotilla::scaleway::ScalewayProvider;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "flotilla-gc",
    about = "Delete Scaleway servers and images older than a grace period"
)]
struct Cli {
    /// Minimum age, in seconds, before a resource is deleted.
    #[arg(long, env = "FLOTILLA_GC_GRACE_PERIOD", default_value_t = 3600)]
    grace_period: u64,
}

#[derive(Debug, Error)]
enum GcCliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("backend error: {0}")]
    Backend(#[from] ProviderError),
    #[error("collection failed: {0}")]
    Collect(#[from] GcError),
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match collect(&cli).await {
        Ok(summary) => {
            write_summary(io::stdout(), &summary);
            ExitCode::SUCCESS
        }
        Err(err) => {
            write_error(io::stderr(), &err);
            ExitCode::FAILURE
        }
    }
}

async fn collect(cli: &Cli) -> Result<GcSummary, GcCliError> {
    let config = ScalewayConfig::load_without_cli_args()?;
    let provider = ScalewayProvider::new(config)?;
    let collector =
        GarbageCollector::new(Arc::new(provider), Duration::from_secs(cli.grace_period));
    Ok(collector.run().await?)
}

fn write_summary(mut target: impl Write, summary: &GcSummary) {
    writeln!(
        target,
        "gc pass complete: deleted_servers={}, deleted_images={}",
        summary.deleted_servers.len(),
        summary.deleted_images.len()
    )
    .ok();
}

fn write_error(mut target: impl Write, err: &GcCliError) {
    writeln!(target, "flotilla-gc: {err}").ok();
}
