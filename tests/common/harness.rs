//! Shared flight fixture for integration tests.
//!
//! Include it from a top-level test file with:
//!
//! ```rust
//! #[path = "common/harness.rs"]
//! mod harness;
//! ```

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use flotilla::journal::JournalFactory;
use flotilla::test_support::{MemoryProvider, RecordingRunner};
use flotilla::{Flight, FlightConfig};
use tempfile::TempDir;

/// Minimal cloud-config used as a user-data template.
pub const USER_DATA: &str = "#cloud-config\nwrite_files:\n  - content: $public_ipv4\n";

/// A flight wired to in-memory doubles and a temporary output directory.
pub struct Harness {
    /// Backend double shared with the flight.
    pub provider: MemoryProvider,
    /// SSH double shared with the flight.
    pub runner: RecordingRunner,
    /// Flight under test.
    pub flight: Flight,
    /// Output directory root.
    pub output: Utf8PathBuf,
    _tmp: TempDir,
}

/// Fast-failing configuration rooted at `output`.
pub fn config(output: &Utf8Path) -> FlightConfig {
    FlightConfig {
        output_dir: output.to_string(),
        pool_capacity: 4,
        ssh_ready_timeout_secs: 1,
        ssh_poll_interval_secs: 1,
        provision_timeout_secs: 30,
    }
}

/// Builds a harness around `provider`.
pub async fn harness(provider: MemoryProvider) -> Harness {
    harness_with(provider, RecordingRunner::new(), None, |config| config).await
}

/// Builds a harness with explicit collaborators and a config tweak.
pub async fn harness_with(
    provider: MemoryProvider,
    runner: RecordingRunner,
    journals: Option<Arc<dyn JournalFactory>>,
    tweak: impl FnOnce(FlightConfig) -> FlightConfig,
) -> Harness {
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = Utf8PathBuf::from_path_buf(tmp.path().join("out")).expect("utf8 tempdir");
    let mut builder = Flight::builder(Arc::new(provider.clone()))
        .config(tweak(config(&output)))
        .command_runner(Arc::new(runner.clone()));
    if let Some(factory) = journals {
        builder = builder.journal_factory(factory);
    }
    let flight = builder.build().await.expect("flight builds");
    Harness {
        provider,
        runner,
        flight,
        output,
        _tmp: tmp,
    }
}
