//! Failure paths of machine provisioning and the rollback they trigger.

#[path = "common/harness.rs"]
mod harness;

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use flotilla::{ClusterError, wait_until_ready};
use flotilla::journal::{Journal, JournalError, JournalFactory};
use flotilla::machine::MachineError;
use flotilla::provider::ProviderError;
use flotilla::render::RenderError;
use flotilla::test_support::{MemoryProvider, ProviderCall, RecordingRunner};
use harness::{Harness, USER_DATA, harness, harness_with};
use rstest::rstest;

struct BrokenJournals;

impl JournalFactory for BrokenJournals {
    fn new_journal(&self, directory: &Utf8Path) -> Result<Box<dyn Journal>, JournalError> {
        Err(JournalError::Io {
            path: directory.join("journal.txt"),
            message: String::from("disk full"),
        })
    }
}

fn not_ready_runner() -> RecordingRunner {
    let runner = RecordingRunner::new();
    runner.respond_to(" true", Some(255), "", "Connection refused");
    runner
}

fn entries(dir: &Utf8Path) -> Vec<Utf8PathBuf> {
    dir.read_dir_utf8()
        .expect("read cluster dir")
        .map(|entry| entry.expect("entry").path().to_owned())
        .collect()
}

fn assert_cleaned_up(h: &Harness, cluster_dir: &Utf8Path) {
    assert_eq!(h.provider.deleted_servers().len(), 1);
    assert!(h.provider.server_ids().is_empty());
    assert!(entries(cluster_dir).is_empty(), "machine dir removed");
}

#[rstest]
#[tokio::test]
async fn journal_failure_rolls_back_server_and_ip() {
    let provider = MemoryProvider::new();
    let fip = provider.seed_floating_ip();
    let h = harness_with(
        provider,
        RecordingRunner::new(),
        Some(Arc::new(BrokenJournals)),
        |config| config,
    )
    .await;
    let cluster = h.flight.new_cluster().expect("cluster");

    let err = cluster.new_machine(USER_DATA).await.expect_err("journal fails");

    assert!(matches!(err, ClusterError::Journal { .. }), "{err}");
    assert_cleaned_up(&h, cluster.dir());
    assert_eq!(h.flight.pool().snapshot(), vec![fip]);
    assert!(cluster.machines().is_empty());
}

#[rstest]
#[tokio::test]
async fn unreachable_machine_is_rolled_back() {
    let provider = MemoryProvider::new();
    let fip = provider.seed_floating_ip();
    let h = harness_with(provider, not_ready_runner(), None, |config| config).await;
    let cluster = h.flight.new_cluster().expect("cluster");

    let err = cluster.new_machine(USER_DATA).await.expect_err("not ready");

    match err {
        ClusterError::Startup { ref server_id, ref source } => {
            assert_eq!(h.provider.deleted_servers(), vec![server_id.clone()]);
            assert!(matches!(source, MachineError::NotReady { seconds: 1, .. }), "{source}");
        }
        other => panic!("expected startup failure, got {other}"),
    }
    assert_cleaned_up(&h, cluster.dir());
    assert_eq!(h.flight.pool().snapshot(), vec![fip.clone()]);
    assert_eq!(h.provider.floating_ip_ids(), vec![fip]);
}

#[rstest]
#[tokio::test]
async fn failed_delete_strands_ip_until_flight_teardown() {
    let provider = MemoryProvider::new();
    let fip = provider.seed_floating_ip();
    provider.fail_delete_server("srv-2");
    let h = harness_with(provider, not_ready_runner(), None, |config| config).await;
    let cluster = h.flight.new_cluster().expect("cluster");

    let err = cluster.new_machine(USER_DATA).await.expect_err("not ready");

    assert!(matches!(err, ClusterError::Startup { ref server_id, .. } if server_id == "srv-2"));
    assert_eq!(h.flight.pool().available(), 0, "IP still attached to srv-2");
    assert_eq!(h.flight.stranded_floating_ips(), vec![fip.clone()]);
    assert_eq!(h.provider.server_ids(), vec![String::from("srv-2")]);
    assert!(entries(cluster.dir()).is_empty());

    cluster.destroy().await;
    let report = h.flight.destroy().await;
    assert_eq!(report.deleted, vec![fip]);
    assert!(h.provider.floating_ip_ids().is_empty());
}

#[rstest]
#[tokio::test]
async fn create_failure_returns_the_reserved_ip() {
    let provider = MemoryProvider::new();
    let fip = provider.seed_floating_ip();
    provider.fail_create_server(ProviderError::Api {
        message: String::from("quota exceeded"),
    });
    let h = harness(provider).await;
    let cluster = h.flight.new_cluster().expect("cluster");

    let err = cluster.new_machine(USER_DATA).await.expect_err("create fails");

    assert!(matches!(err, ClusterError::CreateServer { .. }), "{err}");
    assert_eq!(h.flight.pool().snapshot(), vec![fip.clone()]);
    assert!(h.provider.deleted_servers().is_empty());
    assert!(matches!(
        h.provider.calls().as_slice(),
        [ProviderCall::CreateServer { floating_ip: Some(used), .. }] if *used == fip
    ));
}

#[rstest]
#[case("")]
#[case("  \n\t")]
#[tokio::test]
async fn blank_template_touches_nothing(#[case] template: &str) {
    let provider = MemoryProvider::new();
    provider.seed_floating_ip();
    let h = harness(provider).await;
    let cluster = h.flight.new_cluster().expect("cluster");

    let err = cluster.new_machine(template).await.expect_err("blank template");

    assert_eq!(err, ClusterError::Render(RenderError::EmptyTemplate));
    assert!(h.provider.calls().is_empty());
    assert_eq!(h.flight.pool().available(), 1);
}

#[rstest]
#[tokio::test]
async fn provisioning_timeout_triggers_rollback() {
    let provider = MemoryProvider::new();
    let fip = provider.seed_floating_ip();
    let h = harness_with(provider, not_ready_runner(), None, |config| {
        flotilla::FlightConfig {
            provision_timeout_secs: 1,
            ssh_ready_timeout_secs: 60,
            ..config
        }
    })
    .await;
    let cluster = h.flight.new_cluster().expect("cluster");

    let err = cluster.new_machine(USER_DATA).await.expect_err("times out");

    assert!(matches!(err, ClusterError::Timeout { seconds: 1, .. }), "{err}");
    assert_cleaned_up(&h, cluster.dir());
    assert_eq!(h.flight.pool().snapshot(), vec![fip]);
}

#[rstest]
#[tokio::test]
async fn abandoned_provisioning_is_rolled_back() {
    let provider = MemoryProvider::new();
    let fip = provider.seed_floating_ip();
    let h = harness_with(provider, not_ready_runner(), None, |config| {
        flotilla::FlightConfig {
            ssh_ready_timeout_secs: 60,
            ..config
        }
    })
    .await;
    let cluster = h.flight.new_cluster().expect("cluster");

    let outcome =
        tokio::time::timeout(Duration::from_millis(300), cluster.new_machine(USER_DATA)).await;
    assert!(outcome.is_err(), "caller stops waiting before the machine is ready");

    let memory = &h.provider;
    let pool = h.flight.pool();
    wait_until_ready(Duration::from_secs(5), Duration::from_millis(20), || async move {
        Ok::<_, Infallible>(memory.server_ids().is_empty() && pool.available() == 1)
    })
    .await
    .expect("rollback completes in the background");

    assert_eq!(h.provider.deleted_servers().len(), 1);
    assert_eq!(h.flight.pool().snapshot(), vec![fip]);
    assert!(entries(cluster.dir()).is_empty(), "machine dir removed");
    assert!(cluster.machines().is_empty());
}
