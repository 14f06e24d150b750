//! Flight construction, cluster registration, and pool drain on teardown.

#[path = "common/harness.rs"]
mod harness;

use std::sync::Arc;

use flotilla::config::ConfigError;
use flotilla::provider::ProviderError;
use flotilla::test_support::{MemoryProvider, RecordingRunner};
use flotilla::{ClusterError, Flight, FlightConfig, FlightError};
use harness::{USER_DATA, config, harness, harness_with};
use rstest::rstest;

#[rstest]
#[tokio::test]
async fn pool_is_seeded_up_to_capacity() {
    let provider = MemoryProvider::new();
    let first = provider.seed_floating_ip();
    let second = provider.seed_floating_ip();
    provider.seed_floating_ip();
    let h = harness_with(provider, RecordingRunner::new(), None, |base| FlightConfig {
        pool_capacity: 2,
        ..base
    })
    .await;

    assert_eq!(h.flight.pool().capacity(), 2);
    assert_eq!(h.flight.pool().snapshot(), vec![first, second]);
    assert_eq!(h.provider.floating_ip_ids().len(), 3, "surplus IP left alone");
}

#[rstest]
#[tokio::test]
async fn attached_ips_are_not_pooled() {
    let provider = MemoryProvider::new();
    let h = harness(provider.clone()).await;
    let cluster = h.flight.new_cluster().expect("cluster");
    cluster.new_machine(USER_DATA).await.expect("machine");

    let second = harness(provider).await;

    assert_eq!(second.provider.floating_ip_ids().len(), 1);
    assert_eq!(second.flight.pool().available(), 0);
    cluster.destroy().await;
}

#[rstest]
#[tokio::test]
async fn preflight_failure_is_reported() {
    let provider = MemoryProvider::new();
    provider.fail_list(ProviderError::Config(String::from("bad token")));
    let tmp = tempfile::tempdir().expect("tempdir");
    let output = camino::Utf8PathBuf::from_path_buf(tmp.path().to_path_buf()).expect("utf8");

    let err = Flight::builder(Arc::new(provider))
        .config(config(&output))
        .build()
        .await
        .expect_err("preflight fails");

    assert_eq!(
        err,
        FlightError::Preflight {
            provider: String::from("memory"),
            source: ProviderError::Config(String::from("bad token")),
        }
    );
}

#[rstest]
#[tokio::test]
async fn invalid_config_is_rejected_before_any_call() {
    let provider = MemoryProvider::new();
    let err = Flight::builder(Arc::new(provider.clone()))
        .config(FlightConfig {
            pool_capacity: 0,
            ..FlightConfig::default()
        })
        .build()
        .await
        .expect_err("zero capacity");

    assert!(matches!(err, FlightError::Config(ConfigError::Invalid(_))), "{err}");
    assert!(provider.calls().is_empty());
}

#[rstest]
#[tokio::test]
async fn clusters_register_until_destroyed() {
    let h = harness(MemoryProvider::new()).await;
    let first = h.flight.new_cluster().expect("first");
    let second = h.flight.new_cluster().expect("second");

    assert_ne!(first.name(), second.name());
    assert!(first.dir().is_dir());
    assert!(first.dir().starts_with(&h.output));
    assert_eq!(h.flight.clusters().len(), 2);

    first.destroy().await;
    assert_eq!(h.flight.clusters(), vec![second.name().to_owned()]);
    second.destroy().await;
    assert!(h.flight.clusters().is_empty());
}

#[rstest]
#[tokio::test]
async fn destroy_drains_pool_and_reports_failures() {
    let provider = MemoryProvider::new();
    let kept = provider.seed_floating_ip();
    let broken = provider.seed_floating_ip();
    provider.fail_delete_floating_ip(&broken);
    let h = harness(provider).await;

    let report = h.flight.destroy().await;

    assert_eq!(report.deleted, vec![kept]);
    assert_eq!(report.failed.len(), 1);
    assert!(!report.is_clean());
    assert_eq!(h.provider.floating_ip_ids(), vec![broken]);
}

#[rstest]
#[tokio::test]
async fn ip_returned_after_drain_is_deleted() {
    let provider = MemoryProvider::new();
    let fip = provider.seed_floating_ip();
    let h = harness(provider).await;
    let cluster = h.flight.new_cluster().expect("cluster");
    let machine = cluster.new_machine(USER_DATA).await.expect("machine");
    assert_eq!(machine.floating_ip(), Some(fip.as_str()));

    let report = h.flight.destroy().await;
    assert!(report.deleted.is_empty(), "pooled IP was checked out");

    cluster.destroy().await;
    assert!(h.provider.floating_ip_ids().is_empty());
}

#[rstest]
#[tokio::test]
async fn destroyed_cluster_refuses_new_machines() {
    let h = harness(MemoryProvider::new()).await;
    let cluster = h.flight.new_cluster().expect("cluster");
    let other = cluster.clone();

    cluster.destroy().await;

    assert!(other.is_closed());
    let err = other.new_machine(USER_DATA).await.expect_err("closed");
    assert_eq!(
        err,
        ClusterError::Closed {
            cluster: other.name().to_owned(),
        }
    );
    assert!(h.provider.calls().is_empty());
    assert!(h.flight.clusters().is_empty());
}
