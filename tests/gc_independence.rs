//! Garbage collection works from provider listings alone, without a flight.

#[path = "common/harness.rs"]
mod harness;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use flotilla::GarbageCollector;
use flotilla::provider::ResourceStatus;
use flotilla::test_support::{MemoryProvider, ProviderCall};
use harness::{USER_DATA, harness};

#[tokio::test]
async fn collector_reaps_stale_resources_and_leaves_live_flights_alone() {
    let provider = MemoryProvider::new();
    let fip = provider.seed_floating_ip();
    let h = harness(provider.clone()).await;
    let cluster = h.flight.new_cluster().expect("cluster");
    let live = cluster.new_machine(USER_DATA).await.expect("machine");

    let old = Utc::now() - TimeDelta::hours(3);
    provider.seed_server("crashed", old, ResourceStatus::Running);
    provider.seed_image("stale", old, ResourceStatus::Available, false);
    provider.seed_image("shared", old, ResourceStatus::Available, true);
    let before = provider.calls().len();

    let summary = GarbageCollector::new(Arc::new(provider.clone()), Duration::from_secs(3600))
        .run()
        .await
        .expect("gc pass");

    assert_eq!(summary.deleted_servers, vec![String::from("crashed")]);
    assert_eq!(summary.deleted_images, vec![String::from("stale")]);
    assert!(provider.server_ids().contains(&live.id().to_owned()));
    assert_eq!(provider.image_ids(), vec![String::from("shared")]);
    assert!(
        provider
            .calls()
            .iter()
            .skip(before)
            .all(|call| !matches!(
                call,
                ProviderCall::CreateFloatingIp(_) | ProviderCall::DeleteFloatingIp(_)
            ))
    );
    assert_eq!(live.floating_ip(), Some(fip.as_str()));
    assert_eq!(h.flight.pool().available(), 0);

    cluster.destroy().await;
    assert_eq!(h.flight.pool().snapshot(), vec![fip]);
}
