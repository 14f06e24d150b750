//! Unit tests for the provider contract helpers.

use std::time::Duration;

use rstest::rstest;

use super::*;
use crate::test_support::MemoryProvider;

const TICK: Duration = Duration::from_millis(5);

#[tokio::test]
async fn create_image_and_wait_returns_once_available() {
    let provider = MemoryProvider::new();
    provider.image_ready_after(Some(3));

    let image = create_image_and_wait(
        &provider,
        "fcos",
        "https://example.test/fcos.qcow2",
        Duration::from_secs(5),
        TICK,
    )
    .await
    .expect("image becomes available");

    assert_eq!(image.name, "fcos");
    assert_eq!(provider.image_ids(), vec![image.id]);
    assert!(provider.deleted_images().is_empty());
}

#[tokio::test]
async fn create_image_and_wait_deletes_image_on_timeout() {
    let provider = MemoryProvider::new();
    provider.image_ready_after(None);

    let err = create_image_and_wait(
        &provider,
        "stuck",
        "https://example.test/stuck.qcow2",
        Duration::from_millis(30),
        TICK,
    )
    .await
    .expect_err("image never settles");

    let ProviderError::Timeout { action, id } = err else {
        panic!("expected timeout, got {err:?}");
    };
    assert_eq!(action, "image upload");
    assert_eq!(provider.deleted_images(), vec![id]);
    assert!(provider.image_ids().is_empty());
}

#[tokio::test]
async fn create_image_and_wait_surfaces_error_status() {
    let provider = MemoryProvider::new();
    provider.fail_image_uploads();

    let err = create_image_and_wait(
        &provider,
        "corrupt",
        "https://example.test/corrupt.qcow2",
        Duration::from_secs(5),
        TICK,
    )
    .await
    .expect_err("image upload fails");

    assert!(matches!(err, ProviderError::Api { ref message } if message.contains("error state")));
    assert_eq!(provider.deleted_images().len(), 1);
}

#[tokio::test]
async fn default_floating_ip_operations_are_unsupported() {
    struct Bare;

    impl Provider for Bare {
        fn name(&self) -> &str {
            "bare"
        }
        fn create_server<'a>(&'a self, _: &'a ServerRequest) -> ProviderFuture<'a, ServerHandle> {
            Box::pin(async { Err(ProviderError::unsupported("bare", "create_server")) })
        }
        fn delete_server<'a>(&'a self, _: &'a str) -> ProviderFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn create_image<'a>(&'a self, _: &'a str, _: &'a str) -> ProviderFuture<'a, ImageHandle> {
            Box::pin(async { Err(ProviderError::unsupported("bare", "create_image")) })
        }
        fn describe_image<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ImageSummary> {
            Box::pin(async move {
                Err(ProviderError::NotFound {
                    kind: String::from("image"),
                    id: id.to_owned(),
                })
            })
        }
        fn delete_image<'a>(&'a self, _: &'a str) -> ProviderFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
        fn list_servers(&self) -> ProviderFuture<'_, Vec<ServerSummary>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn list_images(&self) -> ProviderFuture<'_, Vec<ImageSummary>> {
            Box::pin(async { Ok(Vec::new()) })
        }
        fn console_output<'a>(&'a self, _: &'a str) -> ProviderFuture<'a, String> {
            Box::pin(async { Ok(String::new()) })
        }
    }

    let provider = Bare;
    assert_eq!(
        provider.create_floating_ip().await,
        Err(ProviderError::unsupported("bare", "create_floating_ip"))
    );
    assert_eq!(
        provider.delete_floating_ip("fip-1").await,
        Err(ProviderError::unsupported("bare", "delete_floating_ip"))
    );
    assert_eq!(provider.list_floating_ips().await, Ok(Vec::new()));
    assert!(provider.placeholders().is_empty());
    assert_eq!(provider.preflight().await, Ok(()));
}

#[rstest]
#[case(ResourceStatus::Deleting, true)]
#[case(ResourceStatus::Deleted, true)]
#[case(ResourceStatus::Running, false)]
#[case(ResourceStatus::Other(String::from("locked")), false)]
fn deleted_statuses(#[case] status: ResourceStatus, #[case] expected: bool) {
    assert_eq!(status.is_deleted(), expected);
}

#[rstest]
fn only_transient_errors_are_transient() {
    let transient = ProviderError::Transient {
        operation: String::from("list_servers"),
        message: String::from("503"),
    };
    assert!(transient.is_transient());
    assert!(!ProviderError::Config(String::from("no key")).is_transient());
}

#[rstest]
fn server_request_carries_reused_ip() {
    let request = ServerRequest::new("node", "#cloud-config").floating_ip(Some(String::from("fip-7")));
    assert_eq!(request.floating_ip.as_deref(), Some("fip-7"));
}
