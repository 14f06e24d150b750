//! Unit tests for the Scaleway provider's pure helpers.

use std::collections::HashMap;
use std::sync::Mutex;

use reqwest::StatusCode;
use rstest::rstest;
use scaleway_rs::ScalewayImage;

use super::image::SnapshotImporter;
use super::types::{IpList, ServerList};
use super::*;
use crate::provider::{ImageHandle, ProviderFuture, ResourceStatus};

fn config() -> ScalewayConfig {
    ScalewayConfig {
        secret_key: String::from("secret"),
        default_project_id: String::from("proj"),
        default_zone: String::from("nl-ams-1"),
        commercial_type: String::from("DEV1-S"),
        image_name: String::from("Fedora CoreOS"),
        image_arch: String::from("x86_64"),
        snapshot_volume_type: String::from("l_ssd"),
    }
}

#[rstest]
fn new_rejects_missing_secret() {
    let err = ScalewayProvider::new(ScalewayConfig {
        secret_key: String::new(),
        ..config()
    })
    .expect_err("missing secret");
    assert!(matches!(err, ProviderError::Config(ref msg) if msg.contains("SCW_SECRET_KEY")));
}

#[rstest]
fn urls_are_scoped_to_the_configured_zone() {
    let provider = ScalewayProvider::new(config()).expect("provider");
    assert_eq!(provider.zone(), "nl-ams-1");
    assert_eq!(
        provider.url("servers/abc"),
        "https://api.scaleway.com/instance/v1/zones/nl-ams-1/servers/abc"
    );
}

#[rstest]
fn placeholders_map_to_afterburn_variables() {
    let provider = ScalewayProvider::new(config()).expect("provider");
    let placeholders = provider.placeholders();
    assert_eq!(
        placeholders.get(PUBLIC_IPV4_PLACEHOLDER).map(String::as_str),
        Some("${AFTERBURN_SCALEWAY_IPV4_PUBLIC}")
    );
    assert!(placeholders.contains_key(PRIVATE_IPV4_PLACEHOLDER));
}

#[rstest]
#[case(StatusCode::NOT_FOUND, "get_server")]
fn not_found_names_the_target(#[case] status: StatusCode, #[case] operation: &str) {
    let err = error::from_status(status, b"{}", operation, "srv-1");
    assert_eq!(
        err,
        ProviderError::NotFound {
            kind: String::from("server"),
            id: String::from("srv-1")
        }
    );
}

#[rstest]
#[case(StatusCode::TOO_MANY_REQUESTS, true)]
#[case(StatusCode::BAD_GATEWAY, true)]
#[case(StatusCode::BAD_REQUEST, false)]
#[case(StatusCode::UNAUTHORIZED, false)]
fn transient_statuses(#[case] status: StatusCode, #[case] transient: bool) {
    let body = br#"{"type":"invalid_arguments","message":"nope"}"#;
    let err = error::from_status(status, body, "list_servers", "servers");
    assert_eq!(err.is_transient(), transient, "{err}");
}

#[rstest]
fn auth_failures_are_configuration_errors() {
    let err = error::from_status(StatusCode::FORBIDDEN, b"denied", "list_servers", "servers");
    assert!(matches!(err, ProviderError::Config(ref msg) if msg.contains("denied")));
}

#[rstest]
fn server_listing_parses_status_and_creation_date() {
    let body = br#"{"servers":[
        {"id":"a","state":"running","creation_date":"2026-01-02T03:04:05.000000+00:00",
         "public_ips":[{"id":"ip-1","address":"51.15.0.1"}],"private_ip":null},
        {"id":"b","state":"stopped in place","creation_date":"2026-01-01T00:00:00+00:00"}
    ]}"#;
    let list: ServerList = serde_json::from_slice(body).expect("parse");
    let statuses: Vec<_> = list.servers.iter().map(Server::status).collect();
    assert_eq!(
        statuses,
        vec![
            ResourceStatus::Running,
            ResourceStatus::Other(String::from("stopped in place"))
        ]
    );
    assert_eq!(list.servers[0].public_ips[0].address, "51.15.0.1");
}

#[rstest]
fn floating_ips_keep_their_attachment() {
    let body = br#"{"ips":[
        {"id":"ip-1","address":"51.15.0.1","server":{"id":"srv-9","name":"x"},"tags":["flotilla"]},
        {"id":"ip-2","address":"51.15.0.2","server":null,"tags":[]}
    ]}"#;
    let list: IpList = serde_json::from_slice(body).expect("parse");
    let ips: Vec<FloatingIp> = list
        .ips
        .into_iter()
        .map(to_floating_ip)
        .collect::<Result<_, _>>()
        .expect("addresses");
    assert_eq!(ips[0].server_id.as_deref(), Some("srv-9"));
    assert_eq!(ips[1].server_id, None);
}

#[rstest]
#[case("s3://bucket/images/fcos.qcow2", Some(("bucket", "images/fcos.qcow2")))]
#[case("https://example.test/fcos.qcow2", None)]
#[case("s3://bucket/", None)]
fn object_urls(#[case] url: &str, #[case] expected: Option<(&str, &str)>) {
    assert_eq!(image::parse_object_url(url).ok(), expected);
}

fn marketplace_image(id: &str, arch: &str, state: &str, creation_date: &str) -> ScalewayImage {
    ScalewayImage {
        id: id.to_owned(),
        name: String::new(),
        arch: arch.to_owned(),
        creation_date: creation_date.to_owned(),
        modification_date: String::new(),
        from_server: None,
        organization: String::new(),
        public: true,
        state: state.to_owned(),
        project: String::new(),
        tags: vec![],
        zone: String::new(),
        root_volume: scaleway_rs::ScalewayImageRootVolume {
            id: String::new(),
            name: String::new(),
            size: 0,
            volume_type: String::new(),
        },
        default_bootscript: None,
        extra_volumes: scaleway_rs::ScalewayImageExtraVolumes {
            volumes: HashMap::new(),
        },
    }
}

#[rstest]
fn image_selection_prefers_newest_available_match() {
    let images = vec![
        marketplace_image("old", "x86_64", "available", "2025-01-01T00:00:00Z"),
        marketplace_image("new", "x86_64", "available", "2025-03-01T00:00:00Z"),
        marketplace_image("broken", "x86_64", "error", "2025-04-01T00:00:00Z"),
        marketplace_image("arm", "arm64", "available", "2025-05-01T00:00:00Z"),
    ];
    assert_eq!(
        image::select_image_id(images, "x86_64").as_deref(),
        Some("new")
    );
    assert_eq!(image::select_image_id(Vec::new(), "x86_64"), None);
}

/// Importer that records each backend step and fails where scripted.
#[derive(Default)]
struct ScriptedImporter {
    fail_wait: bool,
    fail_register: bool,
    steps: Mutex<Vec<String>>,
}

impl ScriptedImporter {
    fn record(&self, step: String) {
        self.steps.lock().expect("steps lock").push(step);
    }

    fn steps(&self) -> Vec<String> {
        self.steps.lock().expect("steps lock").clone()
    }
}

fn scripted_failure(fail: bool, step: &str) -> Result<(), ProviderError> {
    if fail {
        Err(ProviderError::Api {
            message: format!("{step} rejected"),
        })
    } else {
        Ok(())
    }
}

impl SnapshotImporter for ScriptedImporter {
    fn start_snapshot<'a>(
        &'a self,
        _name: &'a str,
        bucket: &'a str,
        key: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            self.record(format!("start {bucket}/{key}"));
            Ok(String::from("snap-1"))
        })
    }

    fn await_snapshot<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("await {id}"));
            scripted_failure(self.fail_wait, "snapshot import")
        })
    }

    fn register_image<'a>(
        &'a self,
        name: &'a str,
        snapshot_id: &'a str,
    ) -> ProviderFuture<'a, ImageHandle> {
        Box::pin(async move {
            self.record(format!("register {name} on {snapshot_id}"));
            scripted_failure(self.fail_register, "image registration")?;
            Ok(ImageHandle {
                id: String::from("img-1"),
                name: name.to_owned(),
            })
        })
    }

    fn delete_snapshot<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.record(format!("delete {id}"));
            Ok(())
        })
    }
}

#[rstest]
#[case::snapshot_never_ready(true, false, &["start bucket/fcos.qcow2", "await snap-1", "delete snap-1"])]
#[case::image_rejected(
    false,
    true,
    &["start bucket/fcos.qcow2", "await snap-1", "register base on snap-1", "delete snap-1"]
)]
#[tokio::test]
async fn failed_import_deletes_the_snapshot(
    #[case] fail_wait: bool,
    #[case] fail_register: bool,
    #[case] expected: &[&str],
) {
    let importer = ScriptedImporter {
        fail_wait,
        fail_register,
        ..ScriptedImporter::default()
    };

    let err = image::import_image(&importer, "base", "s3://bucket/fcos.qcow2")
        .await
        .expect_err("import fails");

    assert!(matches!(err, ProviderError::Api { .. }), "{err}");
    assert_eq!(importer.steps(), expected);
}

#[rstest]
#[tokio::test]
async fn successful_import_keeps_the_snapshot() {
    let importer = ScriptedImporter::default();

    let handle = image::import_image(&importer, "base", "s3://bucket/fcos.qcow2")
        .await
        .expect("import");

    assert_eq!(handle.id, "img-1");
    assert_eq!(
        importer.steps(),
        ["start bucket/fcos.qcow2", "await snap-1", "register base on snap-1"]
    );
}

#[rstest]
#[tokio::test]
async fn malformed_source_touches_nothing() {
    let importer = ScriptedImporter::default();

    let err = image::import_image(&importer, "base", "https://example.test/fcos.qcow2")
        .await
        .expect_err("not an object URL");

    assert!(matches!(err, ProviderError::Config(_)), "{err}");
    assert!(importer.steps().is_empty());
}
