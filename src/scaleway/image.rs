//! Image resolution and import for the Scaleway provider.

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use tracing::{debug, info, warn};

use super::types::{
    CreateImageBody, Image, ImageEnvelope, ImportSnapshotBody, SnapshotEnvelope, image_status,
};
use super::{RESOURCE_TAG, ScalewayProvider, error};
use crate::provider::{
    IMAGE_POLL_INTERVAL, IMAGE_READY_TIMEOUT, ImageHandle, ImageSummary, ProviderError,
    ProviderFuture, ResourceStatus,
};
use crate::retry::{PollError, wait_until_ready};

pub(super) fn summary(image: &Image) -> ImageSummary {
    ImageSummary {
        id: image.id.clone(),
        created_at: image.creation_date,
        status: image.status(),
        public: image.public,
    }
}

/// Splits `s3://bucket/key` into its bucket and object key.
pub(super) fn parse_object_url(source_url: &str) -> Result<(&str, &str), ProviderError> {
    source_url
        .strip_prefix("s3://")
        .and_then(|rest| rest.split_once('/'))
        .filter(|(bucket, key)| !bucket.is_empty() && !key.is_empty())
        .ok_or_else(|| {
            ProviderError::Config(format!(
                "image source {source_url} must be an s3://bucket/key object URL"
            ))
        })
}

impl ScalewayProvider {
    /// Picks the newest available image matching the configured label and
    /// architecture.
    pub(super) async fn resolve_image_id(&self) -> Result<String, ProviderError> {
        let images = ScalewayListInstanceImagesBuilder::new(
            self.api.clone(),
            &self.config.default_zone,
        )
        .public(true)
        .name(&self.config.image_name)
        .arch(&self.config.image_arch)
        .run_async()
        .await
        .map_err(|err| error::from_sdk(&err))?;
        select_image_id(images, &self.config.image_arch).ok_or_else(|| ProviderError::NotFound {
            kind: String::from("image"),
            id: format!(
                "{} ({}) in {}",
                self.config.image_name, self.config.image_arch, self.config.default_zone
            ),
        })
    }

    async fn wait_for_snapshot(&self, id: &str) -> Result<(), ProviderError> {
        let owned_path = format!("snapshots/{id}");
        let path = owned_path.as_str();
        wait_until_ready(IMAGE_READY_TIMEOUT, IMAGE_POLL_INTERVAL, || async move {
            let envelope: SnapshotEnvelope = self.get(path, "get_snapshot", id).await?;
            debug!(snapshot_id = %id, state = %envelope.snapshot.state, "waiting for snapshot");
            match image_status(&envelope.snapshot.state) {
                ResourceStatus::Available => Ok(true),
                ResourceStatus::Error => Err(ProviderError::Api {
                    message: format!("snapshot {id} import failed"),
                }),
                _ => Ok(false),
            }
        })
        .await
        .map_err(|err| match err {
            PollError::TimeLimitExceeded { .. } => ProviderError::Timeout {
                action: String::from("snapshot import"),
                id: id.to_owned(),
            },
            PollError::Check(inner) => inner,
        })
    }
}

/// Backend steps of an image import.
pub(super) trait SnapshotImporter {
    /// Starts importing `bucket/key` as a snapshot and returns its id.
    fn start_snapshot<'a>(
        &'a self,
        name: &'a str,
        bucket: &'a str,
        key: &'a str,
    ) -> ProviderFuture<'a, String>;

    /// Waits until the snapshot has finished importing.
    fn await_snapshot<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()>;

    /// Registers an image whose root volume is the snapshot.
    fn register_image<'a>(
        &'a self,
        name: &'a str,
        snapshot_id: &'a str,
    ) -> ProviderFuture<'a, ImageHandle>;

    fn delete_snapshot<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()>;
}

/// Imports a qcow2 object as a snapshot and registers an image on it.
///
/// The snapshot must finish importing before the image can be created. When
/// either step fails the snapshot is deleted before the error is returned.
pub(super) async fn import_image<I>(
    importer: &I,
    name: &str,
    source_url: &str,
) -> Result<ImageHandle, ProviderError>
where
    I: SnapshotImporter + ?Sized,
{
    let (bucket, key) = parse_object_url(source_url)?;
    let snapshot_id = importer.start_snapshot(name, bucket, key).await?;
    info!(snapshot_id = %snapshot_id, source = %source_url, "snapshot import started");

    let registered = match importer.await_snapshot(&snapshot_id).await {
        Ok(()) => importer.register_image(name, &snapshot_id).await,
        Err(err) => Err(err),
    };
    if let Err(err) = &registered {
        warn!(snapshot_id = %snapshot_id, error = %err, "image import failed; deleting snapshot");
        if let Err(cleanup) = importer.delete_snapshot(&snapshot_id).await {
            warn!(snapshot_id = %snapshot_id, error = %cleanup, "failed to delete snapshot");
        }
    }
    registered
}

impl SnapshotImporter for ScalewayProvider {
    fn start_snapshot<'a>(
        &'a self,
        name: &'a str,
        bucket: &'a str,
        key: &'a str,
    ) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            let body = ImportSnapshotBody {
                name,
                project: &self.config.default_project_id,
                bucket,
                key,
                volume_type: &self.config.snapshot_volume_type,
            };
            let snapshot: SnapshotEnvelope = self.post("snapshots", &body, "import_snapshot").await?;
            Ok(snapshot.snapshot.id)
        })
    }

    fn await_snapshot<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.wait_for_snapshot(id).await })
    }

    fn register_image<'a>(
        &'a self,
        name: &'a str,
        snapshot_id: &'a str,
    ) -> ProviderFuture<'a, ImageHandle> {
        Box::pin(async move {
            let body = CreateImageBody {
                name,
                root_volume: snapshot_id,
                arch: &self.config.image_arch,
                project: &self.config.default_project_id,
                tags: vec![String::from(RESOURCE_TAG)],
            };
            let image: ImageEnvelope = self.post("images", &body, "create_image").await?;
            Ok(ImageHandle {
                id: image.image.id,
                name: image.image.name,
            })
        })
    }

    fn delete_snapshot<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.delete(&format!("snapshots/{id}"), "delete_snapshot", id)
                .await
        })
    }
}

pub(super) fn select_image_id(images: Vec<ScalewayImage>, architecture: &str) -> Option<String> {
    images
        .into_iter()
        .filter(|image| image.arch == architecture)
        .filter(|image| image.state == "available")
        .max_by(|lhs, rhs| lhs.creation_date.cmp(&rhs.creation_date))
        .map(|image| image.id)
}
