//! Age-based garbage collector for backend resources.
//!
//! The collector works from the backend's own listings only. It never looks at
//! in-process flights, clusters, or pools, so it can reap servers and images
//! left behind by a process that crashed long ago. Anything strictly older
//! than `now - grace_period` is deleted; anything at or after that instant is
//! left for whoever is still using it.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::provider::{Provider, ProviderError};

/// Summary of a collection pass.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct GcSummary {
    /// Ids of servers deleted during the pass.
    pub deleted_servers: Vec<String>,
    /// Ids of images deleted during the pass.
    pub deleted_images: Vec<String>,
}

/// Errors returned by the garbage collector. The first failure aborts the
/// pass.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum GcError {
    /// Raised when the grace period cannot be subtracted from the clock.
    #[error("grace period of {seconds}s is out of range")]
    InvalidGracePeriod {
        /// Requested grace period in seconds.
        seconds: u64,
    },
    /// Raised when listing a resource kind fails.
    #[error("failed to list {resource}: {source}")]
    List {
        /// Resource kind being listed (`servers` or `images`).
        resource: String,
        /// Provider failure.
        source: ProviderError,
    },
    /// Raised when deleting a server fails.
    #[error("failed to delete server {id}: {source}")]
    DeleteServer {
        /// Server that could not be deleted.
        id: String,
        /// Provider failure.
        source: ProviderError,
    },
    /// Raised when deleting an image fails.
    #[error("failed to delete image {id}: {source}")]
    DeleteImage {
        /// Image that could not be deleted.
        id: String,
        /// Provider failure.
        source: ProviderError,
    },
}

/// Deletes servers and images older than a grace period.
#[derive(Clone)]
pub struct GarbageCollector {
    provider: Arc<dyn Provider>,
    grace_period: Duration,
}

impl std::fmt::Debug for GarbageCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GarbageCollector")
            .field("provider", &self.provider.name())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

impl GarbageCollector {
    /// Creates a collector for `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>, grace_period: Duration) -> Self {
        Self {
            provider,
            grace_period,
        }
    }

    /// Grace period applied to every resource.
    #[must_use]
    pub const fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Runs one pass against the current wall clock.
    ///
    /// # Errors
    ///
    /// See [`GarbageCollector::run_at`].
    pub async fn run(&self) -> Result<GcSummary, GcError> {
        self.run_at(Utc::now()).await
    }

    /// Runs one pass treating `now` as the current time.
    ///
    /// Servers go first so that images they were booted from are no longer
    /// in use by the time images are considered. Public images are never
    /// deleted. Deleting a server hands any floating IP it holds back to the
    /// backend, never to an in-process pool.
    ///
    /// # Errors
    ///
    /// Returns [`GcError::InvalidGracePeriod`] when the threshold cannot be
    /// computed, or the first listing or deletion failure, naming the
    /// resource involved.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<GcSummary, GcError> {
        let threshold = self.threshold(now)?;
        let mut summary = GcSummary::default();

        let servers = self
            .provider
            .list_servers()
            .await
            .map_err(|source| GcError::List {
                resource: String::from("servers"),
                source,
            })?;
        for server in servers {
            if server.status.is_deleted() || server.created_at >= threshold {
                debug!(server_id = %server.id, status = %server.status, "gc skipping server");
                continue;
            }
            self.provider
                .delete_server(&server.id)
                .await
                .map_err(|source| GcError::DeleteServer {
                    id: server.id.clone(),
                    source,
                })?;
            info!(server_id = %server.id, created_at = %server.created_at, "gc deleted server");
            summary.deleted_servers.push(server.id);
        }

        let images = self
            .provider
            .list_images()
            .await
            .map_err(|source| GcError::List {
                resource: String::from("images"),
                source,
            })?;
        for image in images {
            if image.public || image.status.is_deleted() || image.created_at >= threshold {
                debug!(image_id = %image.id, public = image.public, "gc skipping image");
                continue;
            }
            self.provider
                .delete_image(&image.id)
                .await
                .map_err(|source| GcError::DeleteImage {
                    id: image.id.clone(),
                    source,
                })?;
            info!(image_id = %image.id, created_at = %image.created_at, "gc deleted image");
            summary.deleted_images.push(image.id);
        }

        Ok(summary)
    }

    fn threshold(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, GcError> {
        let invalid = || GcError::InvalidGracePeriod {
            seconds: self.grace_period.as_secs(),
        };
        let delta = TimeDelta::from_std(self.grace_period).map_err(|_| invalid())?;
        now.checked_sub_signed(delta).ok_or_else(invalid)
    }
}
