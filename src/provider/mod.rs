//! Provider abstraction for cloud backends.
//!
//! Every backend implements [`Provider`]. Flights, clusters, and machines only
//! ever hold an `Arc<dyn Provider>`, so the orchestration core never sees a
//! concrete backend type.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::retry::{PollError, wait_until_ready};

/// Default bound on waiting for an uploaded image to become available.
pub const IMAGE_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Default interval between image status checks.
pub const IMAGE_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Placeholder substituted with the machine's public IPv4 address.
pub const PUBLIC_IPV4_PLACEHOLDER: &str = "$public_ipv4";

/// Placeholder substituted with the machine's private IPv4 address.
pub const PRIVATE_IPV4_PLACEHOLDER: &str = "$private_ipv4";

/// Future returned by provider operations.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Parameters required to create a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerRequest {
    /// Name given to the server on the backend.
    pub name: String,
    /// Rendered user-data payload, passed to the backend verbatim.
    pub user_data: String,
    /// Floating IP to associate instead of allocating a fresh one.
    pub floating_ip: Option<String>,
}

impl ServerRequest {
    /// Creates a request without a reusable floating IP.
    #[must_use]
    pub fn new(name: impl Into<String>, user_data: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            user_data: user_data.into(),
            floating_ip: None,
        }
    }

    /// Sets the floating IP to reuse.
    #[must_use]
    pub fn floating_ip(mut self, value: Option<String>) -> Self {
        self.floating_ip = value;
        self
    }
}

/// Handle returned once a server has been created.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerHandle {
    /// Backend-assigned identifier, rendered as a string.
    pub id: String,
    /// Address the machine is reachable on.
    pub public_ip: IpAddr,
    /// Address on the backend's private network, when there is one.
    pub private_ip: Option<IpAddr>,
    /// Identifier of the floating IP associated with the server.
    pub floating_ip: Option<String>,
}

/// Handle returned once an image upload has been accepted.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageHandle {
    /// Backend-assigned image identifier.
    pub id: String,
    /// Name given to the image.
    pub name: String,
}

/// Lifecycle state reported by a backend for a server or image.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ResourceStatus {
    /// Accepted but not yet usable (for example extracting or booting).
    Pending,
    /// Usable image.
    Available,
    /// Running server.
    Running,
    /// Deletion in progress.
    Deleting,
    /// Deleted; may still be listed for a while.
    Deleted,
    /// Backend reports a failure.
    Error,
    /// Any status the adapter does not map.
    Other(String),
}

impl ResourceStatus {
    /// Returns `true` when the resource is gone or on its way out.
    #[must_use]
    pub const fn is_deleted(&self) -> bool {
        matches!(self, Self::Deleting | Self::Deleted)
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Available => f.write_str("available"),
            Self::Running => f.write_str("running"),
            Self::Deleting => f.write_str("deleting"),
            Self::Deleted => f.write_str("deleted"),
            Self::Error => f.write_str("error"),
            Self::Other(status) => f.write_str(status),
        }
    }
}

/// Server entry as listed by a backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServerSummary {
    /// Backend-assigned identifier.
    pub id: String,
    /// Creation time reported by the backend.
    pub created_at: DateTime<Utc>,
    /// Current status.
    pub status: ResourceStatus,
}

/// Image entry as listed by a backend.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageSummary {
    /// Backend-assigned identifier.
    pub id: String,
    /// Creation time reported by the backend.
    pub created_at: DateTime<Utc>,
    /// Current status.
    pub status: ResourceStatus,
    /// Whether the image is shared publicly.
    pub public: bool,
}

/// Floating IP owned by the account.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FloatingIp {
    /// Backend identifier of the floating IP.
    pub id: String,
    /// Address held by the floating IP.
    pub address: IpAddr,
    /// Server the address is attached to, if any.
    pub server_id: Option<String>,
}

/// Errors raised by providers.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ProviderError {
    /// Raised when credentials or backend configuration are invalid.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised for failures worth retrying (timeouts, 5xx, rate limits).
    #[error("transient {operation} failure: {message}")]
    Transient {
        /// Operation that failed.
        operation: String,
        /// Message returned by the backend.
        message: String,
    },
    /// Raised when a resource does not exist.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Kind of resource (server, image, floating IP).
        kind: String,
        /// Identifier that was looked up.
        id: String,
    },
    /// Raised when the backend does not offer an operation.
    #[error("{provider} does not support {operation}")]
    Unsupported {
        /// Provider name.
        provider: String,
        /// Operation that was requested.
        operation: String,
    },
    /// Raised when an asynchronous operation does not settle in time.
    #[error("timeout waiting for {action} on {id}")]
    Timeout {
        /// Action being waited on.
        action: String,
        /// Identifier of the resource.
        id: String,
    },
    /// Wrapper for any other backend failure.
    #[error("provider error: {message}")]
    Api {
        /// Message returned by the backend.
        message: String,
    },
}

impl ProviderError {
    /// Returns `true` for errors an adapter would normally retry.
    ///
    /// This is a convenience predicate for [`crate::retry::retry_conditional`];
    /// the orchestration core never applies it on its own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Builds an [`ProviderError::Unsupported`] error.
    #[must_use]
    pub fn unsupported(provider: &str, operation: &str) -> Self {
        Self::Unsupported {
            provider: provider.to_owned(),
            operation: operation.to_owned(),
        }
    }
}

/// Capability set implemented by every cloud backend.
///
/// Implementations must be safe for concurrent use: many machines are
/// created and destroyed in parallel against the same provider.
pub trait Provider: Send + Sync {
    /// Short backend name used in logs and errors.
    fn name(&self) -> &str;

    /// Creates a server, associating `request.floating_ip` when supplied and
    /// allocating a fresh address otherwise.
    fn create_server<'a>(&'a self, request: &'a ServerRequest)
    -> ProviderFuture<'a, ServerHandle>;

    /// Deletes a server.
    ///
    /// A floating IP the adapter allocated for the server is released with
    /// it. A floating IP supplied by the caller is only disassociated.
    fn delete_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()>;

    /// Submits an image upload from `source_url`.
    fn create_image<'a>(
        &'a self,
        name: &'a str,
        source_url: &'a str,
    ) -> ProviderFuture<'a, ImageHandle>;

    /// Fetches the current state of one image.
    fn describe_image<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ImageSummary>;

    /// Deletes an image.
    fn delete_image<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()>;

    /// Lists every server visible to the credentials.
    fn list_servers(&self) -> ProviderFuture<'_, Vec<ServerSummary>>;

    /// Lists every image visible to the credentials.
    fn list_images(&self) -> ProviderFuture<'_, Vec<ImageSummary>>;

    /// Fetches the serial console text of a server.
    fn console_output<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, String>;

    /// Allocates a floating IP.
    fn create_floating_ip(&self) -> ProviderFuture<'_, FloatingIp> {
        Box::pin(async move { Err(ProviderError::unsupported(self.name(), "create_floating_ip")) })
    }

    /// Releases a floating IP back to the backend.
    fn delete_floating_ip<'a>(&'a self, _id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { Err(ProviderError::unsupported(self.name(), "delete_floating_ip")) })
    }

    /// Lists floating IPs owned by the account.
    fn list_floating_ips(&self) -> ProviderFuture<'_, Vec<FloatingIp>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    /// Metadata expressions substituted for user-data placeholders such as
    /// [`PUBLIC_IPV4_PLACEHOLDER`].
    fn placeholders(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    /// Cheap connectivity check run once when a flight is built.
    fn preflight(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move { self.list_servers().await.map(|_| ()) })
    }
}

/// Uploads an image and waits until the backend reports it available.
///
/// On timeout or a failed status check the partially created image is
/// deleted before the error is returned, so no image is left in a
/// transitional state.
///
/// # Errors
///
/// Returns the upload error, [`ProviderError::Timeout`] naming the image when
/// it never becomes available, or the status check error.
pub async fn create_image_and_wait(
    provider: &dyn Provider,
    name: &str,
    source_url: &str,
    timeout: Duration,
    interval: Duration,
) -> Result<ImageHandle, ProviderError> {
    let image = provider.create_image(name, source_url).await?;
    info!(image_id = %image.id, provider = provider.name(), "image upload accepted");

    let poll = wait_until_ready(timeout, interval, || async {
        let summary = provider.describe_image(&image.id).await?;
        match summary.status {
            ResourceStatus::Available => Ok(true),
            ResourceStatus::Error => Err(ProviderError::Api {
                message: format!("image {} entered error state", image.id),
            }),
            _ => Ok(false),
        }
    })
    .await;

    let Err(poll_err) = poll else {
        info!(image_id = %image.id, "image available");
        return Ok(image);
    };

    if let Err(err) = provider.delete_image(&image.id).await {
        warn!(image_id = %image.id, error = %err, "failed to delete partial image");
    }
    Err(match poll_err {
        PollError::TimeLimitExceeded { .. } => ProviderError::Timeout {
            action: String::from("image upload"),
            id: image.id,
        },
        PollError::Check(err) => err,
    })
}

#[cfg(test)]
mod tests;
