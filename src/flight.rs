//! Top-level provisioning session.
//!
//! A [`Flight`] binds one provider to its collaborators (SSH client, journal
//! factory, user-data renderer) and owns the floating IP pool shared by every
//! cluster it creates.
//!
//! # Destruction order
//!
//! Callers must destroy every [`Cluster`] before calling
//! [`Flight::destroy`]. The flight does not wait for clusters; it only warns
//! about the ones still registered and then drains the pool.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::Utf8PathBuf;
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cluster::Cluster;
use crate::config::{ConfigError, FlightConfig};
use crate::journal::{FileJournalFactory, JournalFactory};
use crate::pool::{DrainReport, ResourcePool};
use crate::provider::{Provider, ProviderError};
use crate::render::{PlaceholderRenderer, UserDataRenderer};
use crate::ssh::{CommandRunner, ProcessCommandRunner, SshClient, SshConfig, SshError};

/// Errors raised while building or using a flight.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum FlightError {
    /// Raised when the flight configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Raised when the SSH configuration is invalid.
    #[error(transparent)]
    Ssh(#[from] SshError),
    /// Raised when the provider preflight check fails.
    #[error("{provider} preflight failed: {source}")]
    Preflight {
        /// Provider name.
        provider: String,
        /// Provider failure.
        source: ProviderError,
    },
    /// Raised when existing floating IPs cannot be listed.
    #[error("failed to list floating IPs: {0}")]
    FloatingIps(#[source] ProviderError),
    /// Raised when an output directory cannot be created.
    #[error("failed to create {path}: {message}")]
    Filesystem {
        /// Directory that could not be created.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
}

/// State shared by a flight, its clusters, and their machines.
pub(crate) struct FlightShared {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) pool: ResourcePool,
    pub(crate) config: FlightConfig,
    pub(crate) ssh: SshClient,
    pub(crate) journals: Arc<dyn JournalFactory>,
    pub(crate) renderer: Arc<dyn UserDataRenderer>,
    clusters: Mutex<BTreeSet<String>>,
    stranded: Mutex<Vec<String>>,
}

impl FlightShared {
    fn clusters(&self) -> MutexGuard<'_, BTreeSet<String>> {
        self.clusters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn deregister_cluster(&self, name: &str) {
        self.clusters().remove(name);
    }

    /// Hands a pooled floating IP back. When the pool refuses it the IP is
    /// deleted through the provider so it is never leaked.
    pub(crate) async fn return_floating_ip(&self, id: String) {
        let Err(err) = self.pool.release(id) else {
            return;
        };
        warn!(floating_ip = %err.id(), error = %err, "pool refused floating IP; deleting it");
        if let Err(delete_err) = self.provider.delete_floating_ip(err.id()).await {
            warn!(floating_ip = %err.id(), error = %delete_err, "failed to delete floating IP");
        }
    }

    /// Records a pooled floating IP still attached to a server that could
    /// not be deleted. [`Flight::destroy`] deletes it with the pool.
    pub(crate) fn strand_floating_ip(&self, id: String) {
        warn!(floating_ip = %id, "floating IP stranded on undeleted server");
        self.stranded().push(id);
    }

    fn stranded(&self) -> MutexGuard<'_, Vec<String>> {
        self.stranded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder for [`Flight`].
pub struct FlightBuilder {
    provider: Arc<dyn Provider>,
    config: FlightConfig,
    ssh_config: SshConfig,
    runner: Arc<dyn CommandRunner>,
    journals: Arc<dyn JournalFactory>,
    renderer: Arc<dyn UserDataRenderer>,
}

impl FlightBuilder {
    /// Overrides the flight configuration.
    #[must_use]
    pub fn config(mut self, config: FlightConfig) -> Self {
        self.config = config;
        self
    }

    /// Overrides the SSH configuration.
    #[must_use]
    pub fn ssh_config(mut self, config: SshConfig) -> Self {
        self.ssh_config = config;
        self
    }

    /// Replaces the command runner behind the SSH client.
    #[must_use]
    pub fn command_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Replaces the journal factory.
    #[must_use]
    pub fn journal_factory(mut self, journals: Arc<dyn JournalFactory>) -> Self {
        self.journals = journals;
        self
    }

    /// Replaces the user-data renderer.
    #[must_use]
    pub fn renderer(mut self, renderer: Arc<dyn UserDataRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Validates configuration, runs the provider preflight, and seeds the
    /// pool with unattached floating IPs owned by the account.
    ///
    /// # Errors
    ///
    /// Returns [`FlightError`] when configuration is invalid or the provider
    /// cannot be reached.
    pub async fn build(self) -> Result<Flight, FlightError> {
        self.config.validate()?;
        let ssh = SshClient::new(self.ssh_config, self.runner)?;

        self.provider
            .preflight()
            .await
            .map_err(|source| FlightError::Preflight {
                provider: self.provider.name().to_owned(),
                source,
            })?;

        let pool = ResourcePool::new(self.config.pool_capacity);
        let free = self
            .provider
            .list_floating_ips()
            .await
            .map_err(FlightError::FloatingIps)?
            .into_iter()
            .filter(|ip| ip.server_id.is_none());
        for ip in free {
            if let Err(err) = pool.release(ip.id) {
                warn!(floating_ip = %err.id(), "pool full; leaving floating IP unpooled");
            }
        }
        info!(
            provider = self.provider.name(),
            pooled = pool.available(),
            capacity = pool.capacity(),
            "flight ready"
        );

        Ok(Flight {
            shared: Arc::new(FlightShared {
                provider: self.provider,
                pool,
                config: self.config,
                ssh,
                journals: self.journals,
                renderer: self.renderer,
                clusters: Mutex::new(BTreeSet::new()),
                stranded: Mutex::new(Vec::new()),
            }),
        })
    }
}

/// Provisioning session bound to one provider.
pub struct Flight {
    shared: Arc<FlightShared>,
}

impl std::fmt::Debug for Flight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flight")
            .field("provider", &self.shared.provider.name())
            .field("pool", &self.shared.pool)
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl Flight {
    /// Starts building a flight for `provider` with default collaborators.
    #[must_use]
    pub fn builder(provider: Arc<dyn Provider>) -> FlightBuilder {
        FlightBuilder {
            provider,
            config: FlightConfig::default(),
            ssh_config: SshConfig::default(),
            runner: Arc::new(ProcessCommandRunner),
            journals: Arc::new(FileJournalFactory),
            renderer: Arc::new(PlaceholderRenderer),
        }
    }

    /// Provider the flight is bound to.
    #[must_use]
    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.shared.provider
    }

    /// Floating IP pool owned by the flight.
    #[must_use]
    pub fn pool(&self) -> &ResourcePool {
        &self.shared.pool
    }

    /// Configuration the flight was built with.
    #[must_use]
    pub fn config(&self) -> &FlightConfig {
        &self.shared.config
    }

    /// Names of clusters that have not been destroyed yet.
    #[must_use]
    pub fn clusters(&self) -> Vec<String> {
        self.shared.clusters().iter().cloned().collect()
    }

    /// Creates and registers a cluster with a generated name.
    ///
    /// # Errors
    ///
    /// Returns [`FlightError::Filesystem`] when the cluster directory cannot
    /// be created.
    pub fn new_cluster(&self) -> Result<Cluster, FlightError> {
        let name = format!("cluster-{}", Uuid::new_v4().simple());
        let dir = self.shared.config.output_path().join(&name);
        Dir::create_ambient_dir_all(&dir, ambient_authority()).map_err(|err| {
            FlightError::Filesystem {
                path: dir.clone(),
                message: err.to_string(),
            }
        })?;
        self.shared.clusters().insert(name.clone());
        info!(cluster = %name, "created cluster");
        Ok(Cluster::new(name, dir, Arc::clone(&self.shared)))
    }

    /// Floating IPs taken from the pool that could not be handed back
    /// because the server holding them survived teardown.
    #[must_use]
    pub fn stranded_floating_ips(&self) -> Vec<String> {
        self.shared.stranded().clone()
    }

    /// Drains the pool, deleting every floating IP it still holds, then
    /// deletes the stranded ones.
    ///
    /// Every cluster must have been destroyed first; survivors are logged
    /// and left alone. Per-IP failures are reported, not raised.
    pub async fn destroy(self) -> DrainReport {
        let survivors = self.clusters();
        if !survivors.is_empty() {
            warn!(clusters = ?survivors, "destroying flight with live clusters");
        }
        let provider = self.shared.provider.as_ref();
        let mut report = self.shared.pool.drain_and_destroy(provider).await;
        let stranded = std::mem::take(&mut *self.shared.stranded());
        report.delete_each(provider, stranded).await;
        info!(
            deleted = report.deleted.len(),
            failed = report.failed.len(),
            "flight destroyed"
        );
        report
    }
}
