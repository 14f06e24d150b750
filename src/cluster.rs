//! Named groups of machines.
//!
//! [`Cluster::new_machine`] either returns a machine that is provisioned and
//! reachable, or unwinds everything it acquired on the way. Acquisitions are
//! pushed onto a [`Rollback`] stack as they happen and undone in reverse
//! order on any failure, including the provisioning timeout.
//!
//! Provisioning runs on its own task, which owns the rollback stack. A
//! caller that drops the [`Cluster::new_machine`] future only abandons the
//! result; the task notices and unwinds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use crate::flight::FlightShared;
use crate::journal::JournalError;
use crate::machine::{Machine, MachineError, MachineSet, USER_DATA_FILE_NAME};
use crate::provider::{ProviderError, ServerHandle, ServerRequest};
use crate::render::RenderError;
use crate::ssh::RemoteOutput;

/// Errors raised while provisioning a machine.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ClusterError {
    /// Raised when user-data cannot be rendered. Nothing was created.
    #[error(transparent)]
    Render(#[from] RenderError),
    /// Raised when the provider refuses to create the server.
    #[error("failed to create server {name}: {source}")]
    CreateServer {
        /// Name requested for the server.
        name: String,
        /// Provider failure.
        source: ProviderError,
    },
    /// Raised when the machine directory cannot be prepared.
    #[error("failed to prepare {path} for server {server_id}: {message}")]
    Filesystem {
        /// Server that was rolled back.
        server_id: String,
        /// Path involved.
        path: Utf8PathBuf,
        /// Underlying error message.
        message: String,
    },
    /// Raised when the journal sink cannot be started.
    #[error("failed to start journal for server {server_id}: {source}")]
    Journal {
        /// Server that was rolled back.
        server_id: String,
        /// Journal failure.
        source: JournalError,
    },
    /// Raised when the machine never became usable.
    #[error("server {server_id} failed startup checks: {source}")]
    Startup {
        /// Server that was rolled back.
        server_id: String,
        /// Machine failure.
        source: MachineError,
    },
    /// Raised when provisioning exceeds the configured bound.
    #[error("provisioning server {server_id} exceeded {seconds}s")]
    Timeout {
        /// Server that was rolled back.
        server_id: String,
        /// Bound that elapsed.
        seconds: u64,
    },
    /// Raised when the caller stopped waiting for the machine.
    #[error("provisioning server {server_id} abandoned by caller")]
    Cancelled {
        /// Server that was rolled back.
        server_id: String,
    },
    /// Raised when the cluster has already been destroyed.
    #[error("cluster {cluster} is destroyed")]
    Closed {
        /// Cluster name.
        cluster: String,
    },
    /// Raised when the provisioning task cannot be joined.
    #[error("provisioning task failed: {message}")]
    Task {
        /// Join error message.
        message: String,
    },
}

#[derive(Debug)]
enum Undo {
    ReleaseIp(String),
    DeleteServer(String),
    RemoveDir { parent: Utf8PathBuf, name: String },
}

/// Stack of acquisitions made while provisioning one machine.
#[derive(Debug, Default)]
struct Rollback {
    steps: Vec<Undo>,
}

impl Rollback {
    fn push(&mut self, step: Undo) {
        self.steps.push(step);
    }

    /// Undoes every recorded step, newest first. Failures are logged and do
    /// not stop earlier steps from being undone. A floating IP is not handed
    /// back while the server holding it could not be deleted; the flight
    /// records it instead.
    async fn unwind(self, flight: &FlightShared) {
        let mut stranded = false;
        for step in self.steps.into_iter().rev() {
            match step {
                Undo::RemoveDir { parent, name } => {
                    let removed = Dir::open_ambient_dir(&parent, ambient_authority())
                        .and_then(|dir| dir.remove_dir_all(&name));
                    if let Err(err) = removed {
                        warn!(path = %parent.join(&name), error = %err, "rollback: failed to remove machine directory");
                    }
                }
                Undo::DeleteServer(id) => match flight.provider.delete_server(&id).await {
                    Ok(()) => info!(server_id = %id, "rollback: deleted server"),
                    Err(ProviderError::NotFound { .. }) => {
                        info!(server_id = %id, "rollback: server already gone");
                    }
                    Err(err) => {
                        stranded = true;
                        warn!(server_id = %id, error = %err, "rollback: failed to delete server");
                    }
                },
                Undo::ReleaseIp(ip) if stranded => flight.strand_floating_ip(ip),
                Undo::ReleaseIp(ip) => flight.return_floating_ip(ip).await,
            }
        }
    }
}

#[derive(Debug)]
struct ClusterShared {
    name: String,
    dir: Utf8PathBuf,
    machines: Arc<MachineSet>,
    closed: AtomicBool,
}

/// Group of machines created for one test run.
///
/// Cloning is cheap and shares the live machine set, so concurrent tasks
/// can provision into the same cluster. Destroying any clone closes them all.
#[derive(Clone)]
pub struct Cluster {
    shared: Arc<ClusterShared>,
    flight: Arc<FlightShared>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.shared.name)
            .field("dir", &self.shared.dir)
            .finish_non_exhaustive()
    }
}

impl Cluster {
    pub(crate) fn new(name: String, dir: Utf8PathBuf, flight: Arc<FlightShared>) -> Self {
        Self {
            shared: Arc::new(ClusterShared {
                name,
                dir,
                machines: Arc::new(Mutex::new(BTreeMap::new())),
                closed: AtomicBool::new(false),
            }),
            flight,
        }
    }

    /// Generated cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Directory holding one sub-directory per machine.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.shared.dir
    }

    /// Snapshot of the fully provisioned machines, ordered by server id.
    #[must_use]
    pub fn machines(&self) -> Vec<Arc<Machine>> {
        self.live().values().cloned().collect()
    }

    /// Returns `true` once [`Cluster::destroy`] has run on any clone.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Provisions a machine from a user-data template.
    ///
    /// The template is rendered, a pooled floating IP is taken if one is
    /// free, and the server is created. The machine directory, user-data
    /// file, and journal are then set up and the machine must answer over
    /// SSH, all within the flight's provisioning timeout. Only then is the
    /// machine registered and returned.
    ///
    /// Dropping the returned future before it completes does not leak: the
    /// provisioning task rolls back whatever it acquired.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] naming the first failure. Everything
    /// acquired before it has been released by then.
    pub async fn new_machine(&self, user_data: &str) -> Result<Arc<Machine>, ClusterError> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let rendered = self
            .flight
            .renderer
            .render(user_data, &self.flight.provider.placeholders())?;

        // The sender lives as long as this future; the task sees it dropped.
        let (waiting, abandoned) = oneshot::channel::<()>();
        let joined = tokio::spawn(self.clone().launch(rendered, abandoned)).await;
        drop(waiting);
        joined.map_err(|err| ClusterError::Task {
            message: err.to_string(),
        })?
    }

    async fn launch(
        self,
        rendered: String,
        mut abandoned: oneshot::Receiver<()>,
    ) -> Result<Arc<Machine>, ClusterError> {
        let reserved = self.flight.pool.try_acquire();
        let name = format!("flotilla-{}", Uuid::new_v4().simple());
        let request = ServerRequest::new(name.clone(), rendered).floating_ip(reserved.clone());

        let server = match self.flight.provider.create_server(&request).await {
            Ok(server) => server,
            Err(source) => {
                if let Some(ip) = reserved {
                    self.flight.return_floating_ip(ip).await;
                }
                return Err(ClusterError::CreateServer { name, source });
            }
        };
        info!(
            cluster = %self.shared.name,
            server_id = %server.id,
            floating_ip = ?server.floating_ip,
            pooled = reserved.is_some(),
            "created server"
        );

        let mut rollback = Rollback::default();
        if let Some(ip) = reserved.clone() {
            rollback.push(Undo::ReleaseIp(ip));
        }
        rollback.push(Undo::DeleteServer(server.id.clone()));

        let server_id = server.id.clone();
        let limit = self.flight.config.provision_timeout();
        let result = tokio::select! {
            outcome = tokio::time::timeout(
                limit,
                self.provision(server, reserved, &request.user_data, &mut rollback),
            ) => outcome.unwrap_or_else(|_| Err(ClusterError::Timeout {
                server_id: server_id.clone(),
                seconds: limit.as_secs(),
            })),
            _ = &mut abandoned => Err(ClusterError::Cancelled {
                server_id: server_id.clone(),
            }),
        };
        let registered = result.and_then(|machine| {
            if self.register(&machine) {
                Ok(machine)
            } else {
                Err(self.closed_error())
            }
        });

        match registered {
            Ok(machine) => {
                info!(cluster = %self.shared.name, server_id = %machine.id(), "machine ready");
                Ok(machine)
            }
            Err(err) => {
                warn!(cluster = %self.shared.name, server_id = %server_id, error = %err, "provisioning failed; rolling back");
                rollback.unwind(&self.flight).await;
                Err(err)
            }
        }
    }

    /// Adds `machine` to the live set unless the cluster has been closed.
    /// Checked under the set's lock so a concurrent destroy sees it.
    fn register(&self, machine: &Arc<Machine>) -> bool {
        let mut live = self.live();
        if self.is_closed() {
            return false;
        }
        live.insert(machine.id().to_owned(), Arc::clone(machine));
        true
    }

    fn closed_error(&self) -> ClusterError {
        ClusterError::Closed {
            cluster: self.shared.name.clone(),
        }
    }

    async fn provision(
        &self,
        server: ServerHandle,
        pooled_ip: Option<String>,
        rendered: &str,
        rollback: &mut Rollback,
    ) -> Result<Arc<Machine>, ClusterError> {
        let server_id = server.id.clone();
        let dir = self.shared.dir.join(&server_id);
        let fs_err = |path: &Utf8Path, err: &std::io::Error| ClusterError::Filesystem {
            server_id: server_id.clone(),
            path: path.to_owned(),
            message: err.to_string(),
        };

        let parent = Dir::open_ambient_dir(&self.shared.dir, ambient_authority())
            .map_err(|err| fs_err(&self.shared.dir, &err))?;
        parent
            .create_dir(&server_id)
            .map_err(|err| fs_err(&dir, &err))?;
        rollback.push(Undo::RemoveDir {
            parent: self.shared.dir.clone(),
            name: server_id.clone(),
        });
        parent
            .open_dir(&server_id)
            .and_then(|machine_dir| machine_dir.write(USER_DATA_FILE_NAME, rendered))
            .map_err(|err| fs_err(&dir.join(USER_DATA_FILE_NAME), &err))?;

        let journal = self
            .flight
            .journals
            .new_journal(&dir)
            .map_err(|source| ClusterError::Journal {
                server_id: server_id.clone(),
                source,
            })?;

        let machine = Arc::new(Machine::new(
            server,
            pooled_ip,
            dir,
            journal,
            Arc::clone(&self.flight),
            Arc::downgrade(&self.shared.machines),
        ));
        machine
            .check_ready()
            .await
            .map_err(|source| ClusterError::Startup {
                server_id: server_id.clone(),
                source,
            })?;
        Ok(machine)
    }

    /// Runs `command` on every live machine concurrently.
    ///
    /// Returns each machine's outcome keyed by server id.
    pub async fn run_on_all(
        &self,
        command: &str,
    ) -> BTreeMap<String, Result<RemoteOutput, MachineError>> {
        let mut tasks = JoinSet::new();
        for machine in self.machines() {
            let owned = command.to_owned();
            tasks.spawn(async move {
                let output = machine.ssh(&owned).await;
                (machine.id().to_owned(), output)
            });
        }

        let mut outputs = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, output)) => {
                    outputs.insert(id, output);
                }
                Err(err) => warn!(cluster = %self.shared.name, error = %err, "ssh fan-out task failed"),
            }
        }
        outputs
    }

    /// Destroys every machine concurrently and deregisters the cluster from
    /// its flight. Never fails; teardown problems are logged.
    ///
    /// The cluster is closed first, so no clone can register a machine
    /// afterwards.
    pub async fn destroy(self) {
        let machines: Vec<Arc<Machine>> = {
            let live = self.live();
            self.shared.closed.store(true, Ordering::SeqCst);
            live.values().cloned().collect()
        };
        let count = machines.len();
        let mut tasks = JoinSet::new();
        for machine in machines {
            tasks.spawn(async move { machine.destroy().await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(cluster = %self.shared.name, error = %err, "machine teardown task failed");
            }
        }
        self.flight.deregister_cluster(&self.shared.name);
        info!(cluster = %self.shared.name, machines = count, "destroyed cluster");
    }

    fn live(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Machine>>> {
        self.shared
            .machines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
