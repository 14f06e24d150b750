//! Handle to one provisioned machine.
//!
//! A [`Machine`] only exists once it has been fully provisioned and answered
//! over SSH. Teardown is best effort: every step is attempted even when an
//! earlier one fails, and failures are logged rather than returned.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs_utf8::Dir;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::flight::FlightShared;
use crate::journal::{Journal, JournalError};
use crate::provider::{ProviderError, ServerHandle};
use crate::retry::{PollError, wait_until_ready};
use crate::ssh::{RemoteOutput, SshError};

/// File name of the console capture inside a machine directory.
pub const CONSOLE_FILE_NAME: &str = "console.txt";

/// File name of the rendered user-data inside a machine directory.
pub const USER_DATA_FILE_NAME: &str = "user-data";

const BOOT_ID_COMMAND: &str = "cat /proc/sys/kernel/random/boot_id";
const REBOOT_COMMAND: &str = "sudo systemctl reboot";
const JOURNAL_COMMAND: &str = "journalctl --no-pager --boot";

/// Errors raised by machine operations.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum MachineError {
    /// Raised when the SSH client cannot be run.
    #[error("ssh to {id} failed: {source}")]
    Ssh {
        /// Server id.
        id: String,
        /// Underlying SSH error.
        source: SshError,
    },
    /// Raised when the blocking SSH task cannot be joined.
    #[error("ssh task for {id} failed: {message}")]
    Task {
        /// Server id.
        id: String,
        /// Join error message.
        message: String,
    },
    /// Raised when the machine does not answer over SSH in time.
    #[error("machine {id} not reachable over ssh within {seconds}s")]
    NotReady {
        /// Server id.
        id: String,
        /// Timeout that elapsed.
        seconds: u64,
    },
    /// Raised when a remote command needed by the operation exits non-zero.
    #[error("command `{command}` on {id} exited with {exit_code:?}: {stderr}")]
    Command {
        /// Server id.
        id: String,
        /// Command that failed.
        command: String,
        /// Exit code reported by ssh.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },
    /// Raised when the provider cannot return console output.
    #[error("console output for {id} unavailable: {source}")]
    Console {
        /// Server id.
        id: String,
        /// Provider failure.
        source: ProviderError,
    },
    /// Raised when the journal sink fails.
    #[error(transparent)]
    Journal(#[from] JournalError),
}

/// Registration slot shared between a cluster and its machines.
pub(crate) type MachineSet = Mutex<BTreeMap<String, Arc<Machine>>>;

/// One provisioned instance.
pub struct Machine {
    id: String,
    public_ip: IpAddr,
    private_ip: Option<IpAddr>,
    floating_ip: Option<String>,
    pooled_ip: Option<String>,
    dir: Utf8PathBuf,
    journal: Box<dyn Journal>,
    flight: Arc<FlightShared>,
    registry: Weak<MachineSet>,
    destroyed: AtomicBool,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.id)
            .field("public_ip", &self.public_ip)
            .field("private_ip", &self.private_ip)
            .field("floating_ip", &self.floating_ip)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Machine {
    pub(crate) fn new(
        server: ServerHandle,
        pooled_ip: Option<String>,
        dir: Utf8PathBuf,
        journal: Box<dyn Journal>,
        flight: Arc<FlightShared>,
        registry: Weak<MachineSet>,
    ) -> Self {
        Self {
            id: server.id,
            public_ip: server.public_ip,
            private_ip: server.private_ip,
            floating_ip: server.floating_ip,
            pooled_ip,
            dir,
            journal,
            flight,
            registry,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Backend-assigned server id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Address the machine is reachable on.
    #[must_use]
    pub const fn public_ip(&self) -> IpAddr {
        self.public_ip
    }

    /// Private network address, if the backend has one.
    #[must_use]
    pub const fn private_ip(&self) -> Option<IpAddr> {
        self.private_ip
    }

    /// Floating IP associated with the server.
    #[must_use]
    pub fn floating_ip(&self) -> Option<&str> {
        self.floating_ip.as_deref()
    }

    /// Working directory holding user-data, console, and journal captures.
    #[must_use]
    pub fn dir(&self) -> &Utf8Path {
        &self.dir
    }

    /// Returns `true` once [`Machine::destroy`] has run.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Runs `command` over SSH. A non-zero exit is returned, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Ssh`] when the client cannot be spawned and
    /// [`MachineError::Task`] when the blocking task panics.
    pub async fn ssh(&self, command: &str) -> Result<RemoteOutput, MachineError> {
        let client = self.flight.ssh.clone();
        let host = self.public_ip;
        let owned = command.to_owned();
        tokio::task::spawn_blocking(move || client.run(host, &owned))
            .await
            .map_err(|err| MachineError::Task {
                id: self.id.clone(),
                message: err.to_string(),
            })?
            .map_err(|source| MachineError::Ssh {
                id: self.id.clone(),
                source,
            })
    }

    /// Waits until the machine answers `true` over SSH.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::NotReady`] when the configured timeout elapses
    /// and any error from [`Machine::ssh`].
    pub async fn check_ready(&self) -> Result<(), MachineError> {
        self.wait_for(|output| output.is_success(), "true").await
    }

    /// Reboots the machine and waits until it is back with a new boot id.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Command`] when the boot id cannot be read and
    /// [`MachineError::NotReady`] when the machine does not come back.
    pub async fn reboot(&self) -> Result<(), MachineError> {
        let before = self.ssh(BOOT_ID_COMMAND).await?;
        if !before.is_success() {
            return Err(self.command_error(BOOT_ID_COMMAND, &before));
        }
        let previous = before.stdout.trim().to_owned();

        // The connection drops as the machine goes down.
        let reboot = self.ssh(REBOOT_COMMAND).await?;
        debug!(server_id = %self.id, exit_code = ?reboot.exit_code, "reboot issued");

        self.wait_for(
            |output| {
                output.is_success()
                    && !output.stdout.trim().is_empty()
                    && output.stdout.trim() != previous
            },
            BOOT_ID_COMMAND,
        )
        .await?;
        info!(server_id = %self.id, "machine rebooted");
        Ok(())
    }

    /// Fetches the serial console text from the provider.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Console`] when the provider call fails.
    pub async fn console_output(&self) -> Result<String, MachineError> {
        self.flight
            .provider
            .console_output(&self.id)
            .await
            .map_err(|source| MachineError::Console {
                id: self.id.clone(),
                source,
            })
    }

    /// Everything captured by the journal sink so far.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Journal`] when the capture cannot be read.
    pub fn journal_output(&self) -> Result<Vec<u8>, MachineError> {
        Ok(self.journal.read()?)
    }

    /// Snapshots the remote journal into the journal sink.
    ///
    /// # Errors
    ///
    /// Returns [`MachineError::Command`] when `journalctl` fails and
    /// [`MachineError::Journal`] when the capture cannot be written.
    pub async fn capture_journal(&self) -> Result<(), MachineError> {
        let output = self.ssh(JOURNAL_COMMAND).await?;
        if !output.is_success() {
            return Err(self.command_error(JOURNAL_COMMAND, &output));
        }
        self.journal.record(&output.stdout)?;
        Ok(())
    }

    /// Tears the machine down. Idempotent; never fails.
    ///
    /// Console output and the remote journal are saved first, then the
    /// server is deleted, the journal stopped, and the machine deregistered
    /// from its cluster. A server the backend no longer knows counts as
    /// deleted. A floating IP taken from the flight's pool goes back to the
    /// pool; when the pool refuses it the IP is deleted instead. An IP still
    /// held by a server that could not be deleted is recorded on the flight
    /// and deleted when the flight is destroyed.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }

        match self.console_output().await {
            Ok(text) => {
                if let Err(err) = self.write_file(CONSOLE_FILE_NAME, &text) {
                    warn!(server_id = %self.id, error = %err, "failed to save console output");
                }
            }
            Err(err) => warn!(server_id = %self.id, error = %err, "failed to fetch console output"),
        }
        if let Err(err) = self.capture_journal().await {
            warn!(server_id = %self.id, error = %err, "failed to capture journal");
        }

        let pooled = self.pooled_ip.clone();
        let server_deleted = match self.flight.provider.delete_server(&self.id).await {
            Ok(()) => {
                info!(server_id = %self.id, "deleted server");
                true
            }
            Err(ProviderError::NotFound { .. }) => {
                info!(server_id = %self.id, "server already gone");
                true
            }
            Err(err) => {
                warn!(server_id = %self.id, error = %err, "failed to delete server");
                false
            }
        };

        self.journal.destroy();

        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }

        match pooled {
            Some(ip) if server_deleted => self.flight.return_floating_ip(ip).await,
            Some(ip) => self.flight.strand_floating_ip(ip),
            None => {}
        }
    }

    async fn wait_for<F>(&self, done: F, command: &str) -> Result<(), MachineError>
    where
        F: Fn(&RemoteOutput) -> bool,
    {
        let timeout = self.flight.config.ssh_ready_timeout();
        let interval = self.flight.config.ssh_poll_interval();
        let done = &done;
        wait_until_ready(timeout, interval, || async move {
            let output = self.ssh(command).await?;
            debug!(server_id = %self.id, exit_code = ?output.exit_code, "ssh poll");
            Ok(done(&output))
        })
        .await
        .map_err(|err| match err {
            PollError::TimeLimitExceeded { .. } => MachineError::NotReady {
                id: self.id.clone(),
                seconds: timeout.as_secs(),
            },
            PollError::Check(inner) => inner,
        })
    }

    fn command_error(&self, command: &str, output: &RemoteOutput) -> MachineError {
        MachineError::Command {
            id: self.id.clone(),
            command: command.to_owned(),
            exit_code: output.exit_code,
            stderr: output.stderr.clone(),
        }
    }

    fn write_file(&self, name: &str, contents: &str) -> std::io::Result<()> {
        let dir = Dir::open_ambient_dir(&self.dir, ambient_authority())?;
        dir.write(name, contents)
    }
}
