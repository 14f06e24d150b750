//! Test support utilities shared across unit and integration tests.
//!
//! [`MemoryProvider`] is an in-memory backend that records every call and
//! enforces floating IP exclusivity, so double allocation shows up as an
//! error. [`RecordingRunner`] stands in for the system `ssh` client.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use crate::provider::{
    FloatingIp, ImageHandle, ImageSummary, PUBLIC_IPV4_PLACEHOLDER, Provider, ProviderError,
    ProviderFuture, ResourceStatus, ServerHandle, ServerRequest, ServerSummary,
};
use crate::ssh::{CommandOutput, CommandRunner, SshError};

/// Call recorded by [`MemoryProvider`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ProviderCall {
    /// `create_server` with the name and the reused floating IP, if any.
    CreateServer {
        /// Server name from the request.
        name: String,
        /// Floating IP supplied by the caller.
        floating_ip: Option<String>,
    },
    /// `delete_server` with the server id.
    DeleteServer(String),
    /// `create_image` with the image name.
    CreateImage(String),
    /// `delete_image` with the image id.
    DeleteImage(String),
    /// `create_floating_ip`, recorded with the allocated id.
    CreateFloatingIp(String),
    /// `delete_floating_ip` with the floating IP id.
    DeleteFloatingIp(String),
}

#[derive(Clone, Debug)]
struct StoredServer {
    created_at: DateTime<Utc>,
    status: ResourceStatus,
    floating_ip: Option<String>,
    owns_floating_ip: bool,
    user_data: String,
}

#[derive(Clone, Debug)]
struct StoredImage {
    summary: ImageSummary,
    polls_until_ready: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    servers: BTreeMap<String, StoredServer>,
    images: BTreeMap<String, StoredImage>,
    floating_ips: BTreeMap<String, FloatingIp>,
    calls: Vec<ProviderCall>,
    fail_create_server: Option<ProviderError>,
    fail_delete_server: BTreeSet<String>,
    fail_delete_floating_ip: BTreeSet<String>,
    fail_list: Option<ProviderError>,
    fail_console: bool,
    image_polls_until_ready: Option<u32>,
    image_uploads_fail: bool,
}

impl State {
    fn next(&mut self, prefix: &str) -> (String, u32) {
        self.next_id += 1;
        (format!("{prefix}-{}", self.next_id), self.next_id)
    }

    fn allocate_floating_ip(&mut self) -> FloatingIp {
        let (id, n) = self.next("fip");
        let ip = FloatingIp {
            id: id.clone(),
            address: address_for(n),
            server_id: None,
        };
        self.floating_ips.insert(id, ip.clone());
        ip
    }

    /// Drops a server the way the backend does: a fresh IP goes with it and
    /// a reused one is detached.
    fn remove_server(&mut self, id: &str) -> bool {
        let Some(server) = self.servers.remove(id) else {
            return false;
        };
        if let Some(fip) = server.floating_ip {
            if server.owns_floating_ip {
                self.floating_ips.remove(&fip);
            } else if let Some(entry) = self.floating_ips.get_mut(&fip) {
                entry.server_id = None;
            }
        }
        true
    }
}

fn octets(n: u32) -> (u8, u8) {
    let hi = u8::try_from((n >> 8) & 0xff).unwrap_or_default();
    let lo = u8::try_from(n & 0xff).unwrap_or_default();
    (hi, lo)
}

fn address_for(n: u32) -> IpAddr {
    let (hi, lo) = octets(n);
    IpAddr::V4(Ipv4Addr::new(203, 0, hi, lo))
}

/// In-memory [`Provider`] used by tests.
///
/// Cloning shares state, so a test can keep a handle for assertions while
/// the flight owns another.
#[derive(Clone, Debug, Default)]
pub struct MemoryProvider {
    state: Arc<Mutex<State>>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds an unattached floating IP, as if left over from earlier work.
    pub fn seed_floating_ip(&self) -> String {
        self.lock().allocate_floating_ip().id
    }

    /// Adds a server with an explicit creation time and status.
    pub fn seed_server(&self, id: &str, created_at: DateTime<Utc>, status: ResourceStatus) {
        self.lock().servers.insert(
            id.to_owned(),
            StoredServer {
                created_at,
                status,
                floating_ip: None,
                owns_floating_ip: false,
                user_data: String::new(),
            },
        );
    }

    /// Adds an image with an explicit creation time, status, and visibility.
    pub fn seed_image(
        &self,
        id: &str,
        created_at: DateTime<Utc>,
        status: ResourceStatus,
        public: bool,
    ) {
        self.lock().images.insert(
            id.to_owned(),
            StoredImage {
                summary: ImageSummary {
                    id: id.to_owned(),
                    created_at,
                    status,
                    public,
                },
                polls_until_ready: None,
            },
        );
    }

    /// Deletes a server behind the flight's back, without recording a call.
    pub fn remove_server_externally(&self, id: &str) {
        self.lock().remove_server(id);
    }

    /// Makes every subsequent `create_server` call fail with `error`.
    pub fn fail_create_server(&self, error: ProviderError) {
        self.lock().fail_create_server = Some(error);
    }

    /// Makes `delete_server` fail for `id`.
    pub fn fail_delete_server(&self, id: &str) {
        self.lock().fail_delete_server.insert(id.to_owned());
    }

    /// Makes `delete_floating_ip` fail for `id`.
    pub fn fail_delete_floating_ip(&self, id: &str) {
        self.lock().fail_delete_floating_ip.insert(id.to_owned());
    }

    /// Makes listing servers and images fail with `error`.
    pub fn fail_list(&self, error: ProviderError) {
        self.lock().fail_list = Some(error);
    }

    /// Makes `console_output` fail.
    pub fn fail_console(&self) {
        self.lock().fail_console = true;
    }

    /// Makes images uploaded afterwards report the error status.
    pub fn fail_image_uploads(&self) {
        self.lock().image_uploads_fail = true;
    }

    /// Makes images uploaded afterwards report available on the given
    /// `describe_image` call. `None` keeps them pending forever.
    pub fn image_ready_after(&self, polls: Option<u32>) {
        self.lock().image_polls_until_ready = polls;
    }

    /// Every call recorded so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Ids passed to `delete_server`, in order.
    #[must_use]
    pub fn deleted_servers(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::DeleteServer(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Ids passed to `delete_image`, in order.
    #[must_use]
    pub fn deleted_images(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::DeleteImage(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    /// Floating IPs requested for reuse by `create_server`, one entry per call.
    #[must_use]
    pub fn create_server_ips(&self) -> Vec<Option<String>> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ProviderCall::CreateServer { floating_ip, .. } => Some(floating_ip),
                _ => None,
            })
            .collect()
    }

    /// Ids of servers that still exist.
    #[must_use]
    pub fn server_ids(&self) -> Vec<String> {
        self.lock().servers.keys().cloned().collect()
    }

    /// Ids of images that still exist.
    #[must_use]
    pub fn image_ids(&self) -> Vec<String> {
        self.lock().images.keys().cloned().collect()
    }

    /// Ids of floating IPs that still exist.
    #[must_use]
    pub fn floating_ip_ids(&self) -> Vec<String> {
        self.lock().floating_ips.keys().cloned().collect()
    }

    /// User-data a server was created with.
    #[must_use]
    pub fn user_data(&self, id: &str) -> Option<String> {
        self.lock().servers.get(id).map(|srv| srv.user_data.clone())
    }

    fn create_server_sync(&self, request: &ServerRequest) -> Result<ServerHandle, ProviderError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::CreateServer {
            name: request.name.clone(),
            floating_ip: request.floating_ip.clone(),
        });
        if let Some(err) = state.fail_create_server.clone() {
            return Err(err);
        }

        let (id, n) = state.next("srv");
        let (ip, owns_floating_ip) = match request.floating_ip.as_deref() {
            Some(fip) => {
                let Some(existing) = state.floating_ips.get(fip).cloned() else {
                    return Err(ProviderError::NotFound {
                        kind: String::from("floating IP"),
                        id: fip.to_owned(),
                    });
                };
                if let Some(holder) = existing.server_id {
                    return Err(ProviderError::Api {
                        message: format!("floating IP {fip} already attached to {holder}"),
                    });
                }
                (existing, false)
            }
            None => (state.allocate_floating_ip(), true),
        };
        if let Some(entry) = state.floating_ips.get_mut(&ip.id) {
            entry.server_id = Some(id.clone());
        }
        state.servers.insert(
            id.clone(),
            StoredServer {
                created_at: Utc::now(),
                status: ResourceStatus::Running,
                floating_ip: Some(ip.id.clone()),
                owns_floating_ip,
                user_data: request.user_data.clone(),
            },
        );
        let (hi, lo) = octets(n);
        Ok(ServerHandle {
            id,
            public_ip: ip.address,
            private_ip: Some(IpAddr::V4(Ipv4Addr::new(10, 0, hi, lo))),
            floating_ip: Some(ip.id),
        })
    }

    fn delete_server_sync(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        state.calls.push(ProviderCall::DeleteServer(id.to_owned()));
        if state.fail_delete_server.contains(id) {
            return Err(ProviderError::Transient {
                operation: String::from("delete_server"),
                message: format!("simulated failure deleting {id}"),
            });
        }
        if state.remove_server(id) {
            Ok(())
        } else {
            Err(ProviderError::NotFound {
                kind: String::from("server"),
                id: id.to_owned(),
            })
        }
    }

    fn describe_image_sync(&self, id: &str) -> Result<ImageSummary, ProviderError> {
        let mut state = self.lock();
        let Some(image) = state.images.get_mut(id) else {
            return Err(ProviderError::NotFound {
                kind: String::from("image"),
                id: id.to_owned(),
            });
        };
        if let Some(remaining) = image.polls_until_ready.as_mut() {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                image.summary.status = ResourceStatus::Available;
            }
        }
        Ok(image.summary.clone())
    }
}

impl Provider for MemoryProvider {
    fn name(&self) -> &str {
        "memory"
    }

    fn create_server<'a>(
        &'a self,
        request: &'a ServerRequest,
    ) -> ProviderFuture<'a, ServerHandle> {
        Box::pin(async move { self.create_server_sync(request) })
    }

    fn delete_server<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move { self.delete_server_sync(id) })
    }

    fn create_image<'a>(
        &'a self,
        name: &'a str,
        _source_url: &'a str,
    ) -> ProviderFuture<'a, ImageHandle> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(ProviderCall::CreateImage(name.to_owned()));
            let (id, _) = state.next("img");
            let polls_until_ready = state.image_polls_until_ready;
            let status = if state.image_uploads_fail {
                ResourceStatus::Error
            } else {
                ResourceStatus::Pending
            };
            state.images.insert(
                id.clone(),
                StoredImage {
                    summary: ImageSummary {
                        id: id.clone(),
                        created_at: Utc::now(),
                        status,
                        public: false,
                    },
                    polls_until_ready,
                },
            );
            Ok(ImageHandle {
                id,
                name: name.to_owned(),
            })
        })
    }

    fn describe_image<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ImageSummary> {
        Box::pin(async move { self.describe_image_sync(id) })
    }

    fn delete_image<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(ProviderCall::DeleteImage(id.to_owned()));
            state
                .images
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::NotFound {
                    kind: String::from("image"),
                    id: id.to_owned(),
                })
        })
    }

    fn list_servers(&self) -> ProviderFuture<'_, Vec<ServerSummary>> {
        Box::pin(async move {
            let state = self.lock();
            if let Some(err) = state.fail_list.clone() {
                return Err(err);
            }
            Ok(state
                .servers
                .iter()
                .map(|(id, srv)| ServerSummary {
                    id: id.clone(),
                    created_at: srv.created_at,
                    status: srv.status.clone(),
                })
                .collect())
        })
    }

    fn list_images(&self) -> ProviderFuture<'_, Vec<ImageSummary>> {
        Box::pin(async move {
            let state = self.lock();
            if let Some(err) = state.fail_list.clone() {
                return Err(err);
            }
            Ok(state
                .images
                .values()
                .map(|image| image.summary.clone())
                .collect())
        })
    }

    fn console_output<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            if self.lock().fail_console {
                return Err(ProviderError::Api {
                    message: format!("console unavailable for {id}"),
                });
            }
            Ok(format!("console of {id}\n"))
        })
    }

    fn create_floating_ip(&self) -> ProviderFuture<'_, FloatingIp> {
        Box::pin(async move {
            let mut state = self.lock();
            let ip = state.allocate_floating_ip();
            state.calls.push(ProviderCall::CreateFloatingIp(ip.id.clone()));
            Ok(ip)
        })
    }

    fn delete_floating_ip<'a>(&'a self, id: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(ProviderCall::DeleteFloatingIp(id.to_owned()));
            if state.fail_delete_floating_ip.contains(id) {
                return Err(ProviderError::Api {
                    message: format!("simulated failure deleting floating IP {id}"),
                });
            }
            state
                .floating_ips
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| ProviderError::NotFound {
                    kind: String::from("floating IP"),
                    id: id.to_owned(),
                })
        })
    }

    fn list_floating_ips(&self) -> ProviderFuture<'_, Vec<FloatingIp>> {
        Box::pin(async move { Ok(self.lock().floating_ips.values().cloned().collect()) })
    }

    fn placeholders(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(
            PUBLIC_IPV4_PLACEHOLDER.to_owned(),
            String::from("${MEMORY_PUBLIC_IPV4}"),
        )])
    }
}

/// Records a single invocation made through [`RecordingRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

#[derive(Debug)]
struct Rule {
    needle: String,
    output: CommandOutput,
    once: bool,
}

#[derive(Debug, Default)]
struct RunnerState {
    invocations: Vec<CommandInvocation>,
    rules: Vec<Rule>,
    spawn_failure: bool,
}

/// Command runner that succeeds by default and records every invocation.
///
/// Individual commands can be scripted to fail by matching a substring of
/// the rendered command line. Safe to share across concurrent machines.
#[derive(Clone, Debug, Default)]
pub struct RecordingRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl RecordingRunner {
    /// Creates a runner that answers every command with exit status zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Answers commands containing `needle` with the given exit code and
    /// output. Earlier rules win.
    pub fn respond_to(&self, needle: &str, code: Option<i32>, stdout: &str, stderr: &str) {
        self.push_rule(needle, code, stdout, stderr, false);
    }

    /// Like [`RecordingRunner::respond_to`], but the rule is consumed by the
    /// first matching command.
    pub fn respond_once(&self, needle: &str, code: Option<i32>, stdout: &str, stderr: &str) {
        self.push_rule(needle, code, stdout, stderr, true);
    }

    fn push_rule(&self, needle: &str, code: Option<i32>, stdout: &str, stderr: &str, once: bool) {
        self.lock().rules.push(Rule {
            needle: needle.to_owned(),
            output: CommandOutput {
                code,
                stdout: stdout.to_owned(),
                stderr: stderr.to_owned(),
            },
            once,
        });
    }

    /// Makes every command fail to spawn.
    pub fn fail_to_spawn(&self) {
        self.lock().spawn_failure = true;
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.lock().invocations.clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, SshError> {
        let mut state = self.lock();
        let invocation = CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        };
        let rendered = invocation.command_string();
        state.invocations.push(invocation);
        if state.spawn_failure {
            return Err(SshError::Spawn {
                program: program.to_owned(),
                message: String::from("simulated spawn failure"),
            });
        }
        let position = state
            .rules
            .iter()
            .position(|rule| rendered.contains(rule.needle.as_str()));
        let scripted = match position {
            Some(idx) if state.rules.get(idx).is_some_and(|rule| rule.once) => {
                Some(state.rules.remove(idx).output)
            }
            Some(idx) => state.rules.get(idx).map(|rule| rule.output.clone()),
            None => None,
        };
        Ok(scripted.unwrap_or(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        }))
    }
}
