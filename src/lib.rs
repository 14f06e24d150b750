//! Core library for Flotilla, a provisioner for short-lived test machines.
//!
//! A [`Flight`] binds one cloud [`Provider`] to a floating IP
//! [`ResourcePool`]. Flights create [`Cluster`]s, and clusters create
//! [`Machine`]s: each machine is either fully provisioned and reachable over
//! SSH, or everything acquired for it has been rolled back. The
//! [`GarbageCollector`] reaps servers and images left behind by crashed runs,
//! working only from the provider's own listings.

pub mod cluster;
pub mod config;
pub mod flight;
pub mod gc;
pub mod journal;
pub mod machine;
pub mod pool;
pub mod provider;
pub mod render;
pub mod retry;
pub mod scaleway;
pub mod ssh;
pub mod test_support;

pub use cluster::{Cluster, ClusterError};
pub use config::{ConfigError, FlightConfig, ScalewayConfig};
pub use flight::{Flight, FlightBuilder, FlightError};
pub use gc::{GarbageCollector, GcError, GcSummary};
pub use journal::{FileJournalFactory, Journal, JournalError, JournalFactory};
pub use machine::{Machine, MachineError};
pub use pool::{DrainReport, PoolError, ResourcePool};
pub use provider::{
    FloatingIp, ImageHandle, ImageSummary, Provider, ProviderError, ProviderFuture,
    ResourceStatus, ServerHandle, ServerRequest, ServerSummary, create_image_and_wait,
};
pub use render::{PlaceholderRenderer, RenderError, UserDataRenderer};
pub use retry::{PollError, retry, retry_conditional, wait_until_ready};
pub use scaleway::ScalewayProvider;
pub use ssh::{CommandOutput, CommandRunner, ProcessCommandRunner, SshClient, SshConfig, SshError};
