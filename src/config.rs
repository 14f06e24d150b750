//! Configuration loading via `ortho-config`.

use std::ffi::OsString;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

/// Flight-wide settings derived from environment variables, configuration
/// files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "FLOTILLA",
    discovery(
        app_name = "flotilla",
        env_var = "FLOTILLA_CONFIG_PATH",
        config_file_name = "flotilla.toml",
        dotfile_name = ".flotilla.toml",
        project_file_name = "flotilla.toml"
    )
)]
pub struct FlightConfig {
    /// Directory receiving one sub-directory per cluster and machine.
    #[ortho_config(default = "_flotilla".to_owned())]
    pub output_dir: String,
    /// Maximum number of floating IPs the pool tracks. Set it to the
    /// backend's floating IP quota.
    #[ortho_config(default = 16)]
    pub pool_capacity: usize,
    /// Seconds to wait for a new machine to answer over SSH.
    #[ortho_config(default = 300)]
    pub ssh_ready_timeout_secs: u64,
    /// Seconds between SSH readiness checks.
    #[ortho_config(default = 5)]
    pub ssh_poll_interval_secs: u64,
    /// Upper bound on everything that follows server creation while
    /// provisioning a machine; exceeding it triggers rollback.
    #[ortho_config(default = 600)]
    pub provision_timeout_secs: u64,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            output_dir: String::from("_flotilla"),
            pool_capacity: 16,
            ssh_ready_timeout_secs: 300,
            ssh_poll_interval_secs: 5,
            provision_timeout_secs: 600,
        }
    }
}

impl FlightConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("flotilla")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Performs semantic validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when the output directory is
    /// blank and [`ConfigError::Invalid`] when a numeric bound is zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_field(&self.output_dir, "FLOTILLA", "output_dir", "flotilla")?;
        require_positive(self.pool_capacity, "pool_capacity")?;
        require_positive(self.ssh_ready_timeout_secs, "ssh_ready_timeout_secs")?;
        require_positive(self.ssh_poll_interval_secs, "ssh_poll_interval_secs")?;
        require_positive(self.provision_timeout_secs, "provision_timeout_secs")?;
        Ok(())
    }

    /// Output directory as a UTF-8 path.
    #[must_use]
    pub fn output_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(&self.output_dir)
    }

    /// SSH readiness timeout.
    #[must_use]
    pub const fn ssh_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_ready_timeout_secs)
    }

    /// Interval between SSH readiness checks.
    #[must_use]
    pub const fn ssh_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ssh_poll_interval_secs)
    }

    /// Bound on post-create provisioning steps.
    #[must_use]
    pub const fn provision_timeout(&self) -> Duration {
        Duration::from_secs(self.provision_timeout_secs)
    }
}

/// Settings for the Scaleway backend.
///
/// The credential, project, and zone keys share their environment names
/// with the `scw` CLI, so an account already configured for it works as is.
/// The remaining keys shape the servers and images Flotilla creates.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(prefix = "SCW")]
pub struct ScalewayConfig {
    /// API secret key sent as `X-Auth-Token`.
    pub secret_key: String,
    /// Project owning every server, IP, snapshot, and image Flotilla
    /// creates. Listings for garbage collection are scoped to it.
    pub default_project_id: String,
    /// Zone every request targets.
    #[ortho_config(default = "fr-par-1".to_owned())]
    pub default_zone: String,
    /// Server offer; development instances boot fastest.
    #[ortho_config(default = "DEV1-S".to_owned())]
    pub commercial_type: String,
    /// Marketplace label of the boot image. It must read user-data through
    /// Afterburn for address placeholders to resolve.
    #[ortho_config(default = "Fedora CoreOS".to_owned())]
    pub image_name: String,
    /// Architecture of both the boot image and imported images.
    #[ortho_config(default = "x86_64".to_owned())]
    pub image_arch: String,
    /// Volume type requested for snapshots imported from object storage.
    #[ortho_config(default = "l_ssd".to_owned())]
    pub snapshot_volume_type: String,
}

impl ScalewayConfig {
    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("flotilla")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks that no key is blank.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] naming the first blank key and
    /// the environment variable that sets it.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let keys = [
            ("secret_key", &self.secret_key),
            ("default_project_id", &self.default_project_id),
            ("default_zone", &self.default_zone),
            ("commercial_type", &self.commercial_type),
            ("image_name", &self.image_name),
            ("image_arch", &self.image_arch),
            ("snapshot_volume_type", &self.snapshot_volume_type),
        ];
        for (key, value) in keys {
            require_field(value, "SCW", key, "scaleway")?;
        }
        Ok(())
    }
}

fn require_field(value: &str, prefix: &str, key: &str, section: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::MissingField(format!(
            "{key} is blank: set {prefix}_{} or `{key}` under [{section}] in flotilla.toml",
            key.to_ascii_uppercase()
        )));
    }
    Ok(())
}

fn require_positive<T: Default + PartialEq>(value: T, field: &str) -> Result<(), ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid(format!("{field} must be greater than zero")));
    }
    Ok(())
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field holds a value outside its accepted range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
