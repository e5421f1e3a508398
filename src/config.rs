//! Application configuration structures.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    builder::ServerBuilder, logging::LoggingConfig, metrics::MetricsConfig,
    runtime::RuntimeConfig,
};

/// Top-level application configuration.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct AppConfig {
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Tokio runtime tuning.
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// HTTP listen address and socket tuning.
    #[serde(default)]
    pub server: ServerBuilder,
    /// Metrics registry configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Configuration store (Redis) connection settings.
    #[serde(default)]
    pub config_store: ConfigStoreSettings,
    /// ZMQ frontend settings.
    #[serde(default)]
    pub zmq: ZmqConfig,
}

/// Connection settings for the external configuration store.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ConfigStoreSettings {
    /// Redis connection URL.
    #[serde(default = "ConfigStoreSettings::default_url")]
    pub url: String,
    /// Pub/sub channel that change notifications arrive on.
    #[serde(default = "ConfigStoreSettings::default_channel")]
    pub channel: String,
    /// Fixed backoff between reconnect attempts.
    #[serde(default = "ConfigStoreSettings::default_backoff", with = "humantime_serde")]
    pub reconnect_backoff: std::time::Duration,
}

impl Default for ConfigStoreSettings {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            channel: Self::default_channel(),
            reconnect_backoff: Self::default_backoff(),
        }
    }
}

impl ConfigStoreSettings {
    #[must_use]
    #[inline]
    fn default_url() -> String {
        "redis://localhost".into()
    }

    #[must_use]
    #[inline]
    fn default_channel() -> String {
        "application-updates".into()
    }

    #[must_use]
    #[inline]
    fn default_backoff() -> std::time::Duration {
        std::time::Duration::from_secs(1)
    }
}

/// ZMQ frontend settings.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct ZmqConfig {
    /// Address both ROUTER sockets bind on.
    #[serde(default = "ZmqConfig::default_bind_addr")]
    pub bind_addr: String,
    /// Port for the receive-side ROUTER socket.
    #[serde(default = "ZmqConfig::default_recv_port")]
    pub recv_port: u16,
    /// Port for the send-side ROUTER socket.
    #[serde(default = "ZmqConfig::default_send_port")]
    pub send_port: u16,
    /// Byte budget of the payload arena.
    #[serde(default = "ZmqConfig::default_arena_bytes")]
    pub arena_bytes: usize,
    /// Soft cap on response-queue depth before the drop meter is incremented.
    #[serde(default = "ZmqConfig::default_queue_soft_cap")]
    pub queue_soft_cap: usize,
}

impl Default for ZmqConfig {
    fn default() -> Self {
        Self {
            bind_addr: Self::default_bind_addr(),
            recv_port: Self::default_recv_port(),
            send_port: Self::default_send_port(),
            arena_bytes: Self::default_arena_bytes(),
            queue_soft_cap: Self::default_queue_soft_cap(),
        }
    }
}

impl ZmqConfig {
    #[must_use]
    #[inline]
    fn default_bind_addr() -> String {
        "0.0.0.0".into()
    }

    #[must_use]
    #[inline]
    fn default_recv_port() -> u16 {
        4455
    }

    #[must_use]
    #[inline]
    fn default_send_port() -> u16 {
        4456
    }

    /// Sized for ~80,000 in-flight 299x299x3 `f32` tensors, doubled per `spec.md` §3's
    /// non-overlap invariant.
    #[must_use]
    #[inline]
    fn default_arena_bytes() -> usize {
        80_000 * 299 * 299 * 3 * std::mem::size_of::<f32>() * 2
    }

    #[must_use]
    #[inline]
    fn default_queue_soft_cap() -> usize {
        80_000
    }
}

/// Error type returned while loading [`ServiceConfig`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ServiceConfigError {
    /// Error building or deserializing configuration.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Layered file + environment variable configuration loader.
///
/// Mirrors the `ServiceConfig::<T>::builder().with_file(..).with_env(..).build()` pattern used
/// throughout operator binaries in this ecosystem: a YAML file supplies the base configuration,
/// environment variables (under a caller-chosen prefix) override individual fields.
pub struct ServiceConfigBuilder {
    inner: config::ConfigBuilder<config::builder::DefaultState>,
}

impl ServiceConfigBuilder {
    /// Start a new builder with no sources configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: config::Config::builder(),
        }
    }

    /// Layer in a YAML configuration file, if present.
    ///
    /// A missing file is not an error: defaults and environment variables still apply.
    #[must_use]
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.inner = self.inner.add_source(
            config::File::from(path.as_ref()).required(false),
        );
        self
    }

    /// Layer in environment variables under the given prefix (e.g. `MLSERVE` picks up
    /// `MLSERVE_CONFIG_STORE__URL`).
    #[must_use]
    pub fn with_env(mut self, prefix: impl AsRef<str>) -> Self {
        self.inner = self.inner.add_source(
            config::Environment::with_prefix(prefix.as_ref())
                .separator("__")
                .try_parsing(true),
        );
        self
    }

    /// Build and deserialize the layered configuration into `T`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any source fails to load, or if the merged configuration cannot be
    /// deserialized into `T`.
    pub fn build<T>(self) -> Result<T, ServiceConfigError>
    where
        T: serde::de::DeserializeOwned,
    {
        Ok(self.inner.build()?.try_deserialize()?)
    }
}

impl Default for ServiceConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn build_applies_defaults_with_no_sources() {
        let config = ServiceConfigBuilder::new().build::<AppConfig>().unwrap();
        assert_eq!(config.zmq.recv_port, 4455);
        assert_eq!(config.config_store.url, "redis://localhost");
    }

    #[test]
    fn file_source_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(file, "zmq:\n  recv_port: 9001\nconfig_store:\n  url: redis://configstore:6379").unwrap();
        let config = ServiceConfigBuilder::new()
            .with_file(file.path())
            .build::<AppConfig>()
            .unwrap();
        assert_eq!(config.zmq.recv_port, 9001);
        assert_eq!(config.config_store.url, "redis://configstore:6379");
        assert_eq!(config.zmq.send_port, 4456, "unset fields keep their default");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = ServiceConfigBuilder::new()
            .with_file("/nonexistent/mlserve.yaml")
            .build::<AppConfig>()
            .unwrap();
        assert_eq!(config.zmq.recv_port, 4455);
    }
}
