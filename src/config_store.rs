//! Redis-backed configuration client (`spec.md` §4.2).
//!
//! Two logical connections: a [`redis::aio::ConnectionManager`] for request/response reads, and a
//! dedicated pub/sub connection for change notifications. Both retry with a fixed backoff
//! indefinitely until the first successful connection; a connection lost afterward is fatal to
//! the process, matching `spec.md` §7.

use std::collections::HashMap;

use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::{config::ConfigStoreSettings, query::VersionedModelId};

/// Error type for the configuration client.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigStoreError {
    /// The underlying Redis connection failed.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// A `candidate_models` field could not be parsed into `(name, version)` pairs.
    #[error("malformed candidate model list: {0:?}")]
    MalformedModelList(String),
    /// A change-notification payload was not valid JSON matching the expected shape.
    #[error("malformed change notification: {0}")]
    MalformedNotification(String),
}

/// A single change notification for an application record.
///
/// Only `event_type == "hset"` is acted upon by the Application Registrar (`spec.md` §4.6); all
/// other event types, including deletions, are intentionally ignored (`spec.md` §9).
#[derive(Clone, Debug, Deserialize)]
pub struct ApplicationChangeEvent {
    /// The application's key (name) in the configuration store.
    pub key: String,
    /// The store's event type string, e.g. `"hset"`.
    pub event_type: String,
}

/// Redis-backed configuration client.
pub struct ConfigStore {
    manager: ConnectionManager,
    client: Client,
    settings: ConfigStoreSettings,
}

impl ConfigStore {
    /// Connect to the configuration store, retrying with a fixed backoff indefinitely until the
    /// first successful connection.
    pub async fn connect(settings: ConfigStoreSettings) -> Self {
        loop {
            match Self::try_connect(&settings).await {
                Ok((client, manager)) => {
                    info!(url = %settings.url, "connected to configuration store");
                    return Self {
                        manager,
                        client,
                        settings,
                    };
                }
                Err(err) => {
                    warn!(
                        url = %settings.url,
                        error = %err,
                        backoff = ?settings.reconnect_backoff,
                        "configuration store connection failed, retrying"
                    );
                    tokio::time::sleep(settings.reconnect_backoff).await;
                }
            }
        }
    }

    async fn try_connect(
        settings: &ConfigStoreSettings,
    ) -> Result<(Client, ConnectionManager), ConfigStoreError> {
        let client = Client::open(settings.url.as_str())?;
        let manager = client.get_connection_manager().await?;
        Ok((client, manager))
    }

    /// Read an application record's fields as a hash (`HGETALL`).
    ///
    /// # Errors
    ///
    /// Returns `Err` if the connection to the store has been lost. This is fatal to the process
    /// per `spec.md` §7; callers should propagate the error up to process shutdown rather than
    /// retrying individual reads.
    pub async fn get_application_by_key(
        &self,
        name: &str,
    ) -> Result<HashMap<String, String>, ConfigStoreError> {
        let mut manager = self.manager.clone();
        let fields: HashMap<String, String> = manager.hgetall(name).await?;
        Ok(fields)
    }

    /// Parse a comma-separated `name:version` list into candidate model identifiers.
    ///
    /// # Errors
    ///
    /// Returns `Err` if any entry is not a `name:version` pair with a valid integer version.
    pub fn str_to_models(raw: &str) -> Result<Vec<VersionedModelId>, ConfigStoreError> {
        raw.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .map(|entry| {
                let (name, version) = entry
                    .rsplit_once(':')
                    .ok_or_else(|| ConfigStoreError::MalformedModelList(raw.to_string()))?;
                let version: u32 = version
                    .parse()
                    .map_err(|_| ConfigStoreError::MalformedModelList(raw.to_string()))?;
                Ok(VersionedModelId {
                    name: name.to_string(),
                    version,
                })
            })
            .collect()
    }

    /// Subscribe to application change notifications, invoking `callback` for every message.
    ///
    /// Runs on a dedicated pub/sub connection on its own background task. A connection loss after
    /// the initial subscribe is treated as fatal: the task exits with an error, which the caller
    /// should treat as a signal to shut down the process (`spec.md` §7).
    pub fn subscribe_to_application_changes<F>(&self, callback: F) -> JoinHandle<Result<(), ConfigStoreError>>
    where
        F: Fn(ApplicationChangeEvent) + Send + 'static,
    {
        let client = self.client.clone();
        let channel = self.settings.channel.clone();
        tokio::spawn(async move {
            let mut pubsub = client.get_async_pubsub().await?;
            pubsub.subscribe(&channel).await?;
            info!(%channel, "subscribed to configuration change notifications");
            let mut stream = pubsub.on_message();
            while let Some(msg) = futures::StreamExt::next(&mut stream).await {
                let payload: String = msg.get_payload()?;
                match serde_json::from_str::<ApplicationChangeEvent>(&payload) {
                    Ok(event) => callback(event),
                    Err(err) => {
                        error!(error = %err, payload, "dropping malformed change notification");
                    }
                }
            }
            Err(ConfigStoreError::MalformedNotification(
                "pub/sub stream ended".into(),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn str_to_models_parses_name_version_pairs() {
        let models = ConfigStore::str_to_models("alpha:1,beta:2").unwrap();
        assert_eq!(
            models,
            vec![
                VersionedModelId {
                    name: "alpha".into(),
                    version: 1
                },
                VersionedModelId {
                    name: "beta".into(),
                    version: 2
                },
            ]
        );
    }

    #[test]
    fn str_to_models_rejects_missing_version() {
        assert!(ConfigStore::str_to_models("alpha").is_err());
    }

    #[test]
    fn str_to_models_ignores_blank_entries() {
        let models = ConfigStore::str_to_models("alpha:1,,beta:2,").unwrap();
        assert_eq!(models.len(), 2);
    }
}
