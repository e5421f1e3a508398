//! Application Registrar (`spec.md` §4.6).
//!
//! Reacts only to `hset` change events from the configuration client; parses the application
//! record fields; initializes selection-policy state; installs the record into the shared
//! registry consulted by both the HTTP and ZMQ frontends. Installation is idempotent: the first
//! `hset` for a name wins, subsequent ones for the same name are ignored (`spec.md` §9).

use std::{collections::HashMap, sync::Arc};

use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{
    config_store::{ConfigStore, ConfigStoreError},
    query::{processor::QueryProcessor, ApplicationRecord, InputType},
};

/// Error parsing an application record's raw hash fields.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RegistrarError {
    /// A required field was missing from the stored hash.
    #[error("application record missing field {field:?}")]
    MissingField {
        /// Offending field name.
        field: &'static str,
    },
    /// The `input_type` field did not name a known input type.
    #[error("unrecognized input_type {0:?}")]
    InvalidInputType(String),
    /// The `default_output` or `latency_slo_micros` field was not a valid number.
    #[error("field {field:?} is not a valid number: {value:?}")]
    InvalidNumber {
        /// Offending field name.
        field: &'static str,
        /// Raw stored value.
        value: String,
    },
    /// The `candidate_models` field could not be parsed.
    #[error(transparent)]
    ModelList(#[from] ConfigStoreError),
    /// The configuration store's change-notification stream ended (connection loss after the
    /// initial connect, or the background task panicked). Fatal per `spec.md` §4.2/§7: once this
    /// stream is gone, newly created applications can no longer be observed.
    #[error("configuration store connection lost: {0}")]
    ConfigStoreLost(String),
}

/// Shared, concurrent table of installed application records.
///
/// Consulted by the HTTP frontend's captured `/{app}/predict` and `/{app}/update` routes, and by
/// the ZMQ frontend's `app_functions` dispatch. Both frontends hold an `Arc` to the same table, so
/// a single registrar install is visible to both immediately.
#[derive(Debug, Default)]
pub struct AppRegistry {
    apps: DashMap<String, Arc<ApplicationRecord>>,
}

impl AppRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fetch the record registered under `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<ApplicationRecord>> {
        self.apps.get(name).map(|r| r.value().clone())
    }

    /// Install `record`, unless an application of the same name is already registered.
    ///
    /// Returns `true` if this call performed the installation (first-writer-wins).
    pub fn install(&self, record: ApplicationRecord) -> bool {
        let mut inserted = false;
        self.apps.entry(record.name.clone()).or_insert_with(|| {
            inserted = true;
            Arc::new(record)
        });
        inserted
    }

    /// Number of installed applications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.apps.len()
    }

    /// Whether no applications are installed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}

fn parse_record(name: &str, fields: &HashMap<String, String>) -> Result<ApplicationRecord, RegistrarError> {
    let field = |key: &'static str| {
        fields
            .get(key)
            .ok_or(RegistrarError::MissingField { field: key })
    };
    let candidate_models = ConfigStore::str_to_models(field("candidate_models")?)?;
    let input_type_raw = field("input_type")?;
    let input_type = parse_input_type(input_type_raw)
        .ok_or_else(|| RegistrarError::InvalidInputType(input_type_raw.clone()))?;
    let policy = field("policy")?.clone();
    let default_output = field("default_output")?
        .parse()
        .map_err(|_| RegistrarError::InvalidNumber {
            field: "default_output",
            value: fields["default_output"].clone(),
        })?;
    let latency_slo_micros =
        field("latency_slo_micros")?
            .parse()
            .map_err(|_| RegistrarError::InvalidNumber {
                field: "latency_slo_micros",
                value: fields["latency_slo_micros"].clone(),
            })?;
    Ok(ApplicationRecord {
        name: name.to_string(),
        candidate_models,
        input_type,
        policy,
        default_output,
        latency_slo_micros,
    })
}

fn parse_input_type(raw: &str) -> Option<InputType> {
    match raw {
        "f64" => Some(InputType::F64),
        "f32" => Some(InputType::F32),
        "i32" => Some(InputType::I32),
        "byte" => Some(InputType::Byte),
        "utf8-string" | "utf8_string" => Some(InputType::Utf8String),
        _ => None,
    }
}

/// Reacts to configuration-store change events and installs new applications.
pub struct Registrar {
    registry: Arc<AppRegistry>,
    processor: Arc<QueryProcessor>,
}

impl Registrar {
    /// Construct a registrar writing into `registry` and `processor`'s state table.
    #[must_use]
    pub fn new(registry: Arc<AppRegistry>, processor: Arc<QueryProcessor>) -> Arc<Self> {
        Arc::new(Self { registry, processor })
    }

    /// Shared application registry, consulted by the HTTP and ZMQ frontends.
    #[must_use]
    pub fn registry(&self) -> Arc<AppRegistry> {
        self.registry.clone()
    }

    /// Begin reacting to change events from `store` on a background task.
    ///
    /// Only `hset` events are acted upon; all others are ignored (`spec.md` §9). The returned
    /// handle resolves to `Err` if the underlying pub/sub stream ends for any reason (connection
    /// loss after the initial connect, or a panic in the subscription task); callers must treat
    /// that as fatal and shut the process down (`spec.md` §4.2/§7).
    pub fn spawn(self: Arc<Self>, store: Arc<ConfigStore>) -> JoinHandle<Result<(), RegistrarError>> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let pubsub_task = store.subscribe_to_application_changes(move |event| {
            let _ = tx.send(event);
        });
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if event.event_type != "hset" {
                    continue;
                }
                if let Err(err) = self.handle_hset(&store, &event.key).await {
                    warn!(app = %event.key, error = %err, "dropping malformed application record");
                }
            }
            // The channel only closes once the pub/sub task's sender half is dropped, which
            // happens exactly when that task ends — join it to find out why.
            match pubsub_task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => Err(RegistrarError::ConfigStoreLost(err.to_string())),
                Err(join_err) => Err(RegistrarError::ConfigStoreLost(join_err.to_string())),
            }
        })
    }

    async fn handle_hset(&self, store: &ConfigStore, name: &str) -> Result<(), RegistrarError> {
        let fields = store.get_application_by_key(name).await?;
        let record = parse_record(name, &fields)?;
        let default_output = record.default_output;
        if self.registry.install(record) {
            self.processor.init_application_state(name, default_output);
            info!(app = name, "installed application");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fields() -> HashMap<String, String> {
        HashMap::from([
            ("candidate_models".to_string(), "m1:1,m2:1".to_string()),
            ("input_type".to_string(), "f64".to_string()),
            ("policy".to_string(), "default_output".to_string()),
            ("default_output".to_string(), "0.5".to_string()),
            ("latency_slo_micros".to_string(), "50000".to_string()),
        ])
    }

    #[test]
    fn parse_record_succeeds_on_complete_fields() {
        let record = parse_record("alpha", &sample_fields()).unwrap();
        assert_eq!(record.name, "alpha");
        assert_eq!(record.candidate_models.len(), 2);
        assert_eq!(record.input_type, InputType::F64);
        assert_eq!(record.latency_slo_micros, 50_000);
    }

    #[test]
    fn parse_record_rejects_missing_field() {
        let mut fields = sample_fields();
        fields.remove("policy");
        assert!(parse_record("alpha", &fields).is_err());
    }

    #[test]
    fn app_registry_install_is_first_writer_wins() {
        let registry = AppRegistry::new();
        let mut first = parse_record("alpha", &sample_fields()).unwrap();
        first.default_output = 1.0;
        let mut second = parse_record("alpha", &sample_fields()).unwrap();
        second.default_output = 2.0;

        assert!(registry.install(first));
        assert!(!registry.install(second));
        assert_eq!(registry.get("alpha").unwrap().default_output, 1.0);
    }
}
