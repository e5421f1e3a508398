//! Query Processor: deadline-racing model dispatch with default-output fallback.
//!
//! See `spec.md` §4.3. The model-RPC path is explicitly out of scope (`spec.md` §1); it is
//! represented here by the [`ModelDispatcher`] trait so the processor can be exercised without a
//! real worker container.

use std::sync::{atomic::AtomicU64, Arc};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::{
    policy::{DefaultOutputPolicy, PolicyState, SelectionPolicy, StateKey, StateTable},
    FeedbackAck, FeedbackQuery, Query, QueryProcessingError, Response, VersionedModelId,
};
use crate::metrics::{Histogram, Meter, MetricsRegistry};

/// A worker's response to a dispatched prediction, arriving on the (external) model-RPC path.
#[derive(Clone, Debug)]
pub struct WorkerResponse {
    /// Predicted value.
    pub output: f64,
}

/// Error a [`ModelDispatcher`] may raise while attempting to forward a request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The external model-RPC path rejected or failed to deliver the request.
    #[error("model dispatch failed: {0}")]
    Failed(String),
}

/// External collaborator contract for the model-RPC path (`spec.md` §1 scope boundary).
///
/// Implementors forward a request to a chosen model replica and resolve the returned future with
/// the worker's response, or a [`DispatchError`] if the request could not be forwarded at all
/// (this is distinct from a deadline miss, which is not an error — see [`QueryProcessor::predict`]).
#[async_trait]
pub trait ModelDispatcher: Send + Sync {
    /// Forward `query`'s input to `model`, returning the worker's eventual response.
    async fn dispatch(
        &self,
        model: &VersionedModelId,
        query: &Query,
    ) -> Result<WorkerResponse, DispatchError>;
}

/// Test double standing in for a real model-RPC path.
///
/// Always replies with a fixed output after an optional artificial delay, letting tests exercise
/// both the happy path (`spec.md` S1) and deadline-miss fallback (`spec.md` S2) without a real
/// worker container.
pub struct LoopbackDispatcher {
    output: f64,
    delay: Option<std::time::Duration>,
}

impl LoopbackDispatcher {
    /// Reply immediately with `output`.
    #[must_use]
    pub fn new(output: f64) -> Self {
        Self {
            output,
            delay: None,
        }
    }

    /// Reply with `output` after sleeping for `delay` first.
    #[must_use]
    pub fn with_delay(output: f64, delay: std::time::Duration) -> Self {
        Self {
            output,
            delay: Some(delay),
        }
    }
}

#[async_trait]
impl ModelDispatcher for LoopbackDispatcher {
    async fn dispatch(
        &self,
        _model: &VersionedModelId,
        _query: &Query,
    ) -> Result<WorkerResponse, DispatchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(WorkerResponse {
            output: self.output,
        })
    }
}

/// Per-query selection policy, deadline arithmetic, model dispatch, and default-output fallback.
pub struct QueryProcessor {
    dispatcher: Arc<dyn ModelDispatcher>,
    policies: Vec<Arc<dyn SelectionPolicy>>,
    state_table: Arc<StateTable>,
    next_query_id: AtomicU64,
    predict_latency: Arc<Histogram>,
    deadline_miss_meter: Arc<Meter>,
}

impl QueryProcessor {
    /// Construct a processor using the built-in default-output policy and the given dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the processor's own metrics cannot be registered (a kind mismatch against
    /// a previously-registered metric of the same name).
    pub fn new(
        dispatcher: Arc<dyn ModelDispatcher>,
        metrics: &MetricsRegistry,
    ) -> Result<Self, crate::metrics::MetricsError> {
        Ok(Self {
            dispatcher,
            policies: vec![Arc::new(DefaultOutputPolicy)],
            state_table: StateTable::new(),
            next_query_id: AtomicU64::new(1),
            predict_latency: metrics.create_histogram("query_processor.predict_latency_us")?,
            deadline_miss_meter: metrics.create_meter("query_processor.deadline_misses")?,
        })
    }

    /// Shared handle to the concurrent state table, exposed per `spec.md` §4.3's
    /// `get_state_table` operation.
    #[must_use]
    pub fn state_table(&self) -> Arc<StateTable> {
        self.state_table.clone()
    }

    /// Register a freshly-registered application's initial policy state, keyed under
    /// `(name, default-user-id, 0)` per `spec.md` §4.6.
    pub fn init_application_state(&self, app_name: &str, default_output: f64) {
        let key = StateKey::new(app_name, "__default__", 0);
        self.state_table
            .put(key, PolicyState::DefaultOutput { default_output });
    }

    fn policy(&self, name: &str) -> Option<&Arc<dyn SelectionPolicy>> {
        self.policies.iter().find(|p| p.name() == name)
    }

    /// Dispatch `query`, racing the model-RPC response against the query's deadline.
    ///
    /// The first of worker-response and deadline-timer to fire wins; the loser's effect on the
    /// returned [`Response`] is discarded. Never returns an error for a missed deadline — only
    /// for malformed dispatch state (no candidate models, unknown policy).
    ///
    /// # Errors
    ///
    /// Returns [`QueryProcessingError`] if the query names an unknown policy or its application
    /// has no candidate models.
    pub async fn predict(&self, mut query: Query) -> Result<Response, QueryProcessingError> {
        let query_id = self
            .next_query_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let policy =
            self.policy(&query.policy)
                .cloned()
                .ok_or_else(|| QueryProcessingError::UnknownPolicy {
                    policy: query.policy.clone(),
                })?;
        if query.candidate_models.is_empty() {
            return Err(QueryProcessingError::NoCandidateModels {
                app_name: query.app_name.clone(),
            });
        }

        let key = StateKey::new(&query.app_name, "__default__", 0);
        let state = self
            .state_table
            .get(&key)
            .unwrap_or_else(|| policy.init_state(0.0));
        let default_output = match &state {
            PolicyState::DefaultOutput { default_output } => *default_output,
        };
        let model = policy
            .select(&state, &query.candidate_models)
            .map_err(|_| QueryProcessingError::NoCandidateModels {
                app_name: query.app_name.clone(),
            })?;

        query.lineage.mark("qp::dispatch");
        let deadline = query.deadline;

        let (tx, rx) = tokio::sync::oneshot::channel();
        let dispatcher = self.dispatcher.clone();
        let dispatch_query = query.clone();
        tokio::spawn(async move {
            let result = dispatcher.dispatch(&model, &dispatch_query).await;
            // The receiver may already be gone if the deadline fired first; that's the expected
            // "loser's write is dropped" case from spec.md §9, not an error.
            let _ = tx.send(result);
        });

        let used_default;
        let output;
        tokio::select! {
            biased;
            recv = rx => {
                match recv {
                    Ok(Ok(worker_response)) => {
                        query.lineage.mark("qp::response_received");
                        output = worker_response.output;
                        used_default = false;
                    }
                    Ok(Err(err)) => {
                        warn!(app = %query.app_name, error = %err, "model dispatch failed, using default output");
                        query.lineage.mark("qp::response_received");
                        output = default_output;
                        used_default = true;
                    }
                    Err(_) => {
                        query.lineage.mark("qp::response_received");
                        output = default_output;
                        used_default = true;
                    }
                }
            }
            () = tokio::time::sleep_until(deadline) => {
                query.lineage.mark("qp::deadline_fired");
                self.deadline_miss_meter.mark(1);
                output = default_output;
                used_default = true;
            }
        }

        debug!(query_id, app = %query.app_name, used_default, "query completed");
        self.predict_latency.observe(elapsed_micros(&query));

        Ok(Response {
            query_id,
            output,
            used_default,
            lineage: query.lineage,
        })
    }

    /// Apply feedback to selection-policy state via read-modify-write under per-key atomicity.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the application names an unknown policy.
    pub async fn update(&self, feedback: FeedbackQuery) -> Result<FeedbackAck, QueryProcessingError> {
        let key = StateKey::new(&feedback.app_name, "__default__", 0);
        let Some(state) = self.state_table.get(&key) else {
            return Ok(FeedbackAck(false));
        };
        // Any registered application currently uses the default-output policy; look it up by
        // name so a future additional policy is dispatched correctly too.
        let policy_name = "default_output";
        let Some(policy) = self.policy(policy_name) else {
            return Err(QueryProcessingError::UnknownPolicy {
                policy: policy_name.into(),
            });
        };
        match policy.on_feedback(&state, &feedback) {
            Ok(new_state) => {
                self.state_table.put(key, new_state);
                Ok(FeedbackAck(true))
            }
            Err(_) => Ok(FeedbackAck(false)),
        }
    }
}

fn elapsed_micros(query: &Query) -> f64 {
    let mut dispatch = None;
    let mut received = None;
    for (stage, ts) in query.lineage.iter() {
        match stage {
            "qp::dispatch" => dispatch = Some(ts),
            "qp::response_received" | "qp::deadline_fired" => received = Some(ts),
            _ => {}
        }
    }
    match (dispatch, received) {
        (Some(a), Some(b)) => b.saturating_sub(a) as f64,
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        metrics::{MetricsConfig, MetricsRegistry},
        query::{InputTensor, InputType, QueryLineage},
    };

    fn make_query(policy: &str, latency_budget: Duration) -> Query {
        Query {
            app_name: "alpha".into(),
            uid: "u1".into(),
            input: InputTensor::F64(vec![1.0, 2.0, 3.0]),
            deadline: tokio::time::Instant::now() + latency_budget,
            policy: policy.into(),
            candidate_models: vec![VersionedModelId {
                name: "m1".into(),
                version: 1,
            }],
            lineage: QueryLineage::default(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn happy_path_returns_worker_output() {
        let metrics = MetricsRegistry::new(MetricsConfig::default());
        let dispatcher = Arc::new(LoopbackDispatcher::new(42.0));
        let processor = QueryProcessor::new(dispatcher, &metrics).unwrap();
        processor.init_application_state("alpha", 7.0);

        let query = make_query("default_output", Duration::from_millis(20));
        let response = processor.predict(query).await.unwrap();
        assert_eq!(response.output, 42.0);
        assert!(!response.used_default);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_miss_falls_back_to_default() {
        let metrics = MetricsRegistry::new(MetricsConfig::default());
        let dispatcher = Arc::new(LoopbackDispatcher::with_delay(
            42.0,
            Duration::from_millis(50),
        ));
        let processor = QueryProcessor::new(dispatcher, &metrics).unwrap();
        processor.init_application_state("alpha", 7.0);

        let query = make_query("default_output", Duration::from_millis(20));
        let response = tokio::time::timeout(Duration::from_secs(1), processor.predict(query))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.output, 7.0);
        assert!(response.used_default);
    }

    #[tokio::test]
    async fn unknown_policy_is_an_error() {
        let metrics = MetricsRegistry::new(MetricsConfig::default());
        let dispatcher = Arc::new(LoopbackDispatcher::new(1.0));
        let processor = QueryProcessor::new(dispatcher, &metrics).unwrap();

        let query = make_query("no-such-policy", Duration::from_millis(20));
        let err = processor.predict(query).await.unwrap_err();
        assert!(matches!(err, QueryProcessingError::UnknownPolicy { .. }));
    }

    #[tokio::test]
    async fn no_candidate_models_is_an_error() {
        let metrics = MetricsRegistry::new(MetricsConfig::default());
        let dispatcher = Arc::new(LoopbackDispatcher::new(1.0));
        let processor = QueryProcessor::new(dispatcher, &metrics).unwrap();

        let mut query = make_query("default_output", Duration::from_millis(20));
        query.candidate_models.clear();
        let err = processor.predict(query).await.unwrap_err();
        assert!(matches!(
            err,
            QueryProcessingError::NoCandidateModels { .. }
        ));
    }
}
