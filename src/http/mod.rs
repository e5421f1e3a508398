//! HTTP Frontend (`spec.md` §4.4).
//!
//! A single captured route pair (`/{app}/predict`, `/{app}/update`) consults the shared
//! [`AppRegistry`] populated at runtime by the Application Registrar, instead of the teacher's
//! compile-time, `inventory`-registered per-handler routes: `axum::Router` route trees are
//! immutable once built, so dynamic endpoint installation becomes a dynamic registry lookup
//! behind a fixed route rather than literal route-tree mutation.

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{FromRequest, Path, Request, State},
    http::StatusCode,
    response::IntoResponse,
    routing, Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    errors::error_body,
    metrics::{metrics_router, MetricsRegistry},
    query::{
        processor::QueryProcessor, FeedbackQuery, InputTensor, Query, QueryLineage,
        QueryProcessingError,
    },
    registrar::AppRegistry,
};

/// Shared state consulted by the predict/update handlers.
#[derive(Clone)]
pub struct HttpState {
    registry: Arc<AppRegistry>,
    processor: Arc<QueryProcessor>,
}

impl HttpState {
    /// Construct HTTP frontend state over a shared application registry and query processor.
    #[must_use]
    pub fn new(registry: Arc<AppRegistry>, processor: Arc<QueryProcessor>) -> Self {
        Self { registry, processor }
    }
}

/// `Json<T>` extractor whose rejection is the `{error:"Json error", cause}` body `spec.md`
/// §4.4/§7 requires for JSON parse errors, instead of axum's own plain-text rejection body.
struct AppJson<T>(T);

impl<T, S> FromRequest<S> for AppJson<T>
where
    T: serde::de::DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = axum::response::Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(error_body(StatusCode::BAD_REQUEST, "Json error", rejection)),
        }
    }
}

/// Request body for `POST /{app}/predict`.
#[derive(Debug, Deserialize)]
struct PredictRequest {
    uid: String,
    input: serde_json::Value,
}

/// Request body for `POST /{app}/update`.
#[derive(Debug, Deserialize)]
struct UpdateRequest {
    uid: String,
    input: serde_json::Value,
    label: f64,
}

/// Ack body for `POST /{app}/update`.
#[derive(Debug, Serialize)]
struct UpdateResponse {
    accepted: bool,
}

/// Build the full HTTP router: `/metrics`, `/{app}/predict`, `/{app}/update`.
#[must_use]
pub fn http_router(state: HttpState, metrics: Arc<MetricsRegistry>) -> Router {
    Router::new()
        .route("/{app}/predict", routing::post(predict_handler))
        .route("/{app}/update", routing::post(update_handler))
        .with_state(state)
        .merge(metrics_router(metrics))
}

async fn predict_handler(
    Path(app): Path<String>,
    State(state): State<HttpState>,
    AppJson(body): AppJson<PredictRequest>,
) -> axum::response::Response {
    let Some(record) = state.registry.get(&app) else {
        return error_body(StatusCode::NOT_FOUND, "unknown_application", &app);
    };

    let input = match InputTensor::from_typed_json(record.input_type, &body.input) {
        Ok(input) => input,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, "Json error", err),
    };

    let mut lineage = QueryLineage::default();
    lineage.mark("http::recv");
    let deadline =
        tokio::time::Instant::now() + Duration::from_micros(record.latency_slo_micros);
    let query = Query {
        app_name: app.clone(),
        uid: body.uid,
        input,
        deadline,
        policy: record.policy.clone(),
        candidate_models: record.candidate_models.clone(),
        lineage,
    };

    match state.processor.predict(query).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => dispatch_error_response(&app, err),
    }
}

async fn update_handler(
    Path(app): Path<String>,
    State(state): State<HttpState>,
    AppJson(body): AppJson<UpdateRequest>,
) -> axum::response::Response {
    let Some(record) = state.registry.get(&app) else {
        return error_body(StatusCode::NOT_FOUND, "unknown_application", &app);
    };

    let input = match InputTensor::from_typed_json(record.input_type, &body.input) {
        Ok(input) => input,
        Err(err) => return error_body(StatusCode::BAD_REQUEST, "Json error", err),
    };

    let feedback = FeedbackQuery {
        app_name: app.clone(),
        uid: body.uid,
        input,
        label: body.label,
    };

    match state.processor.update(feedback).await {
        Ok(ack) => (StatusCode::OK, Json(UpdateResponse { accepted: ack.0 })).into_response(),
        Err(err) => dispatch_error_response(&app, err),
    }
}

fn dispatch_error_response(app: &str, err: QueryProcessingError) -> axum::response::Response {
    warn!(app, error = %err, "query dispatch rejected");
    match err {
        QueryProcessingError::NoCandidateModels { .. } | QueryProcessingError::UnknownPolicy { .. } => {
            error_body(StatusCode::BAD_REQUEST, "Query processing error", err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::{
        metrics::{MetricsConfig, MetricsRegistry},
        query::{processor::LoopbackDispatcher, ApplicationRecord, InputType, VersionedModelId},
    };

    fn make_state() -> HttpState {
        let metrics = MetricsRegistry::new(MetricsConfig::default());
        let dispatcher = Arc::new(LoopbackDispatcher::new(9.0));
        let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics).unwrap());
        let registry = AppRegistry::new();
        registry.install(ApplicationRecord {
            name: "alpha".into(),
            candidate_models: vec![VersionedModelId {
                name: "m1".into(),
                version: 1,
            }],
            input_type: InputType::F64,
            policy: "default_output".into(),
            default_output: 0.0,
            latency_slo_micros: 50_000,
        });
        processor.init_application_state("alpha", 0.0);
        HttpState::new(registry, processor)
    }

    #[tokio::test]
    async fn predict_unregistered_app_is_404() {
        let state = make_state();
        let resp = predict_handler(
            Path("missing".into()),
            State(state),
            AppJson(PredictRequest {
                uid: "u1".into(),
                input: json!([1.0, 2.0]),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn predict_registered_app_dispatches() {
        let state = make_state();
        let resp = predict_handler(
            Path("alpha".into()),
            State(state),
            AppJson(PredictRequest {
                uid: "u1".into(),
                input: json!([1.0, 2.0, 3.0]),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test(start_paused = true)]
    async fn predict_deadline_miss_falls_back_to_default_output() {
        let metrics = MetricsRegistry::new(MetricsConfig::default());
        let dispatcher = Arc::new(LoopbackDispatcher::with_delay(
            42.0,
            std::time::Duration::from_millis(50),
        ));
        let processor = Arc::new(QueryProcessor::new(dispatcher, &metrics).unwrap());
        let registry = AppRegistry::new();
        registry.install(ApplicationRecord {
            name: "alpha".into(),
            candidate_models: vec![VersionedModelId {
                name: "m1".into(),
                version: 1,
            }],
            input_type: InputType::F64,
            policy: "default_output".into(),
            default_output: 7.0,
            latency_slo_micros: 20_000,
        });
        processor.init_application_state("alpha", 7.0);
        let state = HttpState::new(registry, processor);

        let resp = predict_handler(
            Path("alpha".into()),
            State(state),
            AppJson(PredictRequest {
                uid: "u1".into(),
                input: json!([1.0, 2.0, 3.0]),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn predict_rejects_type_mismatch() {
        let state = make_state();
        let resp = predict_handler(
            Path("alpha".into()),
            State(state),
            AppJson(PredictRequest {
                uid: "u1".into(),
                input: json!("not-a-number-array"),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
