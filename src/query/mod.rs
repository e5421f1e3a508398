//! Core query-processing domain types.
//!
//! See `spec.md` §3 for the authoritative data model this module implements.

pub mod policy;
pub mod processor;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::now_micros;

/// Element type tag for an [`InputTensor`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// 64-bit floating point.
    F64,
    /// 32-bit floating point.
    F32,
    /// 32-bit signed integer.
    I32,
    /// Raw byte.
    Byte,
    /// UTF-8 string (one element, not a vector of characters).
    Utf8String,
}

impl InputType {
    /// Single-byte wire code used by the ZMQ frontend (`spec.md` §4.5).
    #[must_use]
    pub fn wire_code(self) -> u8 {
        match self {
            Self::F64 => 0,
            Self::F32 => 1,
            Self::I32 => 2,
            Self::Byte => 3,
            Self::Utf8String => 4,
        }
    }

    /// Decode a wire code, if it names a known input type.
    #[must_use]
    pub fn from_wire_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::F64),
            1 => Some(Self::F32),
            2 => Some(Self::I32),
            3 => Some(Self::Byte),
            4 => Some(Self::Utf8String),
            _ => None,
        }
    }
}

/// A candidate model replica identifier: a `(model-name, version)` pair.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VersionedModelId {
    /// Model name.
    pub name: String,
    /// Model version.
    pub version: u32,
}

/// A typed, length-prefixed vector of input primitives.
///
/// Invariant: the element type must match the target application's `input_type`; callers parsing
/// untrusted input are responsible for rejecting mismatches before constructing this type.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InputTensor {
    /// `f64` elements.
    F64(Vec<f64>),
    /// `f32` elements.
    F32(Vec<f32>),
    /// `i32` elements.
    I32(Vec<i32>),
    /// Raw bytes.
    Byte(Vec<u8>),
    /// A single UTF-8 string.
    Utf8String(String),
}

impl InputTensor {
    /// The [`InputType`] this tensor's elements match.
    #[must_use]
    pub fn input_type(&self) -> InputType {
        match self {
            Self::F64(_) => InputType::F64,
            Self::F32(_) => InputType::F32,
            Self::I32(_) => InputType::I32,
            Self::Byte(_) => InputType::Byte,
            Self::Utf8String(_) => InputType::Utf8String,
        }
    }

    /// Number of elements (byte count for `Byte`, character count for `Utf8String`).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::F64(v) => v.len(),
            Self::F32(v) => v.len(),
            Self::I32(v) => v.len(),
            Self::Byte(v) => v.len(),
            Self::Utf8String(s) => s.len(),
        }
    }

    /// Whether this tensor has no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode a tensor from JSON according to an explicitly expected [`InputType`], rejecting any
    /// mismatch between the requested type and the payload's shape at parse time (`spec.md` §3).
    ///
    /// # Errors
    ///
    /// Returns `Err` if `value` is not an array (or string, for [`InputType::Utf8String`]) of the
    /// expected element type.
    pub fn from_typed_json(
        input_type: InputType,
        value: &serde_json::Value,
    ) -> Result<Self, TensorParseError> {
        match input_type {
            InputType::Utf8String => value
                .as_str()
                .map(|s| Self::Utf8String(s.to_string()))
                .ok_or(TensorParseError::TypeMismatch { input_type }),
            InputType::Byte => {
                let elems = value.as_array().ok_or(TensorParseError::TypeMismatch { input_type })?;
                elems
                    .iter()
                    .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
                    .collect::<Option<Vec<u8>>>()
                    .map(Self::Byte)
                    .ok_or(TensorParseError::TypeMismatch { input_type })
            }
            InputType::I32 => {
                let elems = value.as_array().ok_or(TensorParseError::TypeMismatch { input_type })?;
                elems
                    .iter()
                    .map(|v| v.as_i64().and_then(|n| i32::try_from(n).ok()))
                    .collect::<Option<Vec<i32>>>()
                    .map(Self::I32)
                    .ok_or(TensorParseError::TypeMismatch { input_type })
            }
            InputType::F32 => {
                let elems = value.as_array().ok_or(TensorParseError::TypeMismatch { input_type })?;
                #[allow(clippy::cast_possible_truncation)]
                elems
                    .iter()
                    .map(|v| v.as_f64().map(|n| n as f32))
                    .collect::<Option<Vec<f32>>>()
                    .map(Self::F32)
                    .ok_or(TensorParseError::TypeMismatch { input_type })
            }
            InputType::F64 => {
                let elems = value.as_array().ok_or(TensorParseError::TypeMismatch { input_type })?;
                elems
                    .iter()
                    .map(serde_json::Value::as_f64)
                    .collect::<Option<Vec<f64>>>()
                    .map(Self::F64)
                    .ok_or(TensorParseError::TypeMismatch { input_type })
            }
        }
    }
}

/// Error decoding an [`InputTensor`] against an application's declared input type.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TensorParseError {
    /// The payload's shape does not match the application's declared input type.
    #[error("input payload does not match declared input type {input_type:?}")]
    TypeMismatch {
        /// Declared input type the payload was checked against.
        input_type: InputType,
    },
}

/// A named configuration binding an input type, candidate models, selection policy, default
/// output, and latency SLO.
///
/// Created by an external admin action on the configuration store; mutated only by the store;
/// destroyed by the store. The registrar treats records as append-only within a process
/// lifetime (`spec.md` §9).
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ApplicationRecord {
    /// Unique application name.
    pub name: String,
    /// Ordered list of candidate model replicas.
    pub candidate_models: Vec<VersionedModelId>,
    /// Expected element type of prediction inputs.
    pub input_type: InputType,
    /// Selection policy name (currently only `"default_output"` is implemented).
    pub policy: String,
    /// Default output value returned on deadline miss.
    pub default_output: f64,
    /// Per-request latency budget, in microseconds.
    pub latency_slo_micros: u64,
}

/// Mapping of pipeline stage names to microsecond timestamps, for end-to-end latency
/// attribution. No cycles; insertion order is preserved for reporting.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(transparent)]
pub struct QueryLineage(IndexMap<String, u64>);

impl QueryLineage {
    /// Record the current wall-clock time under `stage`.
    pub fn mark(&mut self, stage: impl Into<String>) {
        self.0.insert(stage.into(), now_micros());
    }

    /// Iterate over recorded stages in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

/// An ephemeral prediction request. Created on arrival; destroyed after response delivery or
/// deadline expiry.
#[derive(Clone, Debug)]
pub struct Query {
    /// Target application name.
    pub app_name: String,
    /// Opaque user identifier.
    pub uid: String,
    /// Decoded input tensor.
    pub input: InputTensor,
    /// Absolute monotonic deadline.
    pub deadline: tokio::time::Instant,
    /// Selection policy name in effect for this query.
    pub policy: String,
    /// Snapshot of candidate models taken at dispatch time.
    pub candidate_models: Vec<VersionedModelId>,
    /// Lineage recorded so far.
    pub lineage: QueryLineage,
}

/// Feedback submitted via the `/update` endpoint.
#[derive(Clone, Debug)]
pub struct FeedbackQuery {
    /// Target application name.
    pub app_name: String,
    /// Opaque user identifier.
    pub uid: String,
    /// Input tensor the feedback pertains to.
    pub input: InputTensor,
    /// Ground-truth label.
    pub label: f64,
}

/// Acknowledgment returned by [`processor::QueryProcessor::update`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct FeedbackAck(pub bool);

/// A completed prediction.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Response {
    /// Monotonically increasing query id, unique within a process.
    pub query_id: u64,
    /// Predicted value.
    pub output: f64,
    /// Whether the configured default was returned due to a deadline miss.
    #[serde(rename = "default")]
    pub used_default: bool,
    /// Pipeline-stage lineage timestamps.
    pub lineage: QueryLineage,
}

/// Errors raised while constructing dispatch state for a query.
///
/// Per `spec.md` §4.3, these are the only cases the processor surfaces as errors — a missed
/// deadline is absorbed, never propagated as one of these.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueryProcessingError {
    /// The target application has no candidate models.
    #[error("application {app_name:?} has no candidate models")]
    NoCandidateModels {
        /// Offending application name.
        app_name: String,
    },
    /// The application names a selection policy with no registered implementation.
    #[error("unknown selection policy {policy:?}")]
    UnknownPolicy {
        /// Offending policy name.
        policy: String,
    },
}
