//! Selection policies and the per-key policy state table.
//!
//! See `spec.md` §4.3: `init_state` / `select` / `on_feedback` / `serialize` / `deserialize`.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{FeedbackQuery, VersionedModelId};

/// Key under which selection-policy state is stored: `(application-name, user-id, model-version)`.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StateKey {
    /// Application name.
    pub app_name: String,
    /// Opaque user identifier.
    pub uid: String,
    /// Model version the state applies to.
    pub version: u32,
}

impl StateKey {
    /// Construct a key.
    #[must_use]
    pub fn new(app_name: impl Into<String>, uid: impl Into<String>, version: u32) -> Self {
        Self {
            app_name: app_name.into(),
            uid: uid.into(),
            version,
        }
    }
}

/// Opaque, serializable selection-policy state.
///
/// Only the default-output policy is required by `spec.md` §4.3; its state is solely the
/// configured default value.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[serde(tag = "policy")]
pub enum PolicyState {
    /// State for the default-output policy: just the default value used on deadline miss.
    DefaultOutput {
        /// Value returned when a deadline is missed.
        default_output: f64,
    },
}

/// Concurrent map from [`StateKey`] to opaque policy state.
///
/// Put is last-writer-wins; get is lock-free, per `spec.md` §4.3.
#[derive(Debug, Default)]
pub struct StateTable {
    entries: DashMap<StateKey, PolicyState>,
}

impl StateTable {
    /// Construct an empty state table.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fetch a copy of the state stored under `key`, if any.
    #[must_use]
    pub fn get(&self, key: &StateKey) -> Option<PolicyState> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    /// Overwrite the state stored under `key`.
    pub fn put(&self, key: StateKey, state: PolicyState) {
        self.entries.insert(key, state);
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Error returned when feedback is applied against an unrecognized policy state.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PolicyError {
    /// The stored state does not match what this policy implementation expects.
    #[error("policy state does not match the active selection policy")]
    StateMismatch,
}

/// Contract a selection policy implements.
pub trait SelectionPolicy: Send + Sync {
    /// Name this policy is registered under in application records.
    fn name(&self) -> &'static str;

    /// Build the initial state for a freshly registered application.
    fn init_state(&self, default_output: f64) -> PolicyState;

    /// Choose a candidate model given the current state.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `candidates` is empty or `state` does not belong to this policy.
    fn select(
        &self,
        state: &PolicyState,
        candidates: &[VersionedModelId],
    ) -> Result<VersionedModelId, PolicyError>;

    /// Apply feedback, producing updated state.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `state` does not belong to this policy.
    fn on_feedback(
        &self,
        state: &PolicyState,
        feedback: &FeedbackQuery,
    ) -> Result<PolicyState, PolicyError>;
}

/// The only selection policy `spec.md` requires: pick the first candidate, and fall back to a
/// fixed default output on deadline miss.
#[derive(Debug, Default)]
pub struct DefaultOutputPolicy;

impl SelectionPolicy for DefaultOutputPolicy {
    fn name(&self) -> &'static str {
        "default_output"
    }

    fn init_state(&self, default_output: f64) -> PolicyState {
        PolicyState::DefaultOutput { default_output }
    }

    fn select(
        &self,
        state: &PolicyState,
        candidates: &[VersionedModelId],
    ) -> Result<VersionedModelId, PolicyError> {
        let PolicyState::DefaultOutput { .. } = state;
        candidates.first().cloned().ok_or(PolicyError::StateMismatch)
    }

    fn on_feedback(
        &self,
        state: &PolicyState,
        _feedback: &FeedbackQuery,
    ) -> Result<PolicyState, PolicyError> {
        let PolicyState::DefaultOutput { default_output } = state;
        Ok(PolicyState::DefaultOutput {
            default_output: *default_output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_table_put_is_last_writer_wins() {
        let table = StateTable::new();
        let key = StateKey::new("alpha", "u1", 0);
        table.put(
            key.clone(),
            PolicyState::DefaultOutput { default_output: 1.0 },
        );
        table.put(
            key.clone(),
            PolicyState::DefaultOutput { default_output: 2.0 },
        );
        assert_eq!(
            table.get(&key),
            Some(PolicyState::DefaultOutput { default_output: 2.0 })
        );
    }

    #[test]
    fn default_output_policy_picks_first_candidate() {
        let policy = DefaultOutputPolicy;
        let state = policy.init_state(7.0);
        let candidates = vec![
            VersionedModelId {
                name: "m1".into(),
                version: 1,
            },
            VersionedModelId {
                name: "m2".into(),
                version: 1,
            },
        ];
        let chosen = policy.select(&state, &candidates).unwrap();
        assert_eq!(chosen.name, "m1");
    }
}
