//! Misc utility functions.

use std::time::{SystemTime, UNIX_EPOCH};

/// Helper function used for default boolean values in [`serde`].
///
/// Always returns `true`.
#[must_use]
#[inline]
pub(crate) fn default_true() -> bool {
    true
}

/// Current wall-clock time as microseconds since the Unix epoch.
///
/// Used to stamp [`crate::query::QueryLineage`] entries; these are for latency attribution in
/// metrics/logs, never for deadline arithmetic, which stays on `tokio::time::Instant`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}
