//! Append-only data-list metric.

use serde_json::Value;

/// Append-only list of JSON observations, reported in full.
#[derive(Debug, Default)]
pub struct DataList {
    entries: parking_lot::Mutex<Vec<Value>>,
}

impl DataList {
    /// Append a single observation.
    pub fn append(&self, value: impl Into<Value>) {
        self.entries.lock().push(value.into());
    }

    /// Number of entries recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no entries have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub(super) fn report(&self) -> Value {
        serde_json::json!({
            "type": "data_list",
            "values": self.entries.lock().clone(),
        })
    }

    pub(super) fn reset(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_order() {
        let list = DataList::default();
        list.append(1);
        list.append(2);
        let report = list.report();
        assert_eq!(report["values"], serde_json::json!([1, 2]));
    }
}
