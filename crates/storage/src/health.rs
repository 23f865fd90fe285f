//! Health check report returned by
//! [`ObjStorage::health_check`](crate::ObjStorage::health_check).
//!
//! A failed probe is an error
//! ([`BackendUnavailable`](crate::StorageError::BackendUnavailable)), so the
//! report only ever describes a backend that answered.

use std::{collections::BTreeMap, fmt, time::Duration};

/// Details of a successful health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// Backend identifier (`memory`, `mongo`, `postgres`).
    pub backend: String,
    /// How long the probe took.
    pub check_duration: Duration,
    /// Backend-specific details, such as object counts or database names.
    pub details: BTreeMap<String, String>,
}

impl HealthReport {
    /// Creates a report with no details.
    #[must_use = "constructing a report has no side effects"]
    pub fn new(backend: impl Into<String>, check_duration: Duration) -> Self {
        Self { backend: backend.into(), check_duration, details: BTreeMap::new() }
    }

    /// Adds a detail entry.
    #[must_use = "returns the modified report for chaining"]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} healthy ({}ms)", self.backend, self.check_duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_backend_and_duration() {
        let report = HealthReport::new("memory", Duration::from_millis(3)).with_detail("objs", "2");
        assert_eq!(report.to_string(), "memory healthy (3ms)");
        assert_eq!(report.details.get("objs").map(String::as_str), Some("2"));
    }
}
