//! Call ID generation for relay tracing.
//!
//! Every relay pair gets a unique identifier so both forwarding loops of one
//! call can be correlated through the logs.

use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Counter for short call IDs.
static CALL_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Call ID wrapper that can be included in tracing spans.
#[derive(Clone, Debug)]
pub struct CallId(String);

impl CallId {
    /// Create a new UUID-based call ID, globally unique.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create a short counter-based call ID, unique within this process.
    /// Format: `call-{counter}` with the counter zero-padded to 12 hex digits.
    pub fn short() -> Self {
        let count = CALL_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!("call-{count:012x}"))
    }

    /// Get the call ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for CallId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_call_ids_are_unique() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1.as_str(), id2.as_str());
        assert_eq!(id1.as_str().len(), 36);
    }

    #[test]
    fn test_short_call_id_format() {
        let id = CallId::short();
        assert!(id.as_str().starts_with("call-"));
    }

    #[test]
    fn test_short_call_id_uniqueness() {
        let mut ids = HashSet::new();
        for _ in 0..1000 {
            let id = CallId::short();
            assert!(ids.insert(id.as_str().to_string()), "duplicate ID generated");
        }
    }

    #[test]
    fn test_call_id_display() {
        let id = CallId::short();
        assert_eq!(format!("{}", id), id.as_str());
    }
}
