//! Resource-version expectations: the status-up-to-date gate.
//!
//! After writing status, the reconciler records the resourceVersion it wrote.
//! Until the watch cache serves an object at least that fresh, reconciles for
//! the key requeue without doing work, so effectiveness and pod counts never
//! oscillate off a stale view.

use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
pub struct ResourceVersionExpectation {
    expected: Mutex<HashMap<String, u64>>,
}

impl ResourceVersionExpectation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the resourceVersion the caller just wrote for this key.
    pub fn expect_update(&self, key: &str, resource_version: &str) {
        if let Some(version) = parse_version(resource_version) {
            self.expected.lock().unwrap().insert(key.to_string(), version);
        }
    }

    /// Whether the observed object is at least as fresh as the last write.
    /// A satisfied expectation is cleared.
    pub fn satisfied(&self, key: &str, resource_version: &str) -> bool {
        let mut expected = self.expected.lock().unwrap();
        let Some(&want) = expected.get(key) else {
            return true;
        };
        match parse_version(resource_version) {
            Some(observed) if observed >= want => {
                expected.remove(key);
                true
            }
            // An unparseable version cannot be compared; let the reconcile
            // proceed rather than wedging the key forever.
            None => {
                expected.remove(key);
                true
            }
            Some(_) => false,
        }
    }

    /// Drops any expectation for a deleted object.
    pub fn delete(&self, key: &str) {
        self.expected.lock().unwrap().remove(key);
    }
}

/// resourceVersion is opaque to clients but numeric on every real apiserver.
fn parse_version(resource_version: &str) -> Option<u64> {
    resource_version.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_key_is_satisfied() {
        let exp = ResourceVersionExpectation::new();
        assert!(exp.satisfied("ns/dec", "12"));
    }

    #[test]
    fn stale_observation_requeues_until_caught_up() {
        let exp = ResourceVersionExpectation::new();
        exp.expect_update("ns/dec", "20");
        assert!(!exp.satisfied("ns/dec", "19"));
        assert!(exp.satisfied("ns/dec", "20"));
        // Expectation cleared once met.
        assert!(exp.satisfied("ns/dec", "19"));
    }

    #[test]
    fn delete_clears_expectation() {
        let exp = ResourceVersionExpectation::new();
        exp.expect_update("ns/dec", "20");
        exp.delete("ns/dec");
        assert!(exp.satisfied("ns/dec", "1"));
    }
}
