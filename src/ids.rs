// =============================================================================
// Id Generator — Monotonic integer identities for runtime objects
// =============================================================================
//
// A single process-wide counter handed out to every object the registry
// tracks (exchanges, stocks, traders). Ids are never reused: once assigned,
// an id remains permanently associated with the object that held it, even
// after that object is destroyed.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque identifier for a runtime object tracked by the [`crate::registry::Registry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Thread-safe monotonic id generator. Ids start at 1 — 0 is reserved as a
/// sentinel "no object" value for callers that want one.
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Hand out the next id. Safe to call concurrently; every call returns a
    /// distinct value with no gaps.
    pub fn next(&self) -> ObjectId {
        ObjectId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Reset the counter back to 1. Test-only: production code must never
    /// reuse an id that has already been handed out.
    #[cfg(test)]
    pub fn reset(&self) {
        self.next.store(1, Ordering::Relaxed);
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_and_gapless() {
        let gen = IdGenerator::new();
        let ids: Vec<u64> = (0..10).map(|_| gen.next().0).collect();
        assert_eq!(ids, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn concurrent_calls_return_distinct_ids() {
        use std::sync::Arc;
        use std::thread;

        let gen = Arc::new(IdGenerator::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let gen = gen.clone();
            handles.push(thread::spawn(move || {
                (0..100).map(|_| gen.next().0).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        let mut dedup = all.clone();
        dedup.dedup();
        assert_eq!(all.len(), dedup.len(), "no id handed out twice");
        assert_eq!(all.len(), 800);
    }

    #[test]
    fn reset_rewinds_counter() {
        let gen = IdGenerator::new();
        gen.next();
        gen.next();
        gen.reset();
        assert_eq!(gen.next().0, 1);
    }
}
