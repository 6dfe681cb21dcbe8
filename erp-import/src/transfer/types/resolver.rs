//! Resolution cache types
//!
//! Resolutions map `(entity, business key value)` to a remote identifier.
//! Both hits and misses are remembered for the life of a job so that two
//! rows carrying the same key always see the same answer.

use std::collections::HashMap;

/// Outcome of resolving a business key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Resolved to a remote identifier
    Found(i64),
    /// Known to be absent
    Missing,
}

/// Storage for resolutions, handed to a job at construction
pub trait ResolutionCache: Send {
    fn get(&self, entity: &str, value: &str) -> Option<Resolution>;
    fn put(&mut self, entity: &str, value: &str, resolution: Resolution);
    fn invalidate(&mut self, entity: &str, value: &str);
    fn len(&self) -> usize;
}

/// Canonical form of a business key: trimmed, whitespace collapsed.
/// Case is kept; `AB1` and `ab1` are different codes.
pub fn normalize_key(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Canonical form for case-insensitive comparisons
pub fn fold_key(value: &str) -> String {
    normalize_key(value).to_lowercase()
}

/// In-memory cache for a single job
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: HashMap<(String, String), Resolution>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResolutionCache for MemoryCache {
    fn get(&self, entity: &str, value: &str) -> Option<Resolution> {
        self.entries
            .get(&(entity.to_string(), normalize_key(value)))
            .copied()
    }

    fn put(&mut self, entity: &str, value: &str, resolution: Resolution) {
        self.entries
            .insert((entity.to_string(), normalize_key(value)), resolution);
    }

    fn invalidate(&mut self, entity: &str, value: &str) {
        self.entries
            .remove(&(entity.to_string(), normalize_key(value)));
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
