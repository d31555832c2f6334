//! Content-addressed resource cache keyed by package identity and version.

use crate::fetch::FetchedResource;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;

/// Identifies one cached resource: `(package, version, logical name)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub package: String,
    pub version: String,
    pub logical_name: String,
}

impl CacheKey {
    pub fn new(
        package: impl Into<String>,
        version: impl Into<String>,
        logical_name: impl Into<String>,
    ) -> Self {
        Self {
            package: package.into(),
            version: version.into(),
            logical_name: logical_name.into(),
        }
    }
}

/// Consulted before the fetcher. Hits short-circuit retrieval entirely.
pub trait ResourceCache {
    fn get(&self, key: &CacheKey) -> Option<FetchedResource>;
    fn put(&self, key: CacheKey, resource: FetchedResource);
}

/// In-process cache with hit/miss counters.
#[derive(Debug, Default)]
pub struct MemoryResourceCache {
    entries: RefCell<HashMap<CacheKey, FetchedResource>>,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

impl MemoryResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    /// Drops every version of `package`.
    pub fn evict_package(&self, package: &str) -> usize {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|k, _| k.package != package);
        before - entries.len()
    }
}

impl ResourceCache for MemoryResourceCache {
    fn get(&self, key: &CacheKey) -> Option<FetchedResource> {
        let found = self.entries.borrow().get(key).cloned();
        match found {
            Some(_) => self.hits.set(self.hits.get() + 1),
            None => self.misses.set(self.misses.get() + 1),
        }
        found
    }

    fn put(&self, key: CacheKey, resource: FetchedResource) {
        self.entries.borrow_mut().insert(key, resource);
    }
}
