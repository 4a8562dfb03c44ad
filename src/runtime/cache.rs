// Copyright Motia LLC and/or licensed to Motia LLC under one or more
// contributor license agreements. Licensed under the Elastic License 2.0;
// you may not use this file except in compliance with the Elastic License 2.0.
// This software is patent protected. We welcome discussions - reach out at support@motia.dev
// See LICENSE and PATENTS files for details.

use std::collections::HashMap;

/// Cache key of a loaded module: the function name inside its owner scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleKey {
    pub owner_id: String,
    pub name: String,
}

impl ModuleKey {
    pub fn new(owner_id: Option<&str>, name: &str) -> Self {
        Self {
            owner_id: owner_id.unwrap_or_default().to_string(),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.owner_id.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.owner_id, self.name)
        }
    }
}

/// Which entries an invalidation drops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheScope {
    All,
    Owner(String),
    Entry(ModuleKey),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct CacheEntry<M> {
    hash: String,
    module: M,
    last_used: u64,
}

/// Hash-checked LRU cache of evaluated modules.
///
/// Lives on a single engine worker thread, so reads and writes for a key are
/// linearizable without locking.
pub struct ModuleCache<M> {
    entries: HashMap<ModuleKey, CacheEntry<M>>,
    capacity: usize,
    clock: u64,
    stats: CacheStats,
}

impl<M: Clone> ModuleCache<M> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            clock: 0,
            stats: CacheStats::default(),
        }
    }

    /// Returns the module only when it was stored under the same hash.
    pub fn get(&mut self, key: &ModuleKey, hash: &str) -> Option<M> {
        self.clock += 1;
        match self.entries.get_mut(key) {
            Some(entry) if entry.hash == hash => {
                entry.last_used = self.clock;
                self.stats.hits += 1;
                Some(entry.module.clone())
            }
            _ => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Stores a module, replacing any entry for the key and evicting the
    /// least recently used entry when over capacity.
    pub fn insert(&mut self, key: ModuleKey, hash: impl Into<String>, module: M) {
        self.clock += 1;
        self.entries.insert(
            key,
            CacheEntry {
                hash: hash.into(),
                module,
                last_used: self.clock,
            },
        );

        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
            self.stats.evictions += 1;
            tracing::debug!(module = %oldest, "Evicted module from cache");
        }
    }

    pub fn invalidate(&mut self, scope: &CacheScope) -> usize {
        let before = self.entries.len();
        match scope {
            CacheScope::All => self.entries.clear(),
            CacheScope::Owner(owner_id) => self.entries.retain(|key, _| &key.owner_id != owner_id),
            CacheScope::Entry(key) => {
                self.entries.remove(key);
            }
        }
        before - self.entries.len()
    }

    pub fn contains(&self, key: &ModuleKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
