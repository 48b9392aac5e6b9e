use std::collections::HashMap;

use crate::error::Outcome;
use crate::key::CacheKey;

/// State of one cache key during a run.
#[derive(Debug)]
pub(crate) enum Entry<O> {
    /// Being computed by `O` (a node id, or `()` for the serial runner).
    InProgress(O),
    Resolved(Outcome),
}

/// Tri-state result cache: absent, in progress, resolved.
///
/// Resolved entries are never overwritten. The cache lives for one run.
#[derive(Debug)]
pub(crate) struct ResultCache<O> {
    entries: HashMap<CacheKey, Entry<O>>,
}

impl<O: Copy + PartialEq> ResultCache<O> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn get(&self, key: &CacheKey) -> Option<&Entry<O>> {
        self.entries.get(key)
    }

    /// Mark `key` as being computed by `owner`.
    pub(crate) fn begin(&mut self, key: CacheKey, owner: O) {
        let previous = self.entries.insert(key, Entry::InProgress(owner));
        debug_assert!(previous.is_none(), "cache key started twice");
    }

    /// Store the final outcome of `key`.
    pub(crate) fn resolve(&mut self, key: CacheKey, outcome: Outcome) {
        match self.entries.get(&key) {
            Some(Entry::Resolved(_)) => {}
            _ => {
                self.entries.insert(key, Entry::Resolved(outcome));
            }
        }
    }

    /// Drop an in-progress entry owned by `owner` so a later request
    /// recomputes it. Resolved entries stay.
    pub(crate) fn forget(&mut self, key: &CacheKey, owner: O) {
        if matches!(self.entries.get(key), Some(Entry::InProgress(o)) if *o == owner) {
            self.entries.remove(key);
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
