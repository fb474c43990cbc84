use std::collections::HashMap;
use std::collections::hash_map::Entry;

use podtail_types::TargetId;

use crate::tail::Tail;

/// Active tails keyed by container identity.
///
/// Holds at most one tail per identity. Owned by a single reconciler and
/// never shared, so it needs no locking.
#[derive(Debug, Default)]
pub struct Registry {
    tails: HashMap<TargetId, Tail>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &TargetId) -> bool {
        self.tails.contains_key(id)
    }

    pub fn get(&self, id: &TargetId) -> Option<&Tail> {
        self.tails.get(id)
    }

    /// Insert a tail unless its identity is already tracked
    pub fn insert(&mut self, tail: Tail) -> Option<&mut Tail> {
        match self.tails.entry(tail.identity()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => Some(slot.insert(tail)),
        }
    }

    pub fn remove(&mut self, id: &TargetId) -> Option<Tail> {
        self.tails.remove(id)
    }

    /// Drop tails whose stream already ended, freeing their identities.
    /// Returns how many were dropped.
    pub fn sweep_stopped(&mut self) -> usize {
        let before = self.tails.len();
        self.tails.retain(|_, tail| !tail.is_stopped());
        before - self.tails.len()
    }

    pub fn len(&self) -> usize {
        self.tails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tails.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TargetId> {
        self.tails.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tail> {
        self.tails.values()
    }
}
