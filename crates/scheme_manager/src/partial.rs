//! Synthetic partial-signal id allocation.
//!
//! A partial signal is a (base complex signal, path) pair. Every scheme
//! referencing the same pair must end up with the same synthetic id, and the
//! ids must be stable across extraction runs within one manifest epoch, so
//! the dictionary and the inspection matrix agree on them.

use std::collections::HashMap;

use contracts::{SignalId, SignalPath, SyncId};

#[derive(Debug, Default)]
pub struct PartialSignalRegistry {
    epoch: SyncId,
    by_pair: HashMap<(SignalId, SignalPath), SignalId>,
    next_offset: u32,
}

impl PartialSignalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new manifest epoch, dropping all allocations if the manifest
    /// id actually changed.
    pub fn reset_epoch(&mut self, manifest_id: &SyncId) {
        if &self.epoch != manifest_id {
            self.epoch = manifest_id.clone();
            self.by_pair.clear();
            self.next_offset = 0;
        }
    }

    /// Canonical synthetic id for a (base signal, path) pair, allocating on
    /// first sight.
    pub fn resolve(&mut self, base: SignalId, path: &SignalPath) -> SignalId {
        if let Some(id) = self.by_pair.get(&(base, path.clone())) {
            return *id;
        }
        let id = SignalId(SignalId::SYNTHETIC_BIT | self.next_offset);
        self.next_offset += 1;
        self.by_pair.insert((base, path.clone()), id);
        id
    }

    pub fn len(&self) -> usize {
        self.by_pair.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pair.is_empty()
    }
}
