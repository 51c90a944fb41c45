use std::collections::{HashMap, HashSet};

use crate::k8s::ObjectKey;

/// Bookkeeping of the reconcile passes of a controller.
///
/// At most one pass per key is in flight. Requests for a key which is in flight are coalesced
/// into a single follow-up pass. Each started pass bumps the generation of its key, which
/// invalidates the delayed requeues scheduled by earlier passes.
#[derive(Debug, Default)]
pub struct WorkQueue {
    in_flight: HashSet<ObjectKey>,
    pending: HashSet<ObjectKey>,
    generations: HashMap<ObjectKey, u64>,
}

impl WorkQueue {
    /// Request a pass for the given key, returning `true` if it must be started now.
    pub fn request(&mut self, key: &ObjectKey) -> bool {
        if self.in_flight.contains(key) {
            self.pending.insert(key.clone());
            return false;
        }
        self.start(key);
        true
    }

    /// Record the end of the pass of the given key, returning `true` if a follow-up pass must be
    /// started now.
    pub fn finish(&mut self, key: &ObjectKey) -> bool {
        if self.pending.remove(key) {
            self.start(key);
            return true;
        }
        self.in_flight.remove(key);
        false
    }

    /// The generation of the given key, as of its last started pass.
    pub fn generation(&self, key: &ObjectKey) -> u64 {
        self.generations.get(key).copied().unwrap_or_default()
    }

    /// Whether a requeue scheduled at the given generation is still current.
    pub fn is_current(&self, key: &ObjectKey, generation: u64) -> bool {
        self.generations.get(key) == Some(&generation)
    }

    pub fn is_in_flight(&self, key: &ObjectKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Drop any follow-up pass & outstanding requeue of the given key.
    pub fn forget(&mut self, key: &ObjectKey) {
        self.pending.remove(key);
        self.generations.remove(key);
    }

    fn start(&mut self, key: &ObjectKey) {
        self.in_flight.insert(key.clone());
        *self.generations.entry(key.clone()).or_default() += 1;
    }
}
