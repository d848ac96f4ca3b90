//! Worker registry and round-robin cursor

use std::collections::HashSet;

use crate::types::WorkerIdentity;

/// Insertion-ordered, append-only set of registered workers
///
/// Owned by the router task; nothing else mutates it. The next target is
/// `workers[dispatch_count % workers.len()]`, so fairness holds over every
/// complete cycle of the current registry size.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<WorkerIdentity>,
    known: HashSet<WorkerIdentity>,
    dispatch_count: u64,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a worker; returns `false` if it was already registered
    pub fn register(&mut self, identity: WorkerIdentity) -> bool {
        if !self.known.insert(identity.clone()) {
            return false;
        }
        self.workers.push(identity);
        true
    }

    pub fn contains(&self, identity: &WorkerIdentity) -> bool {
        self.known.contains(identity)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Workers in registration order
    pub fn workers(&self) -> &[WorkerIdentity] {
        &self.workers
    }

    /// Dispatches assigned so far
    pub fn dispatch_count(&self) -> u64 {
        self.dispatch_count
    }

    /// Pick the next target and advance the cursor
    pub fn next_target(&mut self) -> Option<WorkerIdentity> {
        if self.workers.is_empty() {
            return None;
        }
        let index = (self.dispatch_count % self.workers.len() as u64) as usize;
        self.dispatch_count += 1;
        Some(self.workers[index].clone())
    }
}
