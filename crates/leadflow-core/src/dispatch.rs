use std::sync::Arc;
use tracing::info;

use crate::consultant::{Consultant, WeightTable};
use crate::cycle::{DispatchCycle, Popped};
use crate::error::Result;
use crate::paths;
use crate::store::{ConsultantRegistry, Store};
use crate::types::ConsultantId;

/// Atomic access to one dispatch cycle.
///
/// Each method is a single store transaction over the cycle record, so any
/// number of `Dispatcher` clones, on any number of threads, can share a
/// store without handing out the same queue slot twice.
pub struct Dispatcher<S, W> {
    store: Arc<S>,
    weights: Arc<W>,
    key: String,
}

impl<S, W> Clone for Dispatcher<S, W> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            weights: Arc::clone(&self.weights),
            key: self.key.clone(),
        }
    }
}

impl<S: Store, W: WeightTable> Dispatcher<S, W> {
    pub fn new(store: Arc<S>, weights: Arc<W>) -> Self {
        Self {
            store,
            weights,
            key: paths::DEFAULT_CYCLE_KEY.to_string(),
        }
    }

    /// Use the cycle stored under `key` instead of the default one.
    pub fn with_cycle_key(mut self, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        paths::validate_cycle_key(&key)?;
        self.key = key;
        Ok(self)
    }

    pub fn cycle_key(&self) -> &str {
        &self.key
    }

    /// Pop the consultant who receives the next lead.
    ///
    /// Fails with `NoConsultantsAvailable` when the weight table has no
    /// capacity and the queue is empty; in that case nothing is written.
    pub fn pop_next(&self) -> Result<Popped> {
        let weights: &dyn WeightTable = self.weights.as_ref();
        self.store
            .update_cycle(&self.key, |cycle| cycle.pop_next(weights))
    }

    /// Ask for a rebuild from the weight table once the current cycle drains.
    pub fn request_reset(&self) -> Result<()> {
        let fresh = self
            .store
            .update_cycle(&self.key, |cycle| Ok(cycle.request_reset()))?;
        if fresh {
            info!(cycle = %self.key, "dispatch cycle reset requested");
        }
        Ok(())
    }

    /// Return `consultant` to the head of the queue after a failed
    /// lead-creation transaction.
    ///
    /// `InvalidRollback` means the consultant is not part of the current
    /// cycle; the queue is left untouched.
    pub fn rollback(&self, consultant: ConsultantId) -> Result<()> {
        self.store
            .update_cycle(&self.key, |cycle| cycle.rollback(consultant))
    }

    /// Current persisted state of the cycle, if it was ever touched.
    pub fn snapshot(&self) -> Result<Option<DispatchCycle>> {
        self.store.read_cycle(&self.key)
    }
}

impl<S: Store, W: ConsultantRegistry> Dispatcher<S, W> {
    /// Store a consultant's new weight or activity flag and schedule the
    /// rebuild that picks it up.
    pub fn update_consultant(&self, consultant: &Consultant) -> Result<()> {
        self.weights.upsert_consultant(consultant)?;
        self.request_reset()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
