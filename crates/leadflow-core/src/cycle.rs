//! The durable dispatch queue.
//!
//! A `DispatchCycle` holds the sequence produced by the last build
//! (`origin_sequence`) and the part of it still waiting to be handed out
//! (`working_sequence`). Every method here is a pure state transition; the
//! store runs them inside a single write transaction so that concurrent
//! callers observe them as atomic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::consultant::WeightTable;
use crate::error::{LeadflowError, Result};
use crate::queue::build_sequence;
use crate::types::ConsultantId;

// ---------------------------------------------------------------------------
// Popped
// ---------------------------------------------------------------------------

/// Result of a successful pop, tagged with how the queue got its head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Popped {
    /// The working sequence already had entries.
    FromExisting(ConsultantId),
    /// The working sequence was drained and refilled from the origin.
    AfterReplenish(ConsultantId),
    /// The sequence was rebuilt from the weight table.
    AfterRebuild(ConsultantId),
}

impl Popped {
    pub fn consultant(self) -> ConsultantId {
        match self {
            Popped::FromExisting(id) | Popped::AfterReplenish(id) | Popped::AfterRebuild(id) => id,
        }
    }
}

// ---------------------------------------------------------------------------
// DispatchCycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchCycle {
    pub key: String,
    #[serde(default)]
    pub origin_sequence: Vec<ConsultantId>,
    #[serde(default)]
    pub working_sequence: VecDeque<ConsultantId>,
    #[serde(default)]
    pub reset_requested: bool,
    #[serde(default)]
    pub built_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchCycle {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            origin_sequence: Vec::new(),
            working_sequence: VecDeque::new(),
            reset_requested: false,
            built_at: None,
            updated_at: Utc::now(),
        }
    }

    /// Hand out the next consultant.
    ///
    /// Drains the working sequence first. Once it is empty, a pending reset
    /// rebuilds from `weights`; otherwise the origin sequence is replayed
    /// without consulting `weights`. A cycle that was never built is built
    /// on first use. On error `self` may be partially modified and must be
    /// discarded by the caller.
    pub fn pop_next(&mut self, weights: &dyn WeightTable) -> Result<Popped> {
        let now = Utc::now();
        self.updated_at = now;

        if let Some(id) = self.working_sequence.pop_front() {
            debug!(cycle = %self.key, consultant = %id, remaining = self.working_sequence.len(), "popped");
            return Ok(Popped::FromExisting(id));
        }

        if self.reset_requested || self.origin_sequence.is_empty() {
            self.rebuild(weights, now)?;
            let id = self.take_front()?;
            return Ok(Popped::AfterRebuild(id));
        }

        self.working_sequence.extend(self.origin_sequence.iter().copied());
        debug!(cycle = %self.key, len = self.origin_sequence.len(), "replenished from origin");
        let id = self.take_front()?;
        Ok(Popped::AfterReplenish(id))
    }

    /// Mark the cycle for a rebuild once the working sequence drains.
    ///
    /// Returns `false` when a reset was already pending.
    pub fn request_reset(&mut self) -> bool {
        self.updated_at = Utc::now();
        if self.reset_requested {
            return false;
        }
        self.reset_requested = true;
        true
    }

    /// Put `consultant` back at the head of the working sequence.
    ///
    /// Only consultants present in the current origin sequence are accepted;
    /// anything else yields `InvalidRollback` and leaves the cycle untouched.
    pub fn rollback(&mut self, consultant: ConsultantId) -> Result<()> {
        if !self.origin_sequence.contains(&consultant) {
            warn!(cycle = %self.key, consultant = %consultant, "rollback for consultant outside the current cycle ignored");
            return Err(LeadflowError::InvalidRollback(consultant));
        }
        self.working_sequence.push_front(consultant);
        self.updated_at = Utc::now();
        debug!(cycle = %self.key, consultant = %consultant, "rolled back to queue front");
        Ok(())
    }

    /// Replace both sequences with a fresh build and clear any pending reset.
    fn rebuild(&mut self, weights: &dyn WeightTable, now: DateTime<Utc>) -> Result<()> {
        let snapshot = weights.list_consultant_weights()?;
        let sequence = build_sequence(&snapshot).map_err(|e| match e {
            LeadflowError::EmptyWeightTable => LeadflowError::NoConsultantsAvailable,
            other => other,
        })?;
        info!(
            cycle = %self.key,
            len = sequence.len(),
            consultants = snapshot.iter().filter(|(_, w)| *w > 0).count(),
            reset = self.reset_requested,
            "rebuilt dispatch cycle"
        );
        self.working_sequence = sequence.iter().copied().collect();
        self.origin_sequence = sequence;
        self.reset_requested = false;
        self.built_at = Some(now);
        Ok(())
    }

    fn take_front(&mut self) -> Result<ConsultantId> {
        self.working_sequence
            .pop_front()
            .ok_or(LeadflowError::NoConsultantsAvailable)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consultant::StaticWeights;

    const A: ConsultantId = ConsultantId(1);
    const B: ConsultantId = ConsultantId(2);
    const C: ConsultantId = ConsultantId(3);

    fn weights(entries: &[(ConsultantId, u32)]) -> StaticWeights {
        StaticWeights::new(entries.iter().copied())
    }

    fn drain(cycle: &mut DispatchCycle, table: &dyn WeightTable, n: usize) -> Vec<ConsultantId> {
        (0..n)
            .map(|_| cycle.pop_next(table).unwrap().consultant())
            .collect()
    }

    #[test]
    fn first_pop_builds_the_cycle() {
        let table = weights(&[(A, 3), (B, 2)]);
        let mut cycle = DispatchCycle::new("default");
        assert_eq!(cycle.pop_next(&table).unwrap(), Popped::AfterRebuild(A));
        assert_eq!(cycle.origin_sequence, vec![A, B, A, B, A]);
        assert_eq!(cycle.working_sequence.len(), 4);
        assert!(cycle.built_at.is_some());
    }

    #[test]
    fn full_cycle_then_verbatim_replay() {
        let table = weights(&[(A, 3), (B, 2)]);
        let mut cycle = DispatchCycle::new("default");
        assert_eq!(drain(&mut cycle, &table, 5), vec![A, B, A, B, A]);

        assert_eq!(cycle.pop_next(&table).unwrap(), Popped::AfterReplenish(A));
        assert_eq!(drain(&mut cycle, &table, 4), vec![B, A, B, A]);
    }

    #[test]
    fn replenish_ignores_weight_changes_without_reset() {
        let mut cycle = DispatchCycle::new("default");
        drain(&mut cycle, &weights(&[(A, 1), (B, 1)]), 2);
        let changed = weights(&[(C, 4)]);
        assert_eq!(drain(&mut cycle, &changed, 2), vec![A, B]);
    }

    #[test]
    fn reset_waits_for_drain() {
        let mut cycle = DispatchCycle::new("default");
        let before = weights(&[(A, 2), (B, 1)]);
        assert_eq!(cycle.pop_next(&before).unwrap().consultant(), A);

        assert!(cycle.request_reset());
        let after = weights(&[(C, 2)]);
        // Remaining B, A drain unchanged.
        assert_eq!(cycle.pop_next(&after).unwrap(), Popped::FromExisting(B));
        assert_eq!(cycle.pop_next(&after).unwrap(), Popped::FromExisting(A));
        // Next pop rebuilds from the table as it is now.
        assert_eq!(cycle.pop_next(&after).unwrap(), Popped::AfterRebuild(C));
        assert!(!cycle.reset_requested);
        assert_eq!(cycle.origin_sequence, vec![C, C]);
    }

    #[test]
    fn request_reset_is_idempotent() {
        let mut cycle = DispatchCycle::new("default");
        assert!(cycle.request_reset());
        assert!(!cycle.request_reset());
        assert!(cycle.reset_requested);
    }

    #[test]
    fn rollback_goes_to_front() {
        let table = weights(&[(A, 3), (B, 2)]);
        let mut cycle = DispatchCycle::new("default");
        let first = cycle.pop_next(&table).unwrap().consultant();
        cycle.rollback(first).unwrap();
        assert_eq!(cycle.pop_next(&table).unwrap(), Popped::FromExisting(first));
        assert_eq!(cycle.origin_sequence, vec![A, B, A, B, A]);
    }

    #[test]
    fn rollback_on_drained_queue_is_popped_next() {
        let table = weights(&[(A, 1), (B, 1)]);
        let mut cycle = DispatchCycle::new("default");
        drain(&mut cycle, &table, 2);
        cycle.rollback(B).unwrap();
        assert_eq!(cycle.pop_next(&table).unwrap(), Popped::FromExisting(B));
    }

    #[test]
    fn rollback_of_unknown_consultant_is_rejected() {
        let table = weights(&[(A, 1)]);
        let mut cycle = DispatchCycle::new("default");
        cycle.pop_next(&table).unwrap();
        let before = cycle.clone();
        let err = cycle.rollback(C).unwrap_err();
        assert!(matches!(err, LeadflowError::InvalidRollback(id) if id == C));
        assert_eq!(cycle.working_sequence, before.working_sequence);
        assert_eq!(cycle.origin_sequence, before.origin_sequence);
    }

    #[test]
    fn rollback_preserves_reset_flag() {
        let table = weights(&[(A, 2)]);
        let mut cycle = DispatchCycle::new("default");
        cycle.pop_next(&table).unwrap();
        cycle.request_reset();
        cycle.rollback(A).unwrap();
        assert!(cycle.reset_requested);
    }

    #[test]
    fn empty_table_is_no_consultants_available() {
        let mut cycle = DispatchCycle::new("default");
        let err = cycle.pop_next(&weights(&[(A, 0), (B, 0)])).unwrap_err();
        assert!(matches!(err, LeadflowError::NoConsultantsAvailable));
    }

    #[test]
    fn cycle_json_roundtrip() {
        let table = weights(&[(A, 2), (B, 1)]);
        let mut cycle = DispatchCycle::new("sales-east");
        cycle.pop_next(&table).unwrap();
        cycle.request_reset();
        let json = serde_json::to_vec(&cycle).unwrap();
        let parsed: DispatchCycle = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed, cycle);
    }
}
