//! Durable state behind the distribution engine.
//!
//! `Store` is the seam between the engine and whatever holds leads,
//! assignment records and dispatch cycles. Every method is atomic: an
//! implementation must run it as one serializable transaction (or an
//! equivalent compare-and-set), never as separately visible reads and
//! writes.
//!
//! Two implementations ship with the crate:
//!
//! * `LeadDb` (redb): embedded, one owning process, threads share an `Arc`.
//! * `SqliteStore` (SQLite via rusqlite): any number of processes may open
//!   the same file; writes serialize on SQLite's `BEGIN IMMEDIATE` lock.

pub mod db;
pub mod sqlite;

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::consultant::{Consultant, WeightTable};
use crate::cycle::DispatchCycle;
use crate::error::Result;
use crate::lead::{AssignmentRecord, Lead, StalenessWindow};
use crate::types::{ConsultantId, LeadId};

pub use db::LeadDb;
pub use sqlite::SqliteStore;

pub trait Store: Send + Sync {
    /// Load the cycle stored under `key` (or a fresh one), run `f` on it and
    /// persist the result, all in one transaction. Nothing is written when
    /// `f` returns an error.
    fn update_cycle<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut DispatchCycle) -> Result<T>;

    fn read_cycle(&self, key: &str) -> Result<Option<DispatchCycle>>;

    /// Persist a newly dispatched lead together with its assignment record.
    fn create_assigned_lead(&self, lead: &Lead, record: &AssignmentRecord) -> Result<()>;

    /// Conditional update backing a claim.
    ///
    /// Transfers `record.lead_id` to `record.consultant_id` as of
    /// `record.assigned_at` only if the lead is pooled, stale under `window`
    /// and not already held by the claimant, appending `record` in the same
    /// transaction. Returns the lead as committed, or `None` when no row
    /// matched.
    fn claim_lead(
        &self,
        record: &AssignmentRecord,
        window: &StalenessWindow,
    ) -> Result<Option<Lead>>;

    fn get_lead(&self, id: LeadId) -> Result<Option<Lead>>;

    /// Insert or replace a lead record as-is. Intended for intake
    /// collaborators and fixtures; it bypasses every distribution rule.
    fn put_lead(&self, lead: &Lead) -> Result<()>;

    fn list_leads(&self) -> Result<Vec<Lead>>;

    /// Move a `New` or `Assigned` lead into the public pool.
    fn release_lead(&self, id: LeadId) -> Result<bool>;

    /// Move every `Assigned` lead that is stale as of `now` into the pool.
    fn sweep_stale(&self, window: &StalenessWindow, now: DateTime<Utc>) -> Result<u32>;

    /// Record a follow-up; only the current holder may touch a lead.
    fn touch_lead(&self, id: LeadId, consultant: ConsultantId, at: DateTime<Utc>) -> Result<bool>;

    /// All assignment records in ascending `assigned_at` order.
    fn list_assignments(&self) -> Result<Vec<AssignmentRecord>>;
}

/// Durable consultant table that doubles as the dispatch weight source.
pub trait ConsultantRegistry: WeightTable {
    /// Insert or replace a consultant. Callers changing a weight should
    /// follow up with a reset request on the dispatcher.
    fn upsert_consultant(&self, consultant: &Consultant) -> Result<()>;

    fn get_consultant(&self, id: ConsultantId) -> Result<Option<Consultant>>;

    /// All consultants in ascending id order.
    fn list_consultants(&self) -> Result<Vec<Consultant>>;
}

/// A store the engine can open from a project root.
pub trait StoreBackend: Store + ConsultantRegistry + Sized {
    /// Open or create the store at `path`.
    fn open_at(path: &Path) -> Result<Self>;

    /// Where the store lives when the configuration names no path.
    fn default_path(root: &Path) -> PathBuf;
}

/// Shared weight mapping used by every `ConsultantRegistry`.
pub(crate) fn weights_of(consultants: Vec<Consultant>) -> Vec<(ConsultantId, u32)> {
    consultants
        .into_iter()
        .map(|c| (c.id, c.effective_weight()))
        .collect()
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::LeadflowError;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Delegates to `LeadDb` but can be told to fail lead creation or reads.
    pub(crate) struct FaultyStore {
        inner: LeadDb,
        fail_create: AtomicBool,
        fail_get: AtomicBool,
    }

    impl FaultyStore {
        pub(crate) fn open(path: &Path) -> Self {
            Self {
                inner: LeadDb::open(path).unwrap(),
                fail_create: AtomicBool::new(false),
                fail_get: AtomicBool::new(false),
            }
        }

        pub(crate) fn set_fail_create(&self, fail: bool) {
            self.fail_create.store(fail, Ordering::SeqCst);
        }

        pub(crate) fn set_fail_get(&self, fail: bool) {
            self.fail_get.store(fail, Ordering::SeqCst);
        }
    }

    fn connection_reset() -> LeadflowError {
        LeadflowError::StoreUnavailable("connection reset".into())
    }

    impl Store for FaultyStore {
        fn update_cycle<T, F>(&self, key: &str, f: F) -> Result<T>
        where
            F: FnOnce(&mut DispatchCycle) -> Result<T>,
        {
            self.inner.update_cycle(key, f)
        }

        fn read_cycle(&self, key: &str) -> Result<Option<DispatchCycle>> {
            self.inner.read_cycle(key)
        }

        fn create_assigned_lead(&self, lead: &Lead, record: &AssignmentRecord) -> Result<()> {
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(connection_reset());
            }
            self.inner.create_assigned_lead(lead, record)
        }

        fn claim_lead(
            &self,
            record: &AssignmentRecord,
            window: &StalenessWindow,
        ) -> Result<Option<Lead>> {
            self.inner.claim_lead(record, window)
        }

        fn get_lead(&self, id: LeadId) -> Result<Option<Lead>> {
            if self.fail_get.load(Ordering::SeqCst) {
                return Err(connection_reset());
            }
            self.inner.get_lead(id)
        }

        fn put_lead(&self, lead: &Lead) -> Result<()> {
            self.inner.put_lead(lead)
        }

        fn list_leads(&self) -> Result<Vec<Lead>> {
            self.inner.list_leads()
        }

        fn release_lead(&self, id: LeadId) -> Result<bool> {
            self.inner.release_lead(id)
        }

        fn sweep_stale(&self, window: &StalenessWindow, now: DateTime<Utc>) -> Result<u32> {
            self.inner.sweep_stale(window, now)
        }

        fn touch_lead(&self, id: LeadId, consultant: ConsultantId, at: DateTime<Utc>) -> Result<bool> {
            self.inner.touch_lead(id, consultant, at)
        }

        fn list_assignments(&self) -> Result<Vec<AssignmentRecord>> {
            self.inner.list_assignments()
        }
    }
}
