use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::error::{LeadflowError, Result};
use crate::lead::{AssignmentRecord, Lead, StalenessWindow};
use crate::store::Store;
use crate::types::{ConsultantId, LeadId, LeadStatus};

/// Views and transitions around the public pool.
pub struct PublicPool<S> {
    store: Arc<S>,
    window: StalenessWindow,
}

impl<S> Clone for PublicPool<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            window: self.window,
        }
    }
}

impl<S: Store> PublicPool<S> {
    pub fn new(store: Arc<S>, window: StalenessWindow) -> Self {
        Self { store, window }
    }

    /// Pooled leads that are stale as of `now`, oldest first.
    ///
    /// With `viewer` set, leads the viewer already holds are left out since
    /// the viewer could not claim them anyway.
    pub fn list_claimable(
        &self,
        now: DateTime<Utc>,
        viewer: Option<ConsultantId>,
    ) -> Result<Vec<Lead>> {
        let mut leads: Vec<Lead> = self
            .store
            .list_leads()?
            .into_iter()
            .filter(|lead| match viewer {
                Some(v) => self.window.is_claimable_by(lead, v, now),
                None => {
                    lead.status == LeadStatus::InPool
                        && self.window.is_stale(lead, now)
                }
            })
            .collect();
        leads.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(leads)
    }

    /// Give a lead up to the pool. Returns `false` if it was already pooled.
    pub fn release(&self, lead_id: LeadId) -> Result<bool> {
        if self.store.get_lead(lead_id)?.is_none() {
            return Err(LeadflowError::LeadNotFound(lead_id));
        }
        let changed = self.store.release_lead(lead_id)?;
        if changed {
            info!(lead = %lead_id, "lead released to pool");
        }
        Ok(changed)
    }

    /// Move every neglected assigned lead into the pool.
    pub fn sweep_stale(&self, now: DateTime<Utc>) -> Result<u32> {
        let moved = self.store.sweep_stale(&self.window, now)?;
        if moved > 0 {
            info!(moved, "stale leads swept into pool");
        }
        Ok(moved)
    }

    /// Record a follow-up by the current holder, pushing back staleness.
    pub fn record_contact(
        &self,
        lead_id: LeadId,
        consultant: ConsultantId,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.store.touch_lead(lead_id, consultant, at)
    }

    /// Every lead `consultant` ever received, newest first.
    pub fn assignments_for(&self, consultant: ConsultantId) -> Result<Vec<AssignmentRecord>> {
        let mut records: Vec<AssignmentRecord> = self
            .store
            .list_assignments()?
            .into_iter()
            .filter(|r| r.consultant_id == consultant)
            .collect();
        records.reverse();
        Ok(records)
    }

    /// Leads `consultant` currently holds.
    pub fn holdings_of(&self, consultant: ConsultantId) -> Result<Vec<Lead>> {
        Ok(self
            .store
            .list_leads()?
            .into_iter()
            .filter(|lead| {
                lead.status == LeadStatus::Assigned && lead.is_held_by(consultant)
            })
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
