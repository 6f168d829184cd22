//! First-come-first-served acquisition of stale pooled leads.
//!
//! A claim is a single conditional update in the store. Losing a race is an
//! ordinary outcome (`ClaimOutcome::AlreadyClaimed`), not an error.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::Result;
use crate::lead::{AssignmentRecord, StalenessWindow};
use crate::notify::Notifiers;
use crate::store::Store;
use crate::types::{AssignmentKind, ConsultantId, LeadId};

#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    /// The caller now holds the lead; the audit record is included.
    Claimed(AssignmentRecord),
    /// Someone else got there first, or the lead was not eligible.
    AlreadyClaimed,
}

impl ClaimOutcome {
    pub fn is_claimed(&self) -> bool {
        matches!(self, ClaimOutcome::Claimed(_))
    }
}

pub struct ClaimArbiter<S> {
    store: Arc<S>,
    window: StalenessWindow,
    notifiers: Arc<Notifiers>,
}

impl<S> Clone for ClaimArbiter<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            window: self.window,
            notifiers: Arc::clone(&self.notifiers),
        }
    }
}

impl<S: Store> ClaimArbiter<S> {
    pub fn new(store: Arc<S>, window: StalenessWindow) -> Self {
        Self {
            store,
            window,
            notifiers: Arc::new(Notifiers::new()),
        }
    }

    pub fn with_notifiers(mut self, notifiers: Arc<Notifiers>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn window(&self) -> &StalenessWindow {
        &self.window
    }

    pub fn claim(&self, lead_id: LeadId, consultant: ConsultantId) -> Result<ClaimOutcome> {
        self.claim_at(lead_id, consultant, Utc::now())
    }

    /// Claim as of `now`; staleness is judged against this instant.
    pub fn claim_at(
        &self,
        lead_id: LeadId,
        consultant: ConsultantId,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let record = AssignmentRecord::new(lead_id, consultant, AssignmentKind::Claimed, now);
        let Some(lead) = self.store.claim_lead(&record, &self.window)? else {
            debug!(lead = %lead_id, consultant = %consultant, "claim lost or lead not eligible");
            return Ok(ClaimOutcome::AlreadyClaimed);
        };

        info!(lead = %lead_id, consultant = %consultant, "lead claimed from pool");
        self.notifiers.dispatch(&lead, &record);
        Ok(ClaimOutcome::Claimed(record))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lead::Lead;
    use crate::notify::testing::Recorder;
    use crate::store::testing::FaultyStore;
    use crate::store::LeadDb;
    use crate::types::LeadStatus;
    use chrono::Duration as CDur;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<LeadDb>) {
        let dir = TempDir::new().unwrap();
        let db = LeadDb::open(&dir.path().join("claim.redb")).unwrap();
        (dir, Arc::new(db))
    }

    fn stale_lead(holder: Option<u64>) -> Lead {
        let mut lead = Lead::new("Yang", "yang@example.com");
        let then = Utc::now() - CDur::days(20);
        lead.status = LeadStatus::InPool;
        lead.consultant_id = holder.map(ConsultantId);
        lead.received_at = then;
        lead.last_contact_at = then;
        lead
    }

    fn stale_pooled(db: &LeadDb, holder: Option<u64>) -> Lead {
        let lead = stale_lead(holder);
        db.put_lead(&lead).unwrap();
        lead
    }

    #[test]
    fn claim_transfers_lead_and_records_it() {
        let (_dir, db) = setup();
        let lead = stale_pooled(&db, Some(1));
        let arbiter = ClaimArbiter::new(Arc::clone(&db), StalenessWindow::default());

        let outcome = arbiter.claim(lead.id, ConsultantId(35)).unwrap();
        let ClaimOutcome::Claimed(record) = outcome else {
            panic!("expected Claimed, got {outcome:?}");
        };
        assert_eq!(record.kind, AssignmentKind::Claimed);
        assert_eq!(record.consultant_id, ConsultantId(35));

        let stored = db.get_lead(lead.id).unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Assigned);
        assert_eq!(stored.consultant_id, Some(ConsultantId(35)));
        assert_eq!(stored.received_at, record.assigned_at);
        assert_eq!(db.list_assignments().unwrap(), vec![record]);
    }

    #[test]
    fn second_claim_is_already_claimed() {
        let (_dir, db) = setup();
        let lead = stale_pooled(&db, None);
        let arbiter = ClaimArbiter::new(Arc::clone(&db), StalenessWindow::default());

        assert!(arbiter.claim(lead.id, ConsultantId(2)).unwrap().is_claimed());
        assert_eq!(
            arbiter.claim(lead.id, ConsultantId(3)).unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(db.list_assignments().unwrap().len(), 1);
    }

    #[test]
    fn previous_holder_cannot_reclaim() {
        let (_dir, db) = setup();
        let lead = stale_pooled(&db, Some(7));
        let arbiter = ClaimArbiter::new(Arc::clone(&db), StalenessWindow::default());
        assert_eq!(
            arbiter.claim(lead.id, ConsultantId(7)).unwrap(),
            ClaimOutcome::AlreadyClaimed
        );
        assert_eq!(db.get_lead(lead.id).unwrap().unwrap().status, LeadStatus::InPool);
    }

    #[test]
    fn staleness_is_judged_at_claim_time() {
        let (_dir, db) = setup();
        let mut lead = Lead::new("Xu", "");
        let now = Utc::now();
        lead.status = LeadStatus::InPool;
        lead.received_at = now;
        lead.last_contact_at = now;
        db.put_lead(&lead).unwrap();
        let arbiter = ClaimArbiter::new(Arc::clone(&db), StalenessWindow::default());

        assert!(!arbiter.claim_at(lead.id, ConsultantId(2), now).unwrap().is_claimed());
        let later = now + CDur::days(4);
        assert!(arbiter.claim_at(lead.id, ConsultantId(2), later).unwrap().is_claimed());
    }

    #[test]
    fn notifier_runs_only_on_success() {
        let (_dir, db) = setup();
        let lead = stale_pooled(&db, None);
        let recorder = Recorder::default();
        let arbiter = ClaimArbiter::new(Arc::clone(&db), StalenessWindow::default())
            .with_notifiers(Arc::new(Notifiers::new().with(recorder.clone())));

        arbiter.claim(lead.id, ConsultantId(2)).unwrap();
        arbiter.claim(lead.id, ConsultantId(3)).unwrap();
        assert_eq!(recorder.count(), 1);
    }

    #[test]
    fn failing_notifier_keeps_claim() {
        let (_dir, db) = setup();
        let lead = stale_pooled(&db, None);
        let arbiter = ClaimArbiter::new(Arc::clone(&db), StalenessWindow::default())
            .with_notifiers(Arc::new(Notifiers::new().with(Recorder::failing())));

        assert!(arbiter.claim(lead.id, ConsultantId(2)).unwrap().is_claimed());
        assert_eq!(
            db.get_lead(lead.id).unwrap().unwrap().consultant_id,
            Some(ConsultantId(2))
        );
    }

    #[test]
    fn committed_claim_survives_failing_reads() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::open(&dir.path().join("claim.redb")));
        let lead = stale_lead(None);
        store.put_lead(&lead).unwrap();
        let recorder = Recorder::default();
        let arbiter = ClaimArbiter::new(Arc::clone(&store), StalenessWindow::default())
            .with_notifiers(Arc::new(Notifiers::new().with(recorder.clone())));

        store.set_fail_get(true);
        let outcome = arbiter.claim(lead.id, ConsultantId(4)).unwrap();
        assert!(outcome.is_claimed());
        assert_eq!(recorder.count(), 1);

        store.set_fail_get(false);
        let stored = store.get_lead(lead.id).unwrap().unwrap();
        assert_eq!(stored.status, LeadStatus::Assigned);
        assert_eq!(stored.consultant_id, Some(ConsultantId(4)));
    }
}
