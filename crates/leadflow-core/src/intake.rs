use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::consultant::WeightTable;
use crate::dispatch::Dispatcher;
use crate::error::{LeadflowError, Result};
use crate::lead::{AssignmentRecord, Lead, NewLead};
use crate::notify::Notifiers;
use crate::store::Store;
use crate::types::AssignmentKind;

/// Accepts new leads and hands each one to the next consultant in the
/// dispatch cycle.
pub struct LeadIntake<S, W> {
    dispatcher: Dispatcher<S, W>,
    store: Arc<S>,
    notifiers: Arc<Notifiers>,
}

impl<S, W> Clone for LeadIntake<S, W> {
    fn clone(&self) -> Self {
        Self {
            dispatcher: self.dispatcher.clone(),
            store: Arc::clone(&self.store),
            notifiers: Arc::clone(&self.notifiers),
        }
    }
}

impl<S: Store, W: WeightTable> LeadIntake<S, W> {
    pub fn new(dispatcher: Dispatcher<S, W>, store: Arc<S>) -> Self {
        Self {
            dispatcher,
            store,
            notifiers: Arc::new(Notifiers::new()),
        }
    }

    pub fn with_notifiers(mut self, notifiers: Arc<Notifiers>) -> Self {
        self.notifiers = notifiers;
        self
    }

    pub fn dispatcher(&self) -> &Dispatcher<S, W> {
        &self.dispatcher
    }

    /// Create `new_lead` already assigned to the next consultant.
    ///
    /// If persisting the lead fails after a consultant was popped, that
    /// consultant is pushed back to the head of the queue before the error
    /// is returned, so no capacity is lost.
    pub fn submit(&self, new_lead: NewLead) -> Result<Lead> {
        let consultant = self.dispatcher.pop_next()?.consultant();

        let now = Utc::now();
        let mut lead = new_lead.into_lead();
        lead.assign(consultant, now);
        let record = AssignmentRecord::new(lead.id, consultant, AssignmentKind::Dispatched, now);

        if let Err(e) = self.store.create_assigned_lead(&lead, &record) {
            error!(consultant = %consultant, error = %e, "lead creation failed, rolling back dispatch");
            match self.dispatcher.rollback(consultant) {
                Ok(()) => {}
                Err(LeadflowError::InvalidRollback(id)) => {
                    warn!(consultant = %id, "rollback target no longer in cycle");
                }
                Err(rollback_err) => {
                    error!(consultant = %consultant, error = %rollback_err, "rollback failed");
                }
            }
            return Err(e);
        }

        info!(lead = %lead.id, consultant = %consultant, "lead dispatched");
        self.notifiers.dispatch(&lead, &record);
        Ok(lead)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consultant::StaticWeights;
    use crate::cycle::Popped;
    use crate::notify::testing::Recorder;
    use crate::store::testing::FaultyStore;
    use crate::types::{ConsultantId, LeadStatus};
    use tempfile::TempDir;

    const A: ConsultantId = ConsultantId(1);
    const B: ConsultantId = ConsultantId(2);

    fn setup(weights: &[(ConsultantId, u32)]) -> (TempDir, Arc<FaultyStore>, LeadIntake<FaultyStore, StaticWeights>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FaultyStore::open(&dir.path().join("intake.redb")));
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(StaticWeights::new(weights.iter().copied())),
        );
        let intake = LeadIntake::new(dispatcher, Arc::clone(&store));
        (dir, store, intake)
    }

    #[test]
    fn submit_assigns_in_cycle_order() {
        let (_dir, store, intake) = setup(&[(A, 2), (B, 1)]);
        let holders: Vec<_> = (0..3)
            .map(|i| {
                intake
                    .submit(NewLead::new(format!("lead {i}"), ""))
                    .unwrap()
                    .consultant_id
                    .unwrap()
            })
            .collect();
        assert_eq!(holders, vec![A, B, A]);

        let leads = store.list_leads().unwrap();
        assert_eq!(leads.len(), 3);
        assert!(leads.iter().all(|l| l.status == LeadStatus::Assigned));
        let records = store.list_assignments().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|r| r.kind == AssignmentKind::Dispatched));
    }

    #[test]
    fn failed_creation_rolls_back_popped_consultant() {
        let (_dir, store, intake) = setup(&[(A, 2), (B, 1)]);
        intake.submit(NewLead::new("first", "")).unwrap();

        store.set_fail_create(true);
        let err = intake.submit(NewLead::new("second", "")).unwrap_err();
        assert!(err.is_transient());
        assert!(store.list_leads().unwrap().len() == 1);

        // B was popped for the failed lead and must be next again.
        assert_eq!(intake.dispatcher().pop_next().unwrap(), Popped::FromExisting(B));
    }

    #[test]
    fn retry_after_failure_lands_on_same_consultant() {
        let (_dir, store, intake) = setup(&[(A, 1), (B, 1)]);
        store.set_fail_create(true);
        assert!(intake.submit(NewLead::new("x", "")).is_err());

        store.set_fail_create(false);
        let lead = intake.submit(NewLead::new("x", "")).unwrap();
        assert_eq!(lead.consultant_id, Some(A));
    }

    #[test]
    fn no_capacity_creates_nothing() {
        let (_dir, store, intake) = setup(&[(A, 0)]);
        let err = intake.submit(NewLead::new("orphan", "")).unwrap_err();
        assert!(matches!(err, LeadflowError::NoConsultantsAvailable));
        assert!(store.list_leads().unwrap().is_empty());
    }

    #[test]
    fn notifier_failure_keeps_lead() {
        let (_dir, store, intake) = setup(&[(A, 1)]);
        let recorder = Recorder::failing();
        let intake = intake.with_notifiers(Arc::new(Notifiers::new().with(recorder.clone())));

        let lead = intake.submit(NewLead::new("Lu", "lu@example.com")).unwrap();
        assert_eq!(recorder.count(), 1);
        assert!(store.get_lead(lead.id).unwrap().is_some());
    }
}
