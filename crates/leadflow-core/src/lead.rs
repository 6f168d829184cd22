//! Lead data model.
//!
//! A `Lead` is a sales prospect held by at most one consultant at a time.
//! Every transfer of a lead to a consultant, whether by dispatch or by claim,
//! appends an `AssignmentRecord`. Records are never mutated.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::time::Duration;
use uuid::Uuid;

use crate::types::{AssignmentKind, ConsultantId, LeadId, LeadStatus};

// ---------------------------------------------------------------------------
// Lead
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub name: String,
    /// Free-form contact handle (phone, email, messenger id).
    #[serde(default)]
    pub contact: String,
    pub status: LeadStatus,
    /// When the current holder received the lead.
    pub received_at: DateTime<Utc>,
    /// Last recorded follow-up by the current holder.
    pub last_contact_at: DateTime<Utc>,
    pub consultant_id: Option<ConsultantId>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    /// A lead fresh from intake, not yet held by anyone.
    pub fn new(name: impl Into<String>, contact: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: LeadId::new(),
            name: name.into(),
            contact: contact.into(),
            status: LeadStatus::New,
            received_at: now,
            last_contact_at: now,
            consultant_id: None,
            created_at: now,
        }
    }

    /// Hand the lead to `consultant` as of `at`.
    pub fn assign(&mut self, consultant: ConsultantId, at: DateTime<Utc>) {
        self.consultant_id = Some(consultant);
        self.received_at = at;
        self.last_contact_at = at;
        self.status = LeadStatus::Assigned;
    }

    pub fn is_held_by(&self, consultant: ConsultantId) -> bool {
        self.consultant_id == Some(consultant)
    }
}

/// Intake payload for a lead that is about to be dispatched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewLead {
    pub name: String,
    #[serde(default)]
    pub contact: String,
}

impl NewLead {
    pub fn new(name: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            contact: contact.into(),
        }
    }

    pub fn into_lead(self) -> Lead {
        Lead::new(self.name, self.contact)
    }
}

// ---------------------------------------------------------------------------
// AssignmentRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: Uuid,
    pub lead_id: LeadId,
    pub consultant_id: ConsultantId,
    pub kind: AssignmentKind,
    pub assigned_at: DateTime<Utc>,
}

impl AssignmentRecord {
    pub fn new(
        lead_id: LeadId,
        consultant_id: ConsultantId,
        kind: AssignmentKind,
        assigned_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            lead_id,
            consultant_id,
            kind,
            assigned_at,
        }
    }
}

// ---------------------------------------------------------------------------
// StalenessWindow
// ---------------------------------------------------------------------------

/// Durations after which a held lead is considered neglected.
///
/// A lead is stale once either window has elapsed: the holder received it
/// more than `received_after` ago, or last contacted it more than
/// `contact_after` ago.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessWindow {
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration",
        default = "default_received_after"
    )]
    pub received_after: Duration,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration",
        default = "default_contact_after"
    )]
    pub contact_after: Duration,
}

const DAY_SECS: u64 = 24 * 60 * 60;

fn default_received_after() -> Duration {
    Duration::from_secs(15 * DAY_SECS)
}

fn default_contact_after() -> Duration {
    Duration::from_secs(3 * DAY_SECS)
}

impl Default for StalenessWindow {
    fn default() -> Self {
        Self {
            received_after: default_received_after(),
            contact_after: default_contact_after(),
        }
    }
}

impl StalenessWindow {
    pub fn new(received_after: Duration, contact_after: Duration) -> Self {
        Self {
            received_after,
            contact_after,
        }
    }

    pub fn is_stale(&self, lead: &Lead, now: DateTime<Utc>) -> bool {
        lead.received_at < self.received_cutoff(now)
            || lead.last_contact_at < self.contact_cutoff(now)
    }

    /// Leads received strictly before this instant are stale as of `now`.
    pub fn received_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.received_after)
    }

    /// Leads last contacted strictly before this instant are stale as of `now`.
    pub fn contact_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        cutoff(now, self.contact_after)
    }

    /// The claim predicate: pooled, stale, and not already held by `claimant`.
    pub fn is_claimable_by(&self, lead: &Lead, claimant: ConsultantId, now: DateTime<Utc>) -> bool {
        lead.status == LeadStatus::InPool
            && self.is_stale(lead, now)
            && !lead.is_held_by(claimant)
    }
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| now.checked_sub_signed(delta))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

// ---------------------------------------------------------------------------
// Serde helpers for Duration (serialized as seconds: u64)
// ---------------------------------------------------------------------------

fn serialize_duration<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    s.serialize_u64(d.as_secs())
}

fn deserialize_duration<'de, D>(d: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = u64::deserialize(d)?;
    Ok(Duration::from_secs(secs))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
