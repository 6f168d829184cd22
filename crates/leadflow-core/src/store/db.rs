//! Persistent storage for the distribution engine using redb.
//!
//! # Table design
//!
//! ```text
//! cycles       &str          -> JSON DispatchCycle   (one row per cycle key)
//! leads        [u8; 16]      -> JSON Lead            (uuid bytes)
//! assignments  [u8; 24]      -> JSON AssignmentRecord
//! consultants  u64           -> JSON Consultant
//! ```
//!
//! Assignment keys are `[ assigned_at_ms: u64 big-endian | record uuid ]`,
//! so a plain forward scan yields records in assignment order.
//!
//! redb admits one write transaction at a time. Every mutating operation
//! runs inside a single write transaction, which makes each of them
//! serializable with respect to every other caller sharing the `LeadDb`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use redb::{Database, ReadTransaction, ReadableTable, TableDefinition, WriteTransaction};
use tracing::warn;
use uuid::Uuid;

use crate::consultant::{Consultant, WeightTable};
use crate::cycle::DispatchCycle;
use crate::error::{unavailable, Result};
use crate::lead::{AssignmentRecord, Lead, StalenessWindow};
use crate::types::{ConsultantId, LeadId, LeadStatus};

use super::{weights_of, ConsultantRegistry, Store, StoreBackend};
use crate::paths;

// ---------------------------------------------------------------------------
// Table definitions
// ---------------------------------------------------------------------------

const CYCLES: TableDefinition<&str, &[u8]> = TableDefinition::new("cycles");
const LEADS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("leads");
const ASSIGNMENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("assignments");
const CONSULTANTS: TableDefinition<u64, &[u8]> = TableDefinition::new("consultants");

// ---------------------------------------------------------------------------
// Key helpers
// ---------------------------------------------------------------------------

fn assignment_key(ts: DateTime<Utc>, id: Uuid) -> [u8; 24] {
    let mut key = [0u8; 24];
    let ms = ts.timestamp_millis().max(0) as u64;
    key[..8].copy_from_slice(&ms.to_be_bytes());
    key[8..].copy_from_slice(id.as_bytes());
    key
}

// ---------------------------------------------------------------------------
// LeadDb
// ---------------------------------------------------------------------------

/// Embedded store for leads, assignment records, dispatch cycles and the
/// consultant weight table.
pub struct LeadDb {
    db: Database,
}

impl LeadDb {
    /// Open or create the redb database at `path`.
    ///
    /// Creates the parent directory and every table if they don't exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(unavailable)?;
        let wt = db.begin_write().map_err(unavailable)?;
        wt.open_table(CYCLES).map_err(unavailable)?;
        wt.open_table(LEADS).map_err(unavailable)?;
        wt.open_table(ASSIGNMENTS).map_err(unavailable)?;
        wt.open_table(CONSULTANTS).map_err(unavailable)?;
        wt.commit().map_err(unavailable)?;
        Ok(Self { db })
    }

    /// Run `f` inside one write transaction, committing only on `Ok`.
    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&WriteTransaction) -> Result<T>,
    {
        let wt = self.db.begin_write().map_err(unavailable)?;
        match f(&wt) {
            Ok(out) => {
                wt.commit().map_err(unavailable)?;
                Ok(out)
            }
            Err(e) => {
                if let Err(abort) = wt.abort() {
                    warn!(error = %abort, "failed to abort write transaction");
                }
                Err(e)
            }
        }
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&ReadTransaction) -> Result<T>,
    {
        let rt = self.db.begin_read().map_err(unavailable)?;
        f(&rt)
    }
}

impl ConsultantRegistry for LeadDb {
    fn upsert_consultant(&self, consultant: &Consultant) -> Result<()> {
        let value = serde_json::to_vec(consultant)?;
        self.write(|wt| {
            let mut table = wt.open_table(CONSULTANTS).map_err(unavailable)?;
            table
                .insert(consultant.id.0, value.as_slice())
                .map_err(unavailable)?;
            Ok(())
        })
    }

    fn get_consultant(&self, id: ConsultantId) -> Result<Option<Consultant>> {
        self.read(|rt| {
            let table = rt.open_table(CONSULTANTS).map_err(unavailable)?;
            match table.get(id.0).map_err(unavailable)? {
                Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
                None => Ok(None),
            }
        })
    }

    fn list_consultants(&self) -> Result<Vec<Consultant>> {
        self.read(|rt| {
            let table = rt.open_table(CONSULTANTS).map_err(unavailable)?;
            let mut result = Vec::new();
            for entry in table.iter().map_err(unavailable)? {
                let (_, v) = entry.map_err(unavailable)?;
                result.push(serde_json::from_slice(v.value())?);
            }
            Ok(result)
        })
    }
}

impl WeightTable for LeadDb {
    fn list_consultant_weights(&self) -> Result<Vec<(ConsultantId, u32)>> {
        Ok(weights_of(self.list_consultants()?))
    }
}

impl StoreBackend for LeadDb {
    fn open_at(path: &Path) -> Result<Self> {
        Self::open(path)
    }

    fn default_path(root: &Path) -> PathBuf {
        paths::db_path(root)
    }
}

impl Store for LeadDb {
    fn update_cycle<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut DispatchCycle) -> Result<T>,
    {
        self.write(|wt| {
            let mut table = wt.open_table(CYCLES).map_err(unavailable)?;
            let mut cycle: DispatchCycle = match table.get(key).map_err(unavailable)? {
                Some(v) => serde_json::from_slice(v.value())?,
                None => DispatchCycle::new(key),
            };
            let out = f(&mut cycle)?;
            let value = serde_json::to_vec(&cycle)?;
            table.insert(key, value.as_slice()).map_err(unavailable)?;
            Ok(out)
        })
    }

    fn read_cycle(&self, key: &str) -> Result<Option<DispatchCycle>> {
        self.read(|rt| {
            let table = rt.open_table(CYCLES).map_err(unavailable)?;
            match table.get(key).map_err(unavailable)? {
                Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
                None => Ok(None),
            }
        })
    }

    fn create_assigned_lead(&self, lead: &Lead, record: &AssignmentRecord) -> Result<()> {
        let lead_value = serde_json::to_vec(lead)?;
        let record_value = serde_json::to_vec(record)?;
        let record_key = assignment_key(record.assigned_at, record.id);
        self.write(|wt| {
            let mut leads = wt.open_table(LEADS).map_err(unavailable)?;
            leads
                .insert(lead.id.as_bytes().as_slice(), lead_value.as_slice())
                .map_err(unavailable)?;
            let mut assignments = wt.open_table(ASSIGNMENTS).map_err(unavailable)?;
            assignments
                .insert(record_key.as_slice(), record_value.as_slice())
                .map_err(unavailable)?;
            Ok(())
        })
    }

    fn claim_lead(
        &self,
        record: &AssignmentRecord,
        window: &StalenessWindow,
    ) -> Result<Option<Lead>> {
        let record_value = serde_json::to_vec(record)?;
        let record_key = assignment_key(record.assigned_at, record.id);
        self.write(|wt| {
            let mut leads = wt.open_table(LEADS).map_err(unavailable)?;
            let key = record.lead_id.as_bytes();
            let current: Option<Lead> = match leads.get(key.as_slice()).map_err(unavailable)? {
                Some(v) => Some(serde_json::from_slice(v.value())?),
                None => None,
            };
            let Some(mut lead) = current else {
                return Ok(None);
            };
            if !window.is_claimable_by(&lead, record.consultant_id, record.assigned_at) {
                return Ok(None);
            }

            lead.assign(record.consultant_id, record.assigned_at);
            let lead_value = serde_json::to_vec(&lead)?;
            leads
                .insert(key.as_slice(), lead_value.as_slice())
                .map_err(unavailable)?;

            let mut assignments = wt.open_table(ASSIGNMENTS).map_err(unavailable)?;
            assignments
                .insert(record_key.as_slice(), record_value.as_slice())
                .map_err(unavailable)?;
            Ok(Some(lead))
        })
    }

    fn get_lead(&self, id: LeadId) -> Result<Option<Lead>> {
        self.read(|rt| {
            let table = rt.open_table(LEADS).map_err(unavailable)?;
            match table.get(id.as_bytes().as_slice()).map_err(unavailable)? {
                Some(v) => Ok(Some(serde_json::from_slice(v.value())?)),
                None => Ok(None),
            }
        })
    }

    fn put_lead(&self, lead: &Lead) -> Result<()> {
        let value = serde_json::to_vec(lead)?;
        self.write(|wt| {
            let mut table = wt.open_table(LEADS).map_err(unavailable)?;
            table
                .insert(lead.id.as_bytes().as_slice(), value.as_slice())
                .map_err(unavailable)?;
            Ok(())
        })
    }

    fn list_leads(&self) -> Result<Vec<Lead>> {
        self.read(|rt| {
            let table = rt.open_table(LEADS).map_err(unavailable)?;
            let mut result: Vec<Lead> = Vec::new();
            for entry in table.iter().map_err(unavailable)? {
                let (_, v) = entry.map_err(unavailable)?;
                result.push(serde_json::from_slice(v.value())?);
            }
            result.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            Ok(result)
        })
    }

    fn release_lead(&self, id: LeadId) -> Result<bool> {
        self.write(|wt| {
            let mut table = wt.open_table(LEADS).map_err(unavailable)?;
            let key = id.as_bytes();
            let current: Option<Lead> = match table.get(key.as_slice()).map_err(unavailable)? {
                Some(v) => Some(serde_json::from_slice(v.value())?),
                None => None,
            };
            match current {
                Some(mut lead) if lead.status != LeadStatus::InPool => {
                    lead.status = LeadStatus::InPool;
                    let value = serde_json::to_vec(&lead)?;
                    table
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(unavailable)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn sweep_stale(&self, window: &StalenessWindow, now: DateTime<Utc>) -> Result<u32> {
        self.write(|wt| {
            let mut table = wt.open_table(LEADS).map_err(unavailable)?;
            let mut stale = Vec::new();
            for entry in table.iter().map_err(unavailable)? {
                let (_, v) = entry.map_err(unavailable)?;
                let lead: Lead = serde_json::from_slice(v.value())?;
                if lead.status == LeadStatus::Assigned && window.is_stale(&lead, now) {
                    stale.push(lead);
                }
            }

            let mut moved = 0u32;
            for mut lead in stale {
                lead.status = LeadStatus::InPool;
                let value = serde_json::to_vec(&lead)?;
                table
                    .insert(lead.id.as_bytes().as_slice(), value.as_slice())
                    .map_err(unavailable)?;
                moved += 1;
            }
            Ok(moved)
        })
    }

    fn touch_lead(&self, id: LeadId, consultant: ConsultantId, at: DateTime<Utc>) -> Result<bool> {
        self.write(|wt| {
            let mut table = wt.open_table(LEADS).map_err(unavailable)?;
            let key = id.as_bytes();
            let current: Option<Lead> = match table.get(key.as_slice()).map_err(unavailable)? {
                Some(v) => Some(serde_json::from_slice(v.value())?),
                None => None,
            };
            match current {
                Some(mut lead)
                    if lead.status == LeadStatus::Assigned && lead.is_held_by(consultant) =>
                {
                    lead.last_contact_at = at;
                    let value = serde_json::to_vec(&lead)?;
                    table
                        .insert(key.as_slice(), value.as_slice())
                        .map_err(unavailable)?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn list_assignments(&self) -> Result<Vec<AssignmentRecord>> {
        self.read(|rt| {
            let table = rt.open_table(ASSIGNMENTS).map_err(unavailable)?;
            let mut result = Vec::new();
            for entry in table.iter().map_err(unavailable)? {
                let (_, v) = entry.map_err(unavailable)?;
                result.push(serde_json::from_slice(v.value())?);
            }
            Ok(result)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
