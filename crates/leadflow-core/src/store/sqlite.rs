//! SQLite implementation of the lead store, shareable between processes.
//!
//! Every worker process opens its own `SqliteStore` on the same file. All
//! mutating operations run under `BEGIN IMMEDIATE`, which takes SQLite's
//! database-wide write lock up front, so concurrent pops, claims and sweeps
//! from any number of processes serialize without lock upgrades. Waiting for
//! the lock is bounded by the busy timeout; past it the operation fails with
//! `StoreUnavailable`.
//!
//! Timestamps are stored as fixed-width RFC 3339 text with nanoseconds, so
//! they compare correctly as strings and round-trip exactly.
//!
//! # Schema
//!
//! ```text
//! cycles       key TEXT PK        -> body (JSON DispatchCycle)
//! leads        id TEXT PK         -> one column per Lead field
//! assignments  id TEXT PK         -> lead_id, consultant_id, kind, assigned_at
//! consultants  id INTEGER PK      -> name, weight, active
//! ```

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use super::{weights_of, ConsultantRegistry, Store, StoreBackend};
use crate::consultant::{Consultant, WeightTable};
use crate::cycle::DispatchCycle;
use crate::error::{unavailable, LeadflowError, Result};
use crate::lead::{AssignmentRecord, Lead, StalenessWindow};
use crate::paths;
use crate::types::{AssignmentKind, ConsultantId, LeadId, LeadStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS cycles (
        key TEXT PRIMARY KEY,
        body TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS leads (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        contact TEXT NOT NULL DEFAULT '',
        status TEXT NOT NULL,
        received_at TEXT NOT NULL,
        last_contact_at TEXT NOT NULL,
        consultant_id INTEGER,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_leads_status ON leads(status);
    CREATE TABLE IF NOT EXISTS assignments (
        id TEXT PRIMARY KEY,
        lead_id TEXT NOT NULL,
        consultant_id INTEGER NOT NULL,
        kind TEXT NOT NULL,
        assigned_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_assignments_time ON assignments(assigned_at, id);
    CREATE TABLE IF NOT EXISTS consultants (
        id INTEGER PRIMARY KEY,
        name TEXT NOT NULL,
        weight INTEGER NOT NULL,
        active INTEGER NOT NULL
    );
";

const LEAD_COLUMNS: &str =
    "id, name, contact, status, received_at, last_contact_at, consultant_id, created_at";

// ---------------------------------------------------------------------------
// Column encoding
// ---------------------------------------------------------------------------

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| unavailable(format!("corrupt timestamp '{raw}': {e}")))
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| unavailable(format!("corrupt id '{raw}': {e}")))
}

fn sql_id(id: ConsultantId) -> i64 {
    id.0 as i64
}

fn parse_kind(raw: &str) -> Result<AssignmentKind> {
    match raw {
        "dispatched" => Ok(AssignmentKind::Dispatched),
        "claimed" => Ok(AssignmentKind::Claimed),
        other => Err(unavailable(format!("unknown assignment kind '{other}'"))),
    }
}

fn count(changed: usize) -> u32 {
    u32::try_from(changed).unwrap_or(u32::MAX)
}

/// A `leads` row as SQLite hands it back, before field parsing.
struct LeadRow {
    id: String,
    name: String,
    contact: String,
    status: String,
    received_at: String,
    last_contact_at: String,
    consultant_id: Option<i64>,
    created_at: String,
}

impl LeadRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            contact: row.get(2)?,
            status: row.get(3)?,
            received_at: row.get(4)?,
            last_contact_at: row.get(5)?,
            consultant_id: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_lead(self) -> Result<Lead> {
        Ok(Lead {
            id: LeadId(parse_uuid(&self.id)?),
            name: self.name,
            contact: self.contact,
            status: self.status.parse()?,
            received_at: parse_ts(&self.received_at)?,
            last_contact_at: parse_ts(&self.last_contact_at)?,
            consultant_id: self.consultant_id.map(|id| ConsultantId(id as u64)),
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

type AssignmentRow = (String, String, i64, String, String);

fn assignment_from_row(row: &Row<'_>) -> rusqlite::Result<AssignmentRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn into_assignment((id, lead_id, consultant_id, kind, assigned_at): AssignmentRow) -> Result<AssignmentRecord> {
    Ok(AssignmentRecord {
        id: parse_uuid(&id)?,
        lead_id: LeadId(parse_uuid(&lead_id)?),
        consultant_id: ConsultantId(consultant_id as u64),
        kind: parse_kind(&kind)?,
        assigned_at: parse_ts(&assigned_at)?,
    })
}

fn fetch_lead(conn: &Connection, id: &str) -> Result<Option<Lead>> {
    let sql = format!("SELECT {LEAD_COLUMNS} FROM leads WHERE id = ?1");
    conn.query_row(&sql, params![id], LeadRow::from_row)
        .optional()
        .map_err(unavailable)?
        .map(LeadRow::into_lead)
        .transpose()
}

fn upsert_lead(conn: &Connection, lead: &Lead) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO leads
             (id, name, contact, status, received_at, last_contact_at, consultant_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            lead.id.to_string(),
            lead.name,
            lead.contact,
            lead.status.as_str(),
            ts(lead.received_at),
            ts(lead.last_contact_at),
            lead.consultant_id.map(sql_id),
            ts(lead.created_at),
        ],
    )
    .map_err(unavailable)?;
    Ok(())
}

fn insert_assignment(conn: &Connection, record: &AssignmentRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO assignments (id, lead_id, consultant_id, kind, assigned_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            record.id.to_string(),
            record.lead_id.to_string(),
            sql_id(record.consultant_id),
            record.kind.as_str(),
            ts(record.assigned_at),
        ],
    )
    .map_err(unavailable)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

/// Lead store on a SQLite file that several processes may open at once.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create the database at `path` in WAL mode and create the
    /// schema if it is missing.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(unavailable)?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        debug!(path = %path.display(), journal_mode = %mode, "opened sqlite lead store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| LeadflowError::StoreUnavailable("sqlite connection lock poisoned".into()))
    }

    /// Run `f` inside `BEGIN IMMEDIATE`, committing only on `Ok`. Dropping
    /// the transaction on the error path rolls it back.
    fn write<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;
        let out = f(&tx)?;
        tx.commit().map_err(unavailable)?;
        Ok(out)
    }

    fn read<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }
}

impl ConsultantRegistry for SqliteStore {
    fn upsert_consultant(&self, consultant: &Consultant) -> Result<()> {
        self.write(|tx| {
            tx.execute(
                "INSERT INTO consultants (id, name, weight, active) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     name = excluded.name,
                     weight = excluded.weight,
                     active = excluded.active",
                params![
                    sql_id(consultant.id),
                    consultant.name,
                    consultant.weight,
                    consultant.active
                ],
            )
            .map_err(unavailable)?;
            Ok(())
        })
    }

    fn get_consultant(&self, id: ConsultantId) -> Result<Option<Consultant>> {
        self.read(|conn| {
            conn.query_row(
                "SELECT id, name, weight, active FROM consultants WHERE id = ?1",
                params![sql_id(id)],
                consultant_from_row,
            )
            .optional()
            .map_err(unavailable)
        })
    }

    fn list_consultants(&self) -> Result<Vec<Consultant>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare("SELECT id, name, weight, active FROM consultants ORDER BY id")
                .map_err(unavailable)?;
            let rows = stmt
                .query_map([], consultant_from_row)
                .map_err(unavailable)?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row.map_err(unavailable)?);
            }
            Ok(result)
        })
    }
}

fn consultant_from_row(row: &Row<'_>) -> rusqlite::Result<Consultant> {
    Ok(Consultant {
        id: ConsultantId(row.get::<_, i64>(0)? as u64),
        name: row.get(1)?,
        weight: row.get(2)?,
        active: row.get(3)?,
    })
}

impl WeightTable for SqliteStore {
    fn list_consultant_weights(&self) -> Result<Vec<(ConsultantId, u32)>> {
        Ok(weights_of(self.list_consultants()?))
    }
}

impl StoreBackend for SqliteStore {
    fn open_at(path: &Path) -> Result<Self> {
        Self::open(path)
    }

    fn default_path(root: &Path) -> PathBuf {
        paths::sqlite_path(root)
    }
}

impl Store for SqliteStore {
    fn update_cycle<T, F>(&self, key: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut DispatchCycle) -> Result<T>,
    {
        self.write(|tx| {
            let body: Option<String> = tx
                .query_row(
                    "SELECT body FROM cycles WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(unavailable)?;
            let mut cycle = match body {
                Some(body) => serde_json::from_str(&body)?,
                None => DispatchCycle::new(key),
            };
            let out = f(&mut cycle)?;
            tx.execute(
                "INSERT INTO cycles (key, body) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET body = excluded.body",
                params![key, serde_json::to_string(&cycle)?],
            )
            .map_err(unavailable)?;
            Ok(out)
        })
    }

    fn read_cycle(&self, key: &str) -> Result<Option<DispatchCycle>> {
        let body: Option<String> = self.read(|conn| {
            conn.query_row(
                "SELECT body FROM cycles WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)
        })?;
        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    fn create_assigned_lead(&self, lead: &Lead, record: &AssignmentRecord) -> Result<()> {
        self.write(|tx| {
            upsert_lead(tx, lead)?;
            insert_assignment(tx, record)
        })
    }

    fn claim_lead(
        &self,
        record: &AssignmentRecord,
        window: &StalenessWindow,
    ) -> Result<Option<Lead>> {
        let lead_id = record.lead_id.to_string();
        let at = ts(record.assigned_at);
        let received_cutoff = ts(window.received_cutoff(record.assigned_at));
        let contact_cutoff = ts(window.contact_cutoff(record.assigned_at));
        self.write(|tx| {
            let changed = tx
                .execute(
                    "UPDATE leads
                        SET consultant_id = ?1,
                            received_at = ?2,
                            last_contact_at = ?2,
                            status = ?3
                      WHERE id = ?4
                        AND status = ?5
                        AND (received_at < ?6 OR last_contact_at < ?7)
                        AND consultant_id IS NOT ?1",
                    params![
                        sql_id(record.consultant_id),
                        at,
                        LeadStatus::Assigned.as_str(),
                        lead_id,
                        LeadStatus::InPool.as_str(),
                        received_cutoff,
                        contact_cutoff,
                    ],
                )
                .map_err(unavailable)?;
            if changed == 0 {
                return Ok(None);
            }
            insert_assignment(tx, record)?;
            fetch_lead(tx, &lead_id)
        })
    }

    fn get_lead(&self, id: LeadId) -> Result<Option<Lead>> {
        self.read(|conn| fetch_lead(conn, &id.to_string()))
    }

    fn put_lead(&self, lead: &Lead) -> Result<()> {
        self.write(|tx| upsert_lead(tx, lead))
    }

    fn list_leads(&self) -> Result<Vec<Lead>> {
        self.read(|conn| {
            let sql = format!("SELECT {LEAD_COLUMNS} FROM leads ORDER BY created_at, id");
            let mut stmt = conn.prepare(&sql).map_err(unavailable)?;
            let rows = stmt
                .query_map([], LeadRow::from_row)
                .map_err(unavailable)?;
            let mut result = Vec::new();
            for row in rows {
                result.push(row.map_err(unavailable)?.into_lead()?);
            }
            Ok(result)
        })
    }

    fn release_lead(&self, id: LeadId) -> Result<bool> {
        self.write(|tx| {
            let changed = tx
                .execute(
                    "UPDATE leads SET status = ?1 WHERE id = ?2 AND status <> ?1",
                    params![LeadStatus::InPool.as_str(), id.to_string()],
                )
                .map_err(unavailable)?;
            Ok(changed > 0)
        })
    }

    fn sweep_stale(&self, window: &StalenessWindow, now: DateTime<Utc>) -> Result<u32> {
        let received_cutoff = ts(window.received_cutoff(now));
        let contact_cutoff = ts(window.contact_cutoff(now));
        self.write(|tx| {
            let changed = tx
                .execute(
                    "UPDATE leads SET status = ?1
                      WHERE status = ?2
                        AND (received_at < ?3 OR last_contact_at < ?4)",
                    params![
                        LeadStatus::InPool.as_str(),
                        LeadStatus::Assigned.as_str(),
                        received_cutoff,
                        contact_cutoff,
                    ],
                )
                .map_err(unavailable)?;
            Ok(count(changed))
        })
    }

    fn touch_lead(&self, id: LeadId, consultant: ConsultantId, at: DateTime<Utc>) -> Result<bool> {
        self.write(|tx| {
            let changed = tx
                .execute(
                    "UPDATE leads SET last_contact_at = ?1
                      WHERE id = ?2 AND status = ?3 AND consultant_id = ?4",
                    params![
                        ts(at),
                        id.to_string(),
                        LeadStatus::Assigned.as_str(),
                        sql_id(consultant),
                    ],
                )
                .map_err(unavailable)?;
            Ok(changed > 0)
        })
    }

    fn list_assignments(&self) -> Result<Vec<AssignmentRecord>> {
        self.read(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, lead_id, consultant_id, kind, assigned_at
                       FROM assignments ORDER BY assigned_at, id",
                )
                .map_err(unavailable)?;
            let rows = stmt
                .query_map([], assignment_from_row)
                .map_err(unavailable)?;
            let mut result = Vec::new();
            for row in rows {
                result.push(into_assignment(row.map_err(unavailable)?)?);
            }
            Ok(result)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
