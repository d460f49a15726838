// 🔒 Period Lock - closed months are read-only
//
// A lock is keyed by calendar month ("YYYY-MM"). While it exists, nothing
// that touches a fact posted inside that month may change: voids,
// allocations, reconciliation matches, transfers. Ingesting new facts is
// still allowed (statements arrive late).

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::info;

use crate::audit;
use crate::db::{self, parsed_col};
use crate::error::{LedgerError, Result};

// ============================================================================
// PERIOD KEY
// ============================================================================

/// Calendar month, rendered as `YYYY-MM`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeriodKey {
    year: i32,
    month: u32,
}

impl PeriodKey {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(LedgerError::validation(format!(
                "period month must be 01-12, got {month}"
            )));
        }
        if !(1..=9999).contains(&year) {
            return Err(LedgerError::validation(format!(
                "period year out of range: {year}"
            )));
        }
        Ok(PeriodKey { year, month })
    }

    pub fn from_datetime(ts: &DateTime<Utc>) -> Self {
        PeriodKey {
            year: ts.year(),
            month: ts.month(),
        }
    }

    pub fn from_date(date: NaiveDate) -> Self {
        PeriodKey {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl fmt::Display for PeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for PeriodKey {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let bad = || LedgerError::validation(format!("period must be YYYY-MM, got '{s}'"));

        let (year, month) = s.split_once('-').ok_or_else(bad)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(bad());
        }
        if !year.bytes().chain(month.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(bad());
        }

        let year: i32 = year.parse().map_err(|_| bad())?;
        let month: u32 = month.parse().map_err(|_| bad())?;
        PeriodKey::new(year, month)
    }
}

impl TryFrom<String> for PeriodKey {
    type Error = LedgerError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PeriodKey> for String {
    fn from(key: PeriodKey) -> Self {
        key.to_string()
    }
}

// ============================================================================
// LOCKS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodLock {
    pub period: PeriodKey,
    pub locked_at: DateTime<Utc>,
    pub locked_by: Option<String>,
    pub note: Option<String>,
}

fn get_lock(conn: &Connection, period: PeriodKey) -> Result<Option<PeriodLock>> {
    let lock = conn
        .query_row(
            "SELECT period, locked_at, locked_by, note FROM period_locks WHERE period = ?1",
            params![period.to_string()],
            |row| {
                Ok(PeriodLock {
                    period: parsed_col(row, 0)?,
                    locked_at: parsed_col(row, 1)?,
                    locked_by: row.get(2)?,
                    note: row.get(3)?,
                })
            },
        )
        .optional()?;

    Ok(lock)
}

/// Lock a month. Locking an already locked month returns the existing lock.
pub fn lock(
    conn: &mut Connection,
    period: PeriodKey,
    locked_by: Option<&str>,
    note: Option<&str>,
) -> Result<PeriodLock> {
    let tx = conn.transaction()?;

    if let Some(existing) = get_lock(&tx, period)? {
        return Ok(existing);
    }

    let lock = PeriodLock {
        period,
        locked_at: db::utc_now(),
        locked_by: locked_by.map(str::to_string),
        note: note.map(str::to_string),
    };

    tx.execute(
        "INSERT INTO period_locks (period, locked_at, locked_by, note) VALUES (?1, ?2, ?3, ?4)",
        params![
            period.to_string(),
            db::timestamp(&lock.locked_at),
            lock.locked_by,
            lock.note,
        ],
    )?;

    audit::insert_event(
        &tx,
        &audit::AuditEvent::new(
            "PeriodLock",
            &period.to_string(),
            "lock",
            Some(json!({ "note": lock.note })),
        )
        .with_actor(locked_by),
    )?;

    tx.commit()?;
    info!(%period, locked_by = ?lock.locked_by, "period locked");

    Ok(lock)
}

/// Remove a lock. Returns whether one existed.
pub fn unlock(conn: &mut Connection, period: PeriodKey) -> Result<bool> {
    let tx = conn.transaction()?;

    let removed = tx.execute(
        "DELETE FROM period_locks WHERE period = ?1",
        params![period.to_string()],
    )?;

    if removed > 0 {
        audit::record(&tx, "PeriodLock", &period.to_string(), "unlock", None)?;
    }

    tx.commit()?;
    if removed > 0 {
        info!(%period, "period unlocked");
    }

    Ok(removed > 0)
}

/// All locks, most recent month first
pub fn list_locks(conn: &Connection) -> Result<Vec<PeriodLock>> {
    let mut stmt = conn.prepare(
        "SELECT period, locked_at, locked_by, note FROM period_locks ORDER BY period DESC",
    )?;

    let locks = stmt
        .query_map([], |row| {
            Ok(PeriodLock {
                period: parsed_col(row, 0)?,
                locked_at: parsed_col(row, 1)?,
                locked_by: row.get(2)?,
                note: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(locks)
}

pub fn is_locked(conn: &Connection, period: PeriodKey) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM period_locks WHERE period = ?1",
            params![period.to_string()],
            |row| row.get(0),
        )
        .optional()?;

    Ok(found.is_some())
}

/// Fail with `PeriodLocked` when `ts` falls into a locked month
pub fn assert_unlocked(conn: &Connection, ts: &DateTime<Utc>) -> Result<()> {
    let period = PeriodKey::from_datetime(ts);
    if is_locked(conn, period)? {
        return Err(LedgerError::PeriodLocked { period });
    }
    Ok(())
}

// ============================================================================
// TESTS
// ============================================================================
