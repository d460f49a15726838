// 🗄️ Storage - SQLite schema, triggers and row helpers
//
// Every ledger table lives in one SQLite database. The uniqueness
// constraints below are load-bearing: anti-duplication of facts and of
// reconciliation matches relies on them, not on pre-checks alone.

use chrono::{DateTime, NaiveDate, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{LedgerError, Result};

/// Message raised by the immutability triggers (matched when mapping errors)
pub(crate) const IMMUTABLE_MARKER: &str = "money operation facts are immutable";

/// Open (or create) a ledger database file and make sure the schema exists
pub fn open<P: AsRef<Path>>(path: P) -> Result<Connection> {
    let conn = Connection::open(path.as_ref())?;
    setup_database(&conn)?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection) -> Result<()> {
    // Enable WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    // ==========================================================================
    // Accounts & categories
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS money_accounts (
            id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL UNIQUE,
            currency TEXT NOT NULL,
            external_ref TEXT,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            name_key TEXT NOT NULL,
            category_type TEXT NOT NULL,
            parent_id TEXT REFERENCES categories(id),
            is_tax_related INTEGER NOT NULL DEFAULT 0,
            is_payroll_related INTEGER NOT NULL DEFAULT 0,
            is_system INTEGER NOT NULL DEFAULT 0,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (category_type, name_key)
        );",
    )?;

    // ==========================================================================
    // Facts (immutable except is_void / void_reason)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS money_operations (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES money_accounts(id),
            transfer_group_id TEXT,
            posted_at TEXT NOT NULL,
            amount TEXT NOT NULL,
            currency TEXT NOT NULL,
            counterparty TEXT,
            description TEXT,
            operation_kind TEXT NOT NULL,
            external_id TEXT,
            source TEXT NOT NULL,
            raw_payload TEXT,
            fingerprint TEXT NOT NULL,
            is_void INTEGER NOT NULL DEFAULT 0,
            void_reason TEXT,
            created_at TEXT NOT NULL,
            UNIQUE (source, account_id, external_id)
        );

        CREATE UNIQUE INDEX IF NOT EXISTS uq_moneyop_fingerprint
            ON money_operations(fingerprint) WHERE external_id IS NULL;

        CREATE TRIGGER IF NOT EXISTS trg_moneyop_immutable
        BEFORE UPDATE ON money_operations
        FOR EACH ROW
        WHEN NEW.id IS NOT OLD.id
            OR NEW.account_id IS NOT OLD.account_id
            OR NEW.transfer_group_id IS NOT OLD.transfer_group_id
            OR NEW.posted_at IS NOT OLD.posted_at
            OR NEW.amount IS NOT OLD.amount
            OR NEW.currency IS NOT OLD.currency
            OR NEW.counterparty IS NOT OLD.counterparty
            OR NEW.description IS NOT OLD.description
            OR NEW.operation_kind IS NOT OLD.operation_kind
            OR NEW.external_id IS NOT OLD.external_id
            OR NEW.source IS NOT OLD.source
            OR NEW.raw_payload IS NOT OLD.raw_payload
            OR NEW.fingerprint IS NOT OLD.fingerprint
            OR NEW.created_at IS NOT OLD.created_at
            OR (OLD.is_void = 1 AND NEW.is_void = 0)
        BEGIN
            SELECT RAISE(ABORT, 'money operation facts are immutable');
        END;

        CREATE TRIGGER IF NOT EXISTS trg_moneyop_no_delete
        BEFORE DELETE ON money_operations
        FOR EACH ROW
        BEGIN
            SELECT RAISE(ABORT, 'money operation facts are immutable');
        END;",
    )?;

    // ==========================================================================
    // Interpretation: rules, allocations, locks, matches
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS money_rules (
            id TEXT PRIMARY KEY,
            name TEXT,
            match_field TEXT NOT NULL,
            pattern TEXT NOT NULL,
            direction TEXT NOT NULL,
            account_id TEXT REFERENCES money_accounts(id),
            category_id TEXT NOT NULL REFERENCES categories(id),
            confidence REAL NOT NULL,
            priority INTEGER NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS money_allocations (
            id TEXT PRIMARY KEY,
            money_operation_id TEXT NOT NULL REFERENCES money_operations(id),
            category_id TEXT NOT NULL REFERENCES categories(id),
            amount_part TEXT NOT NULL,
            linked_entity_type TEXT,
            linked_entity_id TEXT,
            method TEXT NOT NULL,
            confidence REAL,
            confirmed INTEGER NOT NULL DEFAULT 0,
            note TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS period_locks (
            period TEXT PRIMARY KEY,
            locked_at TEXT NOT NULL,
            locked_by TEXT,
            note TEXT
        );

        CREATE TABLE IF NOT EXISTS reconciliation_matches (
            id TEXT PRIMARY KEY,
            money_operation_id TEXT NOT NULL REFERENCES money_operations(id),
            right_type TEXT NOT NULL,
            right_id TEXT NOT NULL,
            method TEXT NOT NULL,
            score REAL,
            status TEXT NOT NULL,
            note TEXT,
            created_at TEXT NOT NULL,
            confirmed_at TEXT,
            UNIQUE (money_operation_id, right_type, right_id)
        );",
    )?;

    // ==========================================================================
    // Audit trail (append-only)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS audit_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            changed_fields TEXT,
            actor TEXT
        );",
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_moneyop_posted_at ON money_operations(posted_at);
        CREATE INDEX IF NOT EXISTS idx_moneyop_account_posted ON money_operations(account_id, posted_at);
        CREATE INDEX IF NOT EXISTS idx_moneyop_transfer_group ON money_operations(transfer_group_id);
        CREATE INDEX IF NOT EXISTS idx_category_parent ON categories(parent_id);
        CREATE INDEX IF NOT EXISTS idx_rules_active_priority ON money_rules(is_active, priority);
        CREATE INDEX IF NOT EXISTS idx_alloc_op ON money_allocations(money_operation_id);
        CREATE INDEX IF NOT EXISTS idx_alloc_category ON money_allocations(category_id);
        CREATE INDEX IF NOT EXISTS idx_alloc_unconfirmed ON money_allocations(confirmed, method, created_at);
        CREATE INDEX IF NOT EXISTS idx_recon_right ON reconciliation_matches(right_type, right_id);
        CREATE INDEX IF NOT EXISTS idx_audit_entity ON audit_log(entity_type, entity_id);",
    )?;

    Ok(())
}

/// Number of stored facts (voided included)
pub fn verify_count(conn: &Connection) -> Result<i64> {
    let count: i64 =
        conn.query_row("SELECT COUNT(*) FROM money_operations", [], |row| row.get(0))?;

    Ok(count)
}

// ============================================================================
// VALUE ENCODING
// Timestamps are fixed-width RFC 3339 so text order == time order
// ============================================================================

pub(crate) fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now() -> String {
    timestamp(&utc_now())
}

/// Current time at storage precision, so values read back compare equal
pub(crate) fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

pub(crate) fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Exclusive upper bound for "posted on or before `date`"
pub(crate) fn day_end_exclusive(date: NaiveDate) -> DateTime<Utc> {
    day_start(date) + chrono::Duration::days(1)
}

pub(crate) fn parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

pub(crate) fn opt_parsed_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse::<T>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn opt_json_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<serde_json::Value>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        serde_json::from_str(&s)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

pub(crate) fn opt_uuid_text(id: Option<Uuid>) -> Option<String> {
    id.map(|u| u.to_string())
}

// ============================================================================
// ERROR MAPPING
// ============================================================================

/// UNIQUE / PRIMARY KEY violations (trigger aborts are constraint errors too)
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => {
            e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// Turn an immutability-trigger abort into the typed error
pub(crate) fn map_fact_write_error(err: rusqlite::Error, fact_id: Option<Uuid>) -> LedgerError {
    let from_trigger = match &err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.contains(IMMUTABLE_MARKER),
        _ => false,
    };

    if from_trigger {
        LedgerError::ImmutabilityViolation {
            fact_id,
            field: "financial fields".to_string(),
        }
    } else {
        LedgerError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_setup_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        setup_database(&conn).unwrap();
        setup_database(&conn).unwrap();

        assert_eq!(verify_count(&conn).unwrap(), 0);
    }

    #[test]
    fn test_timestamp_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let b = a + chrono::Duration::milliseconds(1500);

        assert_eq!(timestamp(&a), "2025-03-10T00:00:00.000000Z");
        assert_eq!(timestamp(&a).len(), timestamp(&b).len());
        assert!(timestamp(&a) < timestamp(&b));

        let parsed: DateTime<Utc> = timestamp(&b).parse().unwrap();
        assert_eq!(parsed, b);
    }

    #[test]
    fn test_day_bounds() {
        let d = NaiveDate::from_ymd_opt(2025, 3, 31).unwrap();
        assert_eq!(timestamp(&day_start(d)), "2025-03-31T00:00:00.000000Z");
        assert_eq!(
            timestamp(&day_end_exclusive(d)),
            "2025-04-01T00:00:00.000000Z"
        );
    }
}
