// 🧾 Fact Store - immutable money movements
//
// A MoneyOperation is a FACT: money moved on an account at a point in
// time. Facts are written once. The only state change a fact ever sees is
// the void tombstone (is_void + void_reason), and it is one-way.
//
// Interpretation (categories, documents) lives in allocations and
// reconciliation matches, never on the fact itself.

use chrono::{DateTime, NaiveDate, SubsecRound, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::allocation;
use crate::audit;
use crate::db::{self, opt_json_col, opt_parsed_col, parsed_col};
use crate::deduplication::{self, ExistingFact};
use crate::entities::account::{self, Account};
use crate::entities::category::{self, CategoryType};
use crate::error::{LedgerError, Result};
use crate::period::{self, PeriodKey};

// ============================================================================
// OPERATION KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Payment,
    /// Leg of an internal transfer between own accounts
    Transfer,
    Refund,
    Fee,
    /// Marketplace payout landing on a bank account
    Payout,
    #[default]
    Other,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Payment => "payment",
            OperationKind::Transfer => "transfer",
            OperationKind::Refund => "refund",
            OperationKind::Fee => "fee",
            OperationKind::Payout => "payout",
            OperationKind::Other => "other",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "payment" => Ok(OperationKind::Payment),
            "transfer" => Ok(OperationKind::Transfer),
            "refund" => Ok(OperationKind::Refund),
            "fee" => Ok(OperationKind::Fee),
            "payout" => Ok(OperationKind::Payout),
            "other" => Ok(OperationKind::Other),
            other => Err(LedgerError::validation(format!("unknown operation kind: {other}"))),
        }
    }
}

// ============================================================================
// MONEY OPERATION (FACT)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoneyOperation {
    pub id: Uuid,
    pub account_id: Uuid,

    /// Shared by both legs of an internal transfer
    pub transfer_group_id: Option<Uuid>,

    pub posted_at: DateTime<Utc>,

    /// Signed: positive = inflow, negative = outflow
    pub amount: Decimal,

    pub currency: String,
    pub counterparty: Option<String>,
    pub description: Option<String>,
    pub operation_kind: OperationKind,

    /// Id assigned by the statement source, if any
    pub external_id: Option<String>,

    /// Channel tag ("bank_import", "manual", ...)
    pub source: String,

    /// Original statement row, opaque to the ledger
    pub raw_payload: Option<Value>,

    pub fingerprint: String,

    // The only mutable part (one-way)
    pub is_void: bool,
    pub void_reason: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl MoneyOperation {
    pub fn abs_amount(&self) -> Decimal {
        self.amount.abs()
    }

    pub fn is_inflow(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_outflow(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    pub fn posted_date(&self) -> NaiveDate {
        self.posted_at.date_naive()
    }

    pub fn period(&self) -> PeriodKey {
        PeriodKey::from_datetime(&self.posted_at)
    }

    /// Part of an internal transfer (never classified by rules)
    pub fn is_transfer(&self) -> bool {
        self.operation_kind == OperationKind::Transfer || self.transfer_group_id.is_some()
    }

    /// `lower(counterparty) + " " + lower(description)`
    pub fn text_blob(&self) -> String {
        format!(
            "{} {}",
            self.counterparty.as_deref().unwrap_or("").to_lowercase(),
            self.description.as_deref().unwrap_or("").to_lowercase()
        )
    }
}

/// Record produced by statement parsers and manual entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateFact {
    pub account_id: Uuid,
    pub posted_at: DateTime<Utc>,
    pub amount: Decimal,
    /// Defaults to the account's currency
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub counterparty: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub operation_kind: OperationKind,
    #[serde(default)]
    pub external_id: Option<String>,
    pub source: String,
    #[serde(default)]
    pub raw_payload: Option<Value>,
    #[serde(default)]
    pub transfer_group_id: Option<Uuid>,
}

impl CandidateFact {
    pub fn new(account_id: Uuid, posted_at: DateTime<Utc>, amount: Decimal, source: &str) -> Self {
        CandidateFact {
            account_id,
            posted_at,
            amount,
            currency: None,
            counterparty: None,
            description: None,
            operation_kind: OperationKind::default(),
            external_id: None,
            source: source.to_string(),
            raw_payload: None,
            transfer_group_id: None,
        }
    }

    pub fn with_text(mut self, counterparty: Option<&str>, description: Option<&str>) -> Self {
        self.counterparty = counterparty.map(str::to_string);
        self.description = description.map(str::to_string);
        self
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_string());
        self
    }

    pub fn with_kind(mut self, kind: OperationKind) -> Self {
        self.operation_kind = kind;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Inserted(MoneyOperation),
    /// Already recorded; `existing` is None only when a concurrent writer
    /// won the race and the row is not yet visible
    Duplicate { existing: Option<ExistingFact> },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub imported: usize,
    pub skipped_duplicates: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoidOutcome {
    Voided,
    AlreadyVoid,
}

/// Write-once fields a caller might try to amend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactField {
    Account,
    TransferGroup,
    PostedAt,
    Amount,
    Currency,
    Counterparty,
    Description,
    OperationKind,
    ExternalId,
    Source,
    RawPayload,
}

impl FactField {
    pub fn as_str(&self) -> &'static str {
        match self {
            FactField::Account => "account_id",
            FactField::TransferGroup => "transfer_group_id",
            FactField::PostedAt => "posted_at",
            FactField::Amount => "amount",
            FactField::Currency => "currency",
            FactField::Counterparty => "counterparty",
            FactField::Description => "description",
            FactField::OperationKind => "operation_kind",
            FactField::ExternalId => "external_id",
            FactField::Source => "source",
            FactField::RawPayload => "raw_payload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactFilter {
    pub account_id: Option<Uuid>,
    /// Inclusive
    pub date_from: Option<NaiveDate>,
    /// Inclusive
    pub date_to: Option<NaiveDate>,
    pub include_void: bool,
    pub limit: usize,
}

impl Default for FactFilter {
    fn default() -> Self {
        FactFilter {
            account_id: None,
            date_from: None,
            date_to: None,
            include_void: false,
            limit: 500,
        }
    }
}

// ============================================================================
// STORAGE
// ============================================================================

const FACT_COLUMNS: &str = "id, account_id, transfer_group_id, posted_at, amount, currency, \
     counterparty, description, operation_kind, external_id, source, raw_payload, \
     fingerprint, is_void, void_reason, created_at";

fn fact_from_row(row: &Row<'_>) -> rusqlite::Result<MoneyOperation> {
    Ok(MoneyOperation {
        id: parsed_col(row, 0)?,
        account_id: parsed_col(row, 1)?,
        transfer_group_id: opt_parsed_col(row, 2)?,
        posted_at: parsed_col(row, 3)?,
        amount: parsed_col(row, 4)?,
        currency: row.get(5)?,
        counterparty: row.get(6)?,
        description: row.get(7)?,
        operation_kind: parsed_col(row, 8)?,
        external_id: row.get(9)?,
        source: row.get(10)?,
        raw_payload: opt_json_col(row, 11)?,
        fingerprint: row.get(12)?,
        is_void: row.get(13)?,
        void_reason: row.get(14)?,
        created_at: parsed_col(row, 15)?,
    })
}

fn insert_fact(conn: &Connection, fact: &MoneyOperation) -> Result<()> {
    let raw = fact.raw_payload.as_ref().map(serde_json::to_string).transpose()?;

    conn.execute(
        "INSERT INTO money_operations (
            id, account_id, transfer_group_id, posted_at, amount, currency,
            counterparty, description, operation_kind, external_id, source, raw_payload,
            fingerprint, is_void, void_reason, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 0, NULL, ?14)",
        params![
            fact.id.to_string(),
            fact.account_id.to_string(),
            db::opt_uuid_text(fact.transfer_group_id),
            db::timestamp(&fact.posted_at),
            fact.amount.to_string(),
            fact.currency,
            fact.counterparty,
            fact.description,
            fact.operation_kind.as_str(),
            fact.external_id,
            fact.source,
            raw,
            fact.fingerprint,
            db::timestamp(&fact.created_at),
        ],
    )?;

    audit::record(
        conn,
        "MoneyOperation",
        &fact.id.to_string(),
        "create",
        Some(json!({
            "amount": fact.amount,
            "posted_at": db::timestamp(&fact.posted_at),
            "source": fact.source,
        })),
    )?;

    Ok(())
}

fn blank_to_none(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Validate a candidate and turn it into a fact (not yet stored)
fn build_fact(candidate: &CandidateFact, account: &Account) -> Result<MoneyOperation> {
    if candidate.amount.is_zero() {
        return Err(LedgerError::validation("amount must be non-zero"));
    }
    let source = candidate.source.trim();
    if source.is_empty() {
        return Err(LedgerError::validation("source is required"));
    }

    let currency = candidate
        .currency
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(&account.currency)
        .to_uppercase();

    // stored at microsecond precision
    let posted_at = candidate.posted_at.trunc_subsecs(6);

    let fingerprint = deduplication::compute_fingerprint(
        account.id,
        &posted_at,
        candidate.amount,
        candidate.counterparty.as_deref(),
        candidate.description.as_deref(),
    );

    Ok(MoneyOperation {
        id: Uuid::new_v4(),
        account_id: account.id,
        transfer_group_id: candidate.transfer_group_id,
        posted_at,
        amount: candidate.amount,
        currency,
        counterparty: candidate.counterparty.clone(),
        description: candidate.description.clone(),
        operation_kind: candidate.operation_kind,
        external_id: blank_to_none(candidate.external_id.as_deref()),
        source: source.to_string(),
        raw_payload: candidate.raw_payload.clone(),
        fingerprint,
        is_void: false,
        void_reason: None,
        created_at: db::utc_now(),
    })
}

// ============================================================================
// INGEST
// ============================================================================

/// Record a candidate fact. A duplicate is an outcome, not an error.
/// Ingest is allowed in locked periods.
pub fn ingest(conn: &mut Connection, candidate: &CandidateFact) -> Result<IngestOutcome> {
    let tx = conn.transaction()?;

    let account = account::require_active(&tx, candidate.account_id)?;
    let fact = build_fact(candidate, &account)?;
    let outcome = ingest_in(&tx, fact)?;

    tx.commit()?;

    match &outcome {
        IngestOutcome::Inserted(fact) => {
            info!(fact_id = %fact.id, account_id = %fact.account_id, amount = %fact.amount, source = %fact.source, "fact recorded")
        }
        IngestOutcome::Duplicate { existing } => {
            debug!(existing = ?existing, "duplicate fact skipped")
        }
    }

    Ok(outcome)
}

fn existing_for(conn: &Connection, fact: &MoneyOperation) -> Result<Option<ExistingFact>> {
    deduplication::find_existing(
        conn,
        &fact.source,
        fact.account_id,
        fact.external_id.as_deref(),
        &fact.fingerprint,
    )
}

fn ingest_in(conn: &Connection, fact: MoneyOperation) -> Result<IngestOutcome> {
    if let Some(existing) = existing_for(conn, &fact)? {
        return Ok(IngestOutcome::Duplicate {
            existing: Some(existing),
        });
    }

    match insert_fact(conn, &fact) {
        Ok(()) => Ok(IngestOutcome::Inserted(fact)),
        // lost a race against a concurrent importer
        Err(LedgerError::Database(err)) if db::is_unique_violation(&err) => Ok(IngestOutcome::Duplicate {
            existing: existing_for(conn, &fact)?,
        }),
        Err(err) => Err(err),
    }
}

/// Ingest many candidates; bad rows are reported, never abort the batch
pub fn ingest_batch(conn: &mut Connection, candidates: &[CandidateFact]) -> Result<IngestReport> {
    let mut report = IngestReport::default();

    for (idx, candidate) in candidates.iter().enumerate() {
        match ingest(conn, candidate) {
            Ok(IngestOutcome::Inserted(_)) => report.imported += 1,
            Ok(IngestOutcome::Duplicate { .. }) => report.skipped_duplicates += 1,
            Err(err) => {
                warn!(row = idx, error = %err, "candidate rejected");
                report.errors.push(format!("row {idx}: {err}"));
            }
        }
    }

    if report.imported > 0 || report.skipped_duplicates > 0 {
        audit::record(
            conn,
            "IngestBatch",
            &Uuid::new_v4().to_string(),
            "import",
            Some(json!({
                "imported": report.imported,
                "skipped_duplicates": report.skipped_duplicates,
                "errors": report.errors.len(),
            })),
        )?;
    }

    info!(
        imported = report.imported,
        skipped_duplicates = report.skipped_duplicates,
        errors = report.errors.len(),
        "ingest batch finished"
    );

    Ok(report)
}

// ============================================================================
// VOID / IMMUTABILITY
// ============================================================================

/// Tombstone a fact. The row stays; voiding is one-way.
pub fn void(conn: &mut Connection, fact_id: Uuid, reason: Option<&str>) -> Result<VoidOutcome> {
    let tx = conn.transaction()?;
    let fact = get_fact(&tx, fact_id)?;

    period::assert_unlocked(&tx, &fact.posted_at)?;

    if fact.is_void {
        return Ok(VoidOutcome::AlreadyVoid);
    }

    let reason = blank_to_none(reason).unwrap_or_else(|| "void".to_string());
    tx.execute(
        "UPDATE money_operations SET is_void = 1, void_reason = ?2 WHERE id = ?1",
        params![fact_id.to_string(), reason],
    )
    .map_err(|e| db::map_fact_write_error(e, Some(fact_id)))?;

    audit::record(
        &tx,
        "MoneyOperation",
        &fact_id.to_string(),
        "void",
        Some(json!({ "reason": reason })),
    )?;

    tx.commit()?;
    info!(fact_id = %fact_id, %reason, "fact voided");

    Ok(VoidOutcome::Voided)
}

/// Facts are write-once: any amendment is rejected
pub fn amend(conn: &Connection, fact_id: Uuid, field: FactField) -> Result<()> {
    get_fact(conn, fact_id)?;
    Err(LedgerError::ImmutabilityViolation {
        fact_id: Some(fact_id),
        field: field.as_str().to_string(),
    })
}

/// Facts are never physically removed; use `void`
pub fn delete(fact_id: Uuid) -> Result<()> {
    Err(LedgerError::ImmutabilityViolation {
        fact_id: Some(fact_id),
        field: "delete".to_string(),
    })
}

// ============================================================================
// QUERIES
// ============================================================================

pub fn get_fact(conn: &Connection, id: Uuid) -> Result<MoneyOperation> {
    conn.query_row(
        &format!("SELECT {FACT_COLUMNS} FROM money_operations WHERE id = ?1"),
        params![id.to_string()],
        fact_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("money operation", id))
}

/// Newest first
pub fn list_facts(conn: &Connection, filter: &FactFilter) -> Result<Vec<MoneyOperation>> {
    let from = filter.date_from.map(|d| db::timestamp(&db::day_start(d)));
    let to = filter.date_to.map(|d| db::timestamp(&db::day_end_exclusive(d)));

    let mut stmt = conn.prepare(&format!(
        "SELECT {FACT_COLUMNS} FROM money_operations
         WHERE (?1 IS NULL OR account_id = ?1)
           AND (?2 IS NULL OR posted_at >= ?2)
           AND (?3 IS NULL OR posted_at < ?3)
           AND (?4 = 1 OR is_void = 0)
         ORDER BY posted_at DESC, created_at DESC, rowid DESC
         LIMIT ?5"
    ))?;

    let facts = stmt
        .query_map(
            params![
                db::opt_uuid_text(filter.account_id),
                from,
                to,
                filter.include_void,
                i64::try_from(filter.limit).unwrap_or(i64::MAX),
            ],
            fact_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(facts)
}

// ============================================================================
// INTERNAL TRANSFERS
// ============================================================================

pub const TRANSFER_DESCRIPTION: &str = "Перевод между счетами";
pub const TRANSFER_COUNTERPARTY: &str = "Внутренний перевод";
pub const TRANSFER_SOURCE: &str = "manual_other";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTransfer {
    pub from_account_id: Uuid,
    pub to_account_id: Uuid,
    pub posted_at: DateTime<Utc>,
    /// Positive amount moved
    pub amount: Decimal,
    pub currency: Option<String>,
    pub counterparty: Option<String>,
    pub description: Option<String>,
    pub source: Option<String>,
    /// Copied onto the system allocations
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferLegs {
    pub transfer_group_id: Uuid,
    pub outflow: MoneyOperation,
    pub inflow: MoneyOperation,
    /// False when no active transfer category exists
    pub allocated: bool,
}

/// Two legs sharing a transfer group: -amount on the source account,
/// +amount on the destination. Each leg gets a confirmed system
/// allocation to the transfer category.
pub fn create_transfer(conn: &mut Connection, new: &NewTransfer) -> Result<TransferLegs> {
    if new.amount <= Decimal::ZERO {
        return Err(LedgerError::validation("transfer amount must be > 0"));
    }
    if new.from_account_id == new.to_account_id {
        return Err(LedgerError::validation("transfer accounts must differ"));
    }

    let tx = conn.transaction()?;

    let from = account::require_active(&tx, new.from_account_id)?;
    let to = account::require_active(&tx, new.to_account_id)?;
    period::assert_unlocked(&tx, &new.posted_at)?;

    let group = Uuid::new_v4();
    let leg = |account: &Account, amount: Decimal| -> Result<MoneyOperation> {
        let mut candidate = CandidateFact::new(
            account.id,
            new.posted_at,
            amount,
            new.source.as_deref().unwrap_or(TRANSFER_SOURCE),
        )
        .with_kind(OperationKind::Transfer)
        .with_text(
            Some(new.counterparty.as_deref().unwrap_or(TRANSFER_COUNTERPARTY)),
            Some(new.description.as_deref().unwrap_or(TRANSFER_DESCRIPTION)),
        );
        candidate.currency = new.currency.clone();
        candidate.transfer_group_id = Some(group);
        build_fact(&candidate, account)
    };

    let outflow = leg(&from, -new.amount)?;
    let inflow = leg(&to, new.amount)?;

    for fact in [&outflow, &inflow] {
        if let IngestOutcome::Duplicate { .. } = ingest_in(&tx, fact.clone())? {
            return Err(LedgerError::DuplicateFact(format!(
                "transfer leg on account {} for {} at {}",
                fact.account_id,
                fact.amount,
                fact.posted_date()
            )));
        }
    }

    let transfer_category = category::find_system_category(&tx, CategoryType::Transfer)?;
    if let Some(category) = &transfer_category {
        for fact in [&outflow, &inflow] {
            allocation::insert_system_allocation(&tx, fact, category.id, new.note.as_deref())?;
        }
    }

    tx.commit()?;
    info!(
        transfer_group_id = %group,
        from = %from.id,
        to = %to.id,
        amount = %new.amount,
        "internal transfer recorded"
    );

    Ok(TransferLegs {
        transfer_group_id: group,
        outflow,
        inflow,
        allocated: transfer_category.is_some(),
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::account::{create_account, AccountKind, NewAccount};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn setup() -> (Connection, Uuid) {
        let mut conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let bank = create_account(&mut conn, &NewAccount::new(AccountKind::Bank, "Банк (р/с)")).unwrap();
        (conn, bank.id)
    }

    fn create_test_candidate(account_id: Uuid, amount: Decimal) -> CandidateFact {
        CandidateFact::new(
            account_id,
            Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap(),
            amount,
            "bank_import",
        )
        .with_text(Some("УФК (ФНС)"), Some("Налог УСН"))
    }

    fn inserted(outcome: IngestOutcome) -> MoneyOperation {
        match outcome {
            IngestOutcome::Inserted(fact) => fact,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn test_ingest_and_get() {
        let (mut conn, bank) = setup();

        let fact = inserted(ingest(&mut conn, &create_test_candidate(bank, dec!(-1000))).unwrap());

        assert_eq!(fact.currency, "RUB");
        assert!(fact.is_outflow());
        assert_eq!(fact.abs_amount(), dec!(1000));
        assert_eq!(fact.text_blob(), "уфк (фнс) налог усн");
        assert_eq!(fact.period().to_string(), "2025-03");

        let loaded = get_fact(&conn, fact.id).unwrap();
        assert_eq!(loaded, fact);
    }

    #[test]
    fn test_returned_fact_matches_stored_row() {
        let (mut conn, bank) = setup();
        let posted_at = Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);

        let candidate = CandidateFact::new(bank, posted_at, dec!(-250), "bank_import")
            .with_text(None, Some("комиссия"));
        let fact = inserted(ingest(&mut conn, &candidate).unwrap());

        assert_eq!(fact.posted_at.timestamp_subsec_nanos(), 123_456_000);
        assert_eq!(get_fact(&conn, fact.id).unwrap(), fact);

        let cash = create_account(&mut conn, &NewAccount::new(AccountKind::Cash, "Касса")).unwrap();
        let legs = create_transfer(
            &mut conn,
            &NewTransfer {
                from_account_id: bank,
                to_account_id: cash.id,
                posted_at,
                amount: dec!(100),
                currency: None,
                counterparty: None,
                description: None,
                source: None,
                note: None,
            },
        )
        .unwrap();
        assert_eq!(get_fact(&conn, legs.outflow.id).unwrap(), legs.outflow);
        assert_eq!(get_fact(&conn, legs.inflow.id).unwrap(), legs.inflow);
    }

    #[test]
    fn test_double_ingest_by_fingerprint() {
        let (mut conn, bank) = setup();
        let candidate = create_test_candidate(bank, dec!(-1000));

        let first = inserted(ingest(&mut conn, &candidate).unwrap());
        let second = ingest(&mut conn, &candidate).unwrap();

        match second {
            IngestOutcome::Duplicate { existing: Some(existing) } => {
                assert_eq!(existing.fact_id, first.id);
                assert_eq!(existing.reason, deduplication::DuplicateReason::Fingerprint);
            }
            other => panic!("expected duplicate, got {other:?}"),
        }
        assert_eq!(db::verify_count(&conn).unwrap(), 1);
    }

    #[test]
    fn test_double_ingest_by_external_id() {
        let (mut conn, bank) = setup();

        let a = create_test_candidate(bank, dec!(-1000)).with_external_id("PP-17");
        // different text, same statement id
        let b = create_test_candidate(bank, dec!(-1000))
            .with_text(Some("Другой"), None)
            .with_external_id("PP-17");

        inserted(ingest(&mut conn, &a).unwrap());
        assert!(matches!(
            ingest(&mut conn, &b).unwrap(),
            IngestOutcome::Duplicate { existing: Some(ExistingFact { reason: deduplication::DuplicateReason::ExternalId, .. }) }
        ));
    }

    #[test]
    fn test_external_id_bypasses_fingerprint() {
        let (mut conn, bank) = setup();

        // same content, distinct statement ids: two real payments
        inserted(ingest(&mut conn, &create_test_candidate(bank, dec!(-500)).with_external_id("1")).unwrap());
        inserted(ingest(&mut conn, &create_test_candidate(bank, dec!(-500)).with_external_id("2")).unwrap());

        assert_eq!(db::verify_count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_ingest_validation() {
        let (mut conn, bank) = setup();

        let zero = create_test_candidate(bank, Decimal::ZERO);
        assert_eq!(ingest(&mut conn, &zero).unwrap_err().error_code(), "VALIDATION_ERROR");

        let mut no_source = create_test_candidate(bank, dec!(10));
        no_source.source = "  ".to_string();
        assert_eq!(ingest(&mut conn, &no_source).unwrap_err().error_code(), "VALIDATION_ERROR");

        let unknown = create_test_candidate(Uuid::new_v4(), dec!(10));
        assert_eq!(ingest(&mut conn, &unknown).unwrap_err().error_code(), "NOT_FOUND");

        account::deactivate_account(&mut conn, bank).unwrap();
        let inactive = create_test_candidate(bank, dec!(10));
        assert!(matches!(
            ingest(&mut conn, &inactive).unwrap_err(),
            LedgerError::AccountInactive(_)
        ));
    }

    #[test]
    fn test_ingest_batch_reports_rows() {
        let (mut conn, bank) = setup();

        let rows = vec![
            create_test_candidate(bank, dec!(-1000)),
            create_test_candidate(bank, dec!(-1000)),
            create_test_candidate(bank, Decimal::ZERO),
            create_test_candidate(bank, dec!(2500)).with_text(Some("ООО Ромашка"), None),
        ];

        let report = ingest_batch(&mut conn, &rows).unwrap();
        assert_eq!(report.imported, 2);
        assert_eq!(report.skipped_duplicates, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("row 2:"));
    }

    #[test]
    fn test_void_is_one_way() {
        let (mut conn, bank) = setup();
        let fact = inserted(ingest(&mut conn, &create_test_candidate(bank, dec!(-1000))).unwrap());

        assert_eq!(void(&mut conn, fact.id, Some("ошибка банка")).unwrap(), VoidOutcome::Voided);
        assert_eq!(void(&mut conn, fact.id, None).unwrap(), VoidOutcome::AlreadyVoid);

        let voided = get_fact(&conn, fact.id).unwrap();
        assert!(voided.is_void);
        assert_eq!(voided.void_reason.as_deref(), Some("ошибка банка"));

        // the store itself refuses to un-void
        let err = conn
            .execute(
                "UPDATE money_operations SET is_void = 0 WHERE id = ?1",
                params![fact.id.to_string()],
            )
            .unwrap_err();
        assert!(matches!(
            db::map_fact_write_error(err, Some(fact.id)),
            LedgerError::ImmutabilityViolation { .. }
        ));
    }

    #[test]
    fn test_void_in_locked_period() {
        let (mut conn, bank) = setup();
        let fact = inserted(ingest(&mut conn, &create_test_candidate(bank, dec!(-1000))).unwrap());

        period::lock(&mut conn, fact.period(), None, None).unwrap();
        let err = void(&mut conn, fact.id, None).unwrap_err();
        assert!(err.is_period_locked());
        assert!(!get_fact(&conn, fact.id).unwrap().is_void);

        period::unlock(&mut conn, fact.period()).unwrap();
        assert_eq!(void(&mut conn, fact.id, None).unwrap(), VoidOutcome::Voided);
    }

    #[test]
    fn test_facts_are_immutable() {
        let (mut conn, bank) = setup();
        let fact = inserted(ingest(&mut conn, &create_test_candidate(bank, dec!(-1000))).unwrap());

        let err = amend(&conn, fact.id, FactField::Amount).unwrap_err();
        assert!(matches!(err, LedgerError::ImmutabilityViolation { ref field, .. } if field == "amount"));
        assert_eq!(delete(fact.id).unwrap_err().error_code(), "IMMUTABILITY_VIOLATION");
        assert_eq!(
            amend(&conn, Uuid::new_v4(), FactField::Description).unwrap_err().error_code(),
            "NOT_FOUND"
        );

        // direct writes are refused by the store too
        let update = conn
            .execute(
                "UPDATE money_operations SET amount = '-1.00' WHERE id = ?1",
                params![fact.id.to_string()],
            )
            .unwrap_err();
        assert!(matches!(
            db::map_fact_write_error(update, Some(fact.id)),
            LedgerError::ImmutabilityViolation { .. }
        ));

        let delete = conn
            .execute("DELETE FROM money_operations WHERE id = ?1", params![fact.id.to_string()])
            .unwrap_err();
        assert!(matches!(
            db::map_fact_write_error(delete, Some(fact.id)),
            LedgerError::ImmutabilityViolation { .. }
        ));

        assert_eq!(get_fact(&conn, fact.id).unwrap().amount, dec!(-1000));
    }

    #[test]
    fn test_list_facts_filters() {
        let (mut conn, bank) = setup();

        for (day, amount) in [(1, dec!(-100)), (10, dec!(-200)), (31, dec!(300))] {
            let mut candidate = create_test_candidate(bank, amount);
            candidate.posted_at = Utc.with_ymd_and_hms(2025, 3, day, 23, 0, 0).unwrap();
            inserted(ingest(&mut conn, &candidate).unwrap());
        }

        let all = list_facts(&conn, &FactFilter::default()).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].amount, dec!(300));

        let window = FactFilter {
            date_from: NaiveDate::from_ymd_opt(2025, 3, 10),
            date_to: NaiveDate::from_ymd_opt(2025, 3, 31),
            ..FactFilter::default()
        };
        let found = list_facts(&conn, &window).unwrap();
        assert_eq!(found.len(), 2);

        void(&mut conn, found[0].id, None).unwrap();
        assert_eq!(list_facts(&conn, &window).unwrap().len(), 1);

        let with_void = FactFilter {
            include_void: true,
            ..window
        };
        assert_eq!(list_facts(&conn, &with_void).unwrap().len(), 2);
    }

    #[test]
    fn test_transfer_creates_two_legs() {
        let (mut conn, bank) = setup();
        let cash = create_account(&mut conn, &NewAccount::new(AccountKind::Cash, "Касса")).unwrap();

        let mut transfer_category = category::NewCategory::new("Перевод между счетами", CategoryType::Transfer);
        transfer_category.is_system = true;
        let transfer_category = category::ensure_category(&mut conn, &transfer_category).unwrap();

        let new = NewTransfer {
            from_account_id: bank,
            to_account_id: cash.id,
            posted_at: Utc.with_ymd_and_hms(2025, 3, 12, 10, 0, 0).unwrap(),
            amount: dec!(15000),
            currency: None,
            counterparty: None,
            description: None,
            source: None,
            note: Some("инкассация".to_string()),
        };

        let legs = create_transfer(&mut conn, &new).unwrap();
        assert_eq!(legs.outflow.amount, dec!(-15000));
        assert_eq!(legs.inflow.amount, dec!(15000));
        assert_eq!(legs.outflow.transfer_group_id, Some(legs.transfer_group_id));
        assert_eq!(legs.inflow.operation_kind, OperationKind::Transfer);
        assert!(legs.allocated);

        for fact in [&legs.outflow, &legs.inflow] {
            let allocations = allocation::list_allocations(&conn, fact.id).unwrap();
            assert_eq!(allocations.len(), 1);
            assert!(allocations[0].confirmed);
            assert_eq!(allocations[0].category_id, transfer_category.id);
            assert_eq!(allocations[0].amount_part, dec!(15000));
        }

        // the same transfer again collides with the recorded legs
        let err = create_transfer(&mut conn, &new).unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_FACT");
        assert_eq!(db::verify_count(&conn).unwrap(), 2);
    }

    #[test]
    fn test_transfer_validation_and_lock() {
        let (mut conn, bank) = setup();
        let cash = create_account(&mut conn, &NewAccount::new(AccountKind::Cash, "Касса")).unwrap();

        let mut new = NewTransfer {
            from_account_id: bank,
            to_account_id: bank,
            posted_at: Utc.with_ymd_and_hms(2025, 3, 12, 10, 0, 0).unwrap(),
            amount: dec!(100),
            currency: None,
            counterparty: None,
            description: None,
            source: None,
            note: None,
        };
        assert_eq!(create_transfer(&mut conn, &new).unwrap_err().error_code(), "VALIDATION_ERROR");

        new.to_account_id = cash.id;
        new.amount = dec!(-100);
        assert_eq!(create_transfer(&mut conn, &new).unwrap_err().error_code(), "VALIDATION_ERROR");

        new.amount = dec!(100);
        period::lock(&mut conn, "2025-03".parse().unwrap(), None, None).unwrap();
        assert!(create_transfer(&mut conn, &new).unwrap_err().is_period_locked());
        assert_eq!(db::verify_count(&conn).unwrap(), 0);
    }
}
