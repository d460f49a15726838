// 🧮 Allocation Ledger - what a money fact was FOR
//
// An allocation attributes part of a fact's absolute amount to a category
// (and optionally a business document). Rules only ever SUGGEST
// (unconfirmed); confirmation is a human action or a batch that proves
// the suggestions explain the whole amount.
//
// Invariant: sum of confirmed parts <= |amount| + 0.01

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{self, FieldChange};
use crate::config::BatchConfig;
use crate::db::{self, parsed_col};
use crate::entities::category;
use crate::error::{LedgerError, Result};
use crate::facts::{self, FactFilter, MoneyOperation};
use crate::money::{self, TOLERANCE};
use crate::period;
use crate::rules::{self, RuleEngine};

// ============================================================================
// METHOD
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationMethod {
    /// Entered by a person
    #[default]
    Manual,
    /// Suggested by a keyword rule
    Rule,
    /// Suggested by another automatic classifier
    Auto,
    /// Written by the ledger itself (transfer legs)
    System,
}

impl AllocationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMethod::Manual => "manual",
            AllocationMethod::Rule => "rule",
            AllocationMethod::Auto => "auto",
            AllocationMethod::System => "system",
        }
    }

    /// Suggestions that batches may replace or confirm
    pub fn is_suggestion(&self) -> bool {
        matches!(self, AllocationMethod::Rule | AllocationMethod::Auto)
    }
}

impl fmt::Display for AllocationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "manual" => Ok(AllocationMethod::Manual),
            "rule" => Ok(AllocationMethod::Rule),
            "auto" => Ok(AllocationMethod::Auto),
            "system" => Ok(AllocationMethod::System),
            other => Err(LedgerError::validation(format!("unknown allocation method: {other}"))),
        }
    }
}

// ============================================================================
// ALLOCATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoneyAllocation {
    pub id: Uuid,
    pub money_operation_id: Uuid,
    pub category_id: Uuid,

    /// Non-negative share of |amount|
    pub amount_part: Decimal,

    /// Business document this part pays for ("expense", "purchase", ...)
    pub linked_entity_type: Option<String>,
    pub linked_entity_id: Option<String>,

    pub method: AllocationMethod,
    pub confidence: Option<f64>,
    pub confirmed: bool,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAllocation {
    pub money_operation_id: Uuid,
    pub category_id: Uuid,
    /// Sign is ignored
    pub amount_part: Decimal,
    pub linked_entity_type: Option<String>,
    pub linked_entity_id: Option<String>,
    pub method: AllocationMethod,
    pub confidence: Option<f64>,
    pub confirmed: bool,
    pub note: Option<String>,
}

impl NewAllocation {
    pub fn new(money_operation_id: Uuid, category_id: Uuid, amount_part: Decimal) -> Self {
        NewAllocation {
            money_operation_id,
            category_id,
            amount_part,
            linked_entity_type: None,
            linked_entity_id: None,
            method: AllocationMethod::Manual,
            confidence: None,
            confirmed: false,
            note: None,
        }
    }
}

/// Only the `Some` fields change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationPatch {
    pub category_id: Option<Uuid>,
    pub amount_part: Option<Decimal>,
    pub linked_entity_type: Option<String>,
    pub linked_entity_id: Option<String>,
    pub confirmed: Option<bool>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub fact_id: Uuid,
    pub abs_amount: Decimal,
    pub confirmed_sum: Decimal,
    pub unconfirmed_sum: Decimal,
    /// |amount| - confirmed_sum
    pub remaining: Decimal,
    pub fully_allocated: bool,
    pub allocation_count: usize,
}

const ALLOCATION_COLUMNS: &str = "id, money_operation_id, category_id, amount_part, linked_entity_type, \
     linked_entity_id, method, confidence, confirmed, note, created_at, updated_at";

fn allocation_from_row(row: &Row<'_>) -> rusqlite::Result<MoneyAllocation> {
    Ok(MoneyAllocation {
        id: parsed_col(row, 0)?,
        money_operation_id: parsed_col(row, 1)?,
        category_id: parsed_col(row, 2)?,
        amount_part: parsed_col(row, 3)?,
        linked_entity_type: row.get(4)?,
        linked_entity_id: row.get(5)?,
        method: parsed_col(row, 6)?,
        confidence: row.get(7)?,
        confirmed: row.get(8)?,
        note: row.get(9)?,
        created_at: parsed_col(row, 10)?,
        updated_at: parsed_col(row, 11)?,
    })
}

// ============================================================================
// INVARIANT
// ============================================================================

/// Confirmed parts of `fact`, optionally leaving one allocation out
fn confirmed_sum(conn: &Connection, fact_id: Uuid, excluding: Option<Uuid>) -> Result<Decimal> {
    Ok(list_allocations(conn, fact_id)?
        .iter()
        .filter(|a| a.confirmed && Some(a.id) != excluding)
        .map(|a| a.amount_part)
        .sum())
}

/// Fail with `OverAllocated` if confirming `extra` more would exceed |amount|
fn ensure_within_limit(
    conn: &Connection,
    fact: &MoneyOperation,
    extra: Decimal,
    excluding: Option<Uuid>,
) -> Result<()> {
    let confirmed = confirmed_sum(conn, fact.id, excluding)? + extra;
    let limit = fact.abs_amount();

    if confirmed > limit + TOLERANCE {
        return Err(LedgerError::OverAllocated {
            fact_id: fact.id,
            confirmed,
            limit,
        });
    }
    Ok(())
}

fn validate_confidence(confidence: Option<f64>) -> Result<()> {
    match confidence {
        Some(c) if !(0.0..=1.0).contains(&c) => Err(LedgerError::validation(format!(
            "confidence must be in [0, 1], got {c}"
        ))),
        _ => Ok(()),
    }
}

/// Fact an allocation may be attached to or changed on
fn writable_fact(conn: &Connection, fact_id: Uuid) -> Result<MoneyOperation> {
    let fact = facts::get_fact(conn, fact_id)?;
    period::assert_unlocked(conn, &fact.posted_at)?;
    if fact.is_void {
        return Err(LedgerError::FactVoided(fact_id));
    }
    Ok(fact)
}

// ============================================================================
// CRUD
// ============================================================================

pub fn create(conn: &mut Connection, new: &NewAllocation) -> Result<MoneyAllocation> {
    let amount_part = new.amount_part.abs();
    if amount_part.is_zero() {
        return Err(LedgerError::validation("amount_part must be > 0"));
    }
    validate_confidence(new.confidence)?;

    let tx = conn.transaction()?;

    let fact = writable_fact(&tx, new.money_operation_id)?;
    category::require_active(&tx, new.category_id)?;
    if new.confirmed {
        ensure_within_limit(&tx, &fact, amount_part, None)?;
    }

    let now = db::utc_now();
    let allocation = MoneyAllocation {
        id: Uuid::new_v4(),
        money_operation_id: fact.id,
        category_id: new.category_id,
        amount_part,
        linked_entity_type: new.linked_entity_type.clone(),
        linked_entity_id: new.linked_entity_id.clone(),
        method: new.method,
        confidence: new.confidence,
        confirmed: new.confirmed,
        note: new.note.clone(),
        created_at: now,
        updated_at: now,
    };
    insert_allocation(&tx, &allocation)?;

    tx.commit()?;
    info!(
        allocation_id = %allocation.id,
        fact_id = %fact.id,
        category_id = %allocation.category_id,
        amount_part = %allocation.amount_part,
        confirmed = allocation.confirmed,
        "allocation created"
    );

    Ok(allocation)
}

fn insert_allocation(conn: &Connection, allocation: &MoneyAllocation) -> Result<()> {
    conn.execute(
        "INSERT INTO money_allocations (
            id, money_operation_id, category_id, amount_part, linked_entity_type,
            linked_entity_id, method, confidence, confirmed, note, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            allocation.id.to_string(),
            allocation.money_operation_id.to_string(),
            allocation.category_id.to_string(),
            allocation.amount_part.to_string(),
            allocation.linked_entity_type,
            allocation.linked_entity_id,
            allocation.method.as_str(),
            allocation.confidence,
            allocation.confirmed,
            allocation.note,
            db::timestamp(&allocation.created_at),
            db::timestamp(&allocation.updated_at),
        ],
    )?;

    audit::record(
        conn,
        "MoneyAllocation",
        &allocation.id.to_string(),
        "create",
        Some(json!({
            "money_operation_id": allocation.money_operation_id,
            "category_id": allocation.category_id,
            "amount_part": allocation.amount_part,
            "method": allocation.method.as_str(),
            "confidence": allocation.confidence,
            "confirmed": allocation.confirmed,
        })),
    )?;

    Ok(())
}

/// Confirmed allocation of a transfer leg to the transfer category
pub(crate) fn insert_system_allocation(
    conn: &Connection,
    fact: &MoneyOperation,
    category_id: Uuid,
    note: Option<&str>,
) -> Result<MoneyAllocation> {
    let now = db::utc_now();
    let allocation = MoneyAllocation {
        id: Uuid::new_v4(),
        money_operation_id: fact.id,
        category_id,
        amount_part: fact.abs_amount(),
        linked_entity_type: None,
        linked_entity_id: None,
        method: AllocationMethod::System,
        confidence: None,
        confirmed: true,
        note: note.map(str::to_string),
        created_at: now,
        updated_at: now,
    };
    insert_allocation(conn, &allocation)?;
    Ok(allocation)
}

pub fn get_allocation(conn: &Connection, id: Uuid) -> Result<MoneyAllocation> {
    conn.query_row(
        &format!("SELECT {ALLOCATION_COLUMNS} FROM money_allocations WHERE id = ?1"),
        params![id.to_string()],
        allocation_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("allocation", id))
}

/// Idempotent: confirming a confirmed allocation is a no-op
pub fn confirm(conn: &mut Connection, id: Uuid) -> Result<MoneyAllocation> {
    let tx = conn.transaction()?;
    let mut allocation = get_allocation(&tx, id)?;
    let fact = writable_fact(&tx, allocation.money_operation_id)?;

    if allocation.confirmed {
        return Ok(allocation);
    }

    ensure_within_limit(&tx, &fact, allocation.amount_part, Some(id))?;

    allocation.confirmed = true;
    allocation.updated_at = db::utc_now();
    save_allocation(&tx, &allocation)?;
    audit::record(&tx, "MoneyAllocation", &id.to_string(), "confirm", None)?;

    tx.commit()?;
    info!(allocation_id = %id, fact_id = %fact.id, "allocation confirmed");

    Ok(allocation)
}

/// Change fields; each change is audited as `{from, to}`
pub fn patch(conn: &mut Connection, id: Uuid, patch: &AllocationPatch) -> Result<MoneyAllocation> {
    let tx = conn.transaction()?;
    let mut allocation = get_allocation(&tx, id)?;
    let fact = writable_fact(&tx, allocation.money_operation_id)?;
    let mut changes = Vec::new();

    if let Some(category_id) = patch.category_id {
        category::require_active(&tx, category_id)?;
        if category_id != allocation.category_id {
            changes.push(FieldChange::new("category_id", allocation.category_id, category_id));
            allocation.category_id = category_id;
        }
    }
    if let Some(amount_part) = patch.amount_part {
        let amount_part = amount_part.abs();
        if amount_part.is_zero() {
            return Err(LedgerError::validation("amount_part must be > 0"));
        }
        if amount_part != allocation.amount_part {
            changes.push(FieldChange::new("amount_part", allocation.amount_part, amount_part));
            allocation.amount_part = amount_part;
        }
    }
    if let Some(linked_type) = &patch.linked_entity_type {
        if Some(linked_type) != allocation.linked_entity_type.as_ref() {
            changes.push(FieldChange::new(
                "linked_entity_type",
                &allocation.linked_entity_type,
                linked_type,
            ));
            allocation.linked_entity_type = Some(linked_type.clone());
        }
    }
    if let Some(linked_id) = &patch.linked_entity_id {
        if Some(linked_id) != allocation.linked_entity_id.as_ref() {
            changes.push(FieldChange::new("linked_entity_id", &allocation.linked_entity_id, linked_id));
            allocation.linked_entity_id = Some(linked_id.clone());
        }
    }
    if let Some(confirmed) = patch.confirmed {
        if confirmed != allocation.confirmed {
            changes.push(FieldChange::new("confirmed", allocation.confirmed, confirmed));
            allocation.confirmed = confirmed;
        }
    }
    if let Some(note) = &patch.note {
        if Some(note) != allocation.note.as_ref() {
            changes.push(FieldChange::new("note", &allocation.note, note));
            allocation.note = Some(note.clone());
        }
    }

    if changes.is_empty() {
        return Ok(allocation);
    }

    if allocation.confirmed {
        ensure_within_limit(&tx, &fact, allocation.amount_part, Some(id))?;
    }

    allocation.updated_at = db::utc_now();
    save_allocation(&tx, &allocation)?;
    audit::record(
        &tx,
        "MoneyAllocation",
        &id.to_string(),
        "update",
        Some(audit::changes_to_json(&changes)),
    )?;

    tx.commit()?;
    debug!(allocation_id = %id, changed = changes.len(), "allocation patched");

    Ok(allocation)
}

fn save_allocation(conn: &Connection, allocation: &MoneyAllocation) -> Result<()> {
    conn.execute(
        "UPDATE money_allocations
         SET category_id = ?2, amount_part = ?3, linked_entity_type = ?4, linked_entity_id = ?5,
             confirmed = ?6, note = ?7, updated_at = ?8
         WHERE id = ?1",
        params![
            allocation.id.to_string(),
            allocation.category_id.to_string(),
            allocation.amount_part.to_string(),
            allocation.linked_entity_type,
            allocation.linked_entity_id,
            allocation.confirmed,
            allocation.note,
            db::timestamp(&allocation.updated_at),
        ],
    )?;
    Ok(())
}

/// Returns whether a row was removed (missing id is not an error)
pub fn delete(conn: &mut Connection, id: Uuid) -> Result<bool> {
    let tx = conn.transaction()?;

    let Some(allocation) = get_allocation(&tx, id).map(Some).or_else(|e| match e {
        LedgerError::NotFound { .. } => Ok(None),
        other => Err(other),
    })?
    else {
        return Ok(false);
    };

    let fact = facts::get_fact(&tx, allocation.money_operation_id)?;
    period::assert_unlocked(&tx, &fact.posted_at)?;

    delete_in(&tx, &allocation, "delete")?;

    tx.commit()?;
    info!(allocation_id = %id, fact_id = %fact.id, "allocation deleted");

    Ok(true)
}

fn delete_in(conn: &Connection, allocation: &MoneyAllocation, action: &str) -> Result<()> {
    audit::record(
        conn,
        "MoneyAllocation",
        &allocation.id.to_string(),
        action,
        Some(json!({
            "money_operation_id": allocation.money_operation_id,
            "category_id": allocation.category_id,
            "amount_part": allocation.amount_part,
            "method": allocation.method.as_str(),
            "confirmed": allocation.confirmed,
        })),
    )?;
    conn.execute(
        "DELETE FROM money_allocations WHERE id = ?1",
        params![allocation.id.to_string()],
    )?;
    Ok(())
}

// ============================================================================
// QUERIES
// ============================================================================

/// Allocations of one fact, oldest first
pub fn list_allocations(conn: &Connection, fact_id: Uuid) -> Result<Vec<MoneyAllocation>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ALLOCATION_COLUMNS} FROM money_allocations
         WHERE money_operation_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    ))?;

    let allocations = stmt
        .query_map(params![fact_id.to_string()], allocation_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(allocations)
}

pub fn allocation_summary(conn: &Connection, fact_id: Uuid) -> Result<AllocationSummary> {
    let fact = facts::get_fact(conn, fact_id)?;
    let allocations = list_allocations(conn, fact_id)?;

    let (confirmed, unconfirmed): (Vec<_>, Vec<_>) = allocations.iter().partition(|a| a.confirmed);
    let confirmed_sum: Decimal = confirmed.iter().map(|a| a.amount_part).sum();
    let unconfirmed_sum: Decimal = unconfirmed.iter().map(|a| a.amount_part).sum();

    Ok(AllocationSummary {
        fact_id,
        abs_amount: fact.abs_amount(),
        confirmed_sum,
        unconfirmed_sum,
        remaining: fact.abs_amount() - confirmed_sum,
        fully_allocated: money::within_tolerance(confirmed_sum, fact.abs_amount()),
        allocation_count: allocations.len(),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnallocatedFilter {
    pub account_id: Option<Uuid>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub limit: usize,
    /// Newest facts read before filtering
    pub scan_limit: usize,
}

impl UnallocatedFilter {
    pub fn from_config(config: &BatchConfig) -> Self {
        UnallocatedFilter {
            scan_limit: config.scan_limit,
            ..UnallocatedFilter::default()
        }
    }
}

impl Default for UnallocatedFilter {
    fn default() -> Self {
        UnallocatedFilter {
            account_id: None,
            date_from: None,
            date_to: None,
            limit: 500,
            scan_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnallocatedFact {
    pub fact: MoneyOperation,
    pub confirmed_sum: Decimal,
    pub remaining: Decimal,
}

/// Unvoided facts whose confirmed allocations miss |amount| by more than 0.01,
/// newest first
pub fn list_unallocated(conn: &Connection, filter: &UnallocatedFilter) -> Result<Vec<UnallocatedFact>> {
    let mut sums: HashMap<Uuid, Decimal> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT a.money_operation_id, a.amount_part
             FROM money_allocations a
             JOIN money_operations o ON o.id = a.money_operation_id
             WHERE a.confirmed = 1 AND o.is_void = 0",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((parsed_col::<Uuid>(row, 0)?, parsed_col::<Decimal>(row, 1)?))
        })?;
        for row in rows {
            let (fact_id, part) = row?;
            *sums.entry(fact_id).or_default() += part;
        }
    }

    let candidates = facts::list_facts(
        conn,
        &FactFilter {
            account_id: filter.account_id,
            date_from: filter.date_from,
            date_to: filter.date_to,
            include_void: false,
            limit: filter.scan_limit,
        },
    )?;

    let unallocated = candidates
        .into_iter()
        .filter_map(|fact| {
            let confirmed_sum = sums.get(&fact.id).copied().unwrap_or_default();
            if money::within_tolerance(confirmed_sum, fact.abs_amount()) {
                return None;
            }
            Some(UnallocatedFact {
                remaining: fact.abs_amount() - confirmed_sum,
                confirmed_sum,
                fact,
            })
        })
        .take(filter.limit)
        .collect();

    Ok(unallocated)
}

// ============================================================================
// AUTO ALLOCATE (rule suggestions, never confirmed)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoAllocateParams {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    /// Also re-suggest facts that already have confirmed or manual allocations
    pub include_already_allocated: bool,
    pub limit: usize,
}

impl AutoAllocateParams {
    pub fn from_config(config: &BatchConfig) -> Self {
        AutoAllocateParams {
            limit: config.auto_allocate_limit,
            ..AutoAllocateParams::default()
        }
    }
}

impl Default for AutoAllocateParams {
    fn default() -> Self {
        AutoAllocateParams {
            date_from: None,
            date_to: None,
            include_already_allocated: false,
            limit: 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoAllocateReport {
    pub scanned: usize,
    pub suggested: usize,
    pub skipped: usize,
    pub errors: Vec<String>,
}

enum Step {
    Done(usize),
    Skipped(&'static str),
}

/// Suggest categories for unvoided facts in a date window, newest first.
/// Each fact is handled in its own IMMEDIATE transaction so "clear old
/// suggestions, insert new one" cannot interleave with another run.
pub fn auto_allocate(conn: &mut Connection, params: &AutoAllocateParams) -> Result<AutoAllocateReport> {
    let engine = rules::load_engine(conn)?;
    let candidates = facts::list_facts(
        conn,
        &FactFilter {
            account_id: None,
            date_from: params.date_from,
            date_to: params.date_to,
            include_void: false,
            limit: params.limit,
        },
    )?;

    let mut report = AutoAllocateReport::default();

    for fact in &candidates {
        report.scanned += 1;
        match suggest_for_fact(conn, &engine, fact.id, params.include_already_allocated) {
            Ok(Step::Done(_)) => report.suggested += 1,
            Ok(Step::Skipped(reason)) => {
                debug!(fact_id = %fact.id, reason, "auto_allocate skipped fact");
                report.skipped += 1;
            }
            Err(err) => {
                warn!(fact_id = %fact.id, error = %err, "auto_allocate failed for fact");
                report.errors.push(format!("fact {}: {err}", fact.id));
            }
        }
    }

    info!(
        scanned = report.scanned,
        suggested = report.suggested,
        skipped = report.skipped,
        errors = report.errors.len(),
        rules = engine.rule_count(),
        "auto_allocate finished"
    );

    Ok(report)
}

fn suggest_for_fact(
    conn: &mut Connection,
    engine: &RuleEngine,
    fact_id: Uuid,
    include_already_allocated: bool,
) -> Result<Step> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    // re-read under the write lock
    let fact = facts::get_fact(&tx, fact_id)?;
    if fact.is_void {
        return Ok(Step::Skipped("voided"));
    }
    period::assert_unlocked(&tx, &fact.posted_at)?;

    let existing = list_allocations(&tx, fact.id)?;
    if !include_already_allocated
        && existing
            .iter()
            .any(|a| a.confirmed || a.method == AllocationMethod::Manual)
    {
        return Ok(Step::Skipped("already allocated"));
    }

    for stale in existing.iter().filter(|a| !a.confirmed && a.method.is_suggestion()) {
        delete_in(&tx, stale, "replace_suggestion")?;
    }

    let Some(suggestion) = engine.suggest(&fact) else {
        tx.commit()?;
        return Ok(Step::Skipped("no matching rule"));
    };
    category::require_active(&tx, suggestion.category_id)?;

    let now = db::utc_now();
    let allocation = MoneyAllocation {
        id: Uuid::new_v4(),
        money_operation_id: fact.id,
        category_id: suggestion.category_id,
        amount_part: fact.abs_amount(),
        linked_entity_type: None,
        linked_entity_id: None,
        method: AllocationMethod::Rule,
        confidence: Some(suggestion.confidence),
        confirmed: false,
        note: Some(format!("rule:{}", suggestion.rule_id)),
        created_at: now,
        updated_at: now,
    };
    insert_allocation(&tx, &allocation)?;

    tx.commit()?;
    Ok(Step::Done(1))
}

// ============================================================================
// CONFIRM BATCH (only when suggestions explain the whole amount)
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmBatchParams {
    pub min_confidence: f64,
    pub limit: usize,
}

impl ConfirmBatchParams {
    pub fn from_config(config: &BatchConfig) -> Self {
        ConfirmBatchParams {
            min_confidence: config.min_confidence,
            limit: config.confirm_limit,
        }
    }
}

impl Default for ConfirmBatchParams {
    fn default() -> Self {
        ConfirmBatchParams {
            min_confidence: 0.95,
            limit: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfirmBatchReport {
    /// Allocations confirmed
    pub confirmed: usize,
    /// Allocations left unconfirmed
    pub skipped: usize,
    pub errors: Vec<String>,
}

/// Confirm high-confidence suggestions, per fact, only when they close the
/// remaining gap within 0.01. Partial coverage is never confirmed.
pub fn confirm_batch(conn: &mut Connection, params: &ConfirmBatchParams) -> Result<ConfirmBatchReport> {
    if !(0.0..=1.0).contains(&params.min_confidence) {
        return Err(LedgerError::validation(format!(
            "min_confidence must be in [0, 1], got {}",
            params.min_confidence
        )));
    }

    let recent: Vec<(Uuid, Uuid)> = {
        let mut stmt = conn.prepare(
            "SELECT id, money_operation_id FROM money_allocations
             WHERE confirmed = 0 AND method IN ('rule', 'auto')
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![i64::try_from(params.limit).unwrap_or(i64::MAX)], |row| {
                Ok((parsed_col(row, 0)?, parsed_col(row, 1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    // group by fact, keeping first-seen (most recent) order
    let mut order: Vec<Uuid> = Vec::new();
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for (_, fact_id) in &recent {
        let count = counts.entry(*fact_id).or_insert(0);
        if *count == 0 {
            order.push(*fact_id);
        }
        *count += 1;
    }

    let mut report = ConfirmBatchReport::default();

    for fact_id in order {
        let seen = counts.get(&fact_id).copied().unwrap_or(0);
        match confirm_for_fact(conn, fact_id, params.min_confidence) {
            Ok(Step::Done(n)) => {
                report.confirmed += n;
                report.skipped += seen.saturating_sub(n);
            }
            Ok(Step::Skipped(reason)) => {
                debug!(fact_id = %fact_id, reason, "confirm_batch skipped fact");
                report.skipped += seen;
            }
            Err(err) => {
                warn!(fact_id = %fact_id, error = %err, "confirm_batch failed for fact");
                report.errors.push(format!("fact {fact_id}: {err}"));
                report.skipped += seen;
            }
        }
    }

    info!(
        confirmed = report.confirmed,
        skipped = report.skipped,
        errors = report.errors.len(),
        min_confidence = params.min_confidence,
        "confirm_batch finished"
    );

    Ok(report)
}

fn confirm_for_fact(conn: &mut Connection, fact_id: Uuid, min_confidence: f64) -> Result<Step> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let fact = match facts::get_fact(&tx, fact_id) {
        Ok(fact) => fact,
        Err(LedgerError::NotFound { .. }) => return Ok(Step::Skipped("fact missing")),
        Err(err) => return Err(err),
    };
    if fact.is_void {
        return Ok(Step::Skipped("voided"));
    }
    if period::is_locked(&tx, fact.period())? {
        return Ok(Step::Skipped("period locked"));
    }

    let allocations = list_allocations(&tx, fact_id)?;
    if allocations.iter().any(|a| a.method == AllocationMethod::Manual) {
        return Ok(Step::Skipped("has manual allocation"));
    }

    let confirmed_sum: Decimal = allocations.iter().filter(|a| a.confirmed).map(|a| a.amount_part).sum();
    let remaining = fact.abs_amount() - confirmed_sum;

    let eligible: Vec<&MoneyAllocation> = allocations
        .iter()
        .filter(|a| !a.confirmed && a.method.is_suggestion() && a.confidence.unwrap_or(0.0) >= min_confidence)
        .collect();
    if eligible.is_empty() {
        return Ok(Step::Skipped("no eligible suggestion"));
    }
    for allocation in &eligible {
        if !category::get_category(&tx, allocation.category_id)?.is_active {
            return Ok(Step::Skipped("category inactive"));
        }
    }

    let eligible_sum: Decimal = eligible.iter().map(|a| a.amount_part).sum();
    if !money::within_tolerance(eligible_sum, remaining) {
        return Ok(Step::Skipped("suggestions do not cover the remaining amount"));
    }

    let now = db::utc_now();
    for allocation in &eligible {
        let mut confirmed = (*allocation).clone();
        confirmed.confirmed = true;
        confirmed.updated_at = now;
        save_allocation(&tx, &confirmed)?;
        audit::record(
            &tx,
            "MoneyAllocation",
            &allocation.id.to_string(),
            "confirm_batch",
            Some(json!({ "min_confidence": min_confidence })),
        )?;
    }

    tx.commit()?;
    Ok(Step::Done(eligible.len()))
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::account::{create_account, AccountKind, NewAccount};
    use crate::entities::category::{ensure_category, CategoryType, NewCategory};
    use crate::facts::{ingest, CandidateFact, IngestOutcome};
    use crate::rules::{create_rule, Direction, MatchField, NewRule};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct Fixture {
        conn: Connection,
        bank: Uuid,
        taxes: Uuid,
        rent: Uuid,
    }

    fn setup() -> Fixture {
        let mut conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let bank = create_account(&mut conn, &NewAccount::new(AccountKind::Bank, "Банк (р/с)")).unwrap();
        let taxes = ensure_category(&mut conn, &NewCategory::new("Налоги", CategoryType::Expense)).unwrap();
        let rent = ensure_category(&mut conn, &NewCategory::new("Аренда", CategoryType::Expense)).unwrap();
        Fixture {
            conn,
            bank: bank.id,
            taxes: taxes.id,
            rent: rent.id,
        }
    }

    fn create_test_fact(fx: &mut Fixture, amount: Decimal, description: &str) -> MoneyOperation {
        let candidate = CandidateFact::new(
            fx.bank,
            Utc.with_ymd_and_hms(2025, 3, 15, 10, 0, 0).unwrap(),
            amount,
            "bank_import",
        )
        .with_text(None, Some(description));

        match ingest(&mut fx.conn, &candidate).unwrap() {
            IngestOutcome::Inserted(fact) => fact,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    fn tax_rule(fx: &mut Fixture, confidence: f64) {
        create_rule(
            &mut fx.conn,
            &NewRule {
                name: None,
                match_field: MatchField::Text,
                pattern: "фнс|налог".to_string(),
                direction: Direction::Out,
                account_id: None,
                category_id: fx.taxes,
                confidence,
                priority: 1000,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_create_coerces_amount_and_validates() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");

        let allocation = create(&mut fx.conn, &NewAllocation::new(fact.id, fx.taxes, dec!(-400))).unwrap();
        assert_eq!(allocation.amount_part, dec!(400));
        assert!(!allocation.confirmed);
        assert_eq!(allocation.method, AllocationMethod::Manual);

        let zero = NewAllocation::new(fact.id, fx.taxes, Decimal::ZERO);
        assert_eq!(create(&mut fx.conn, &zero).unwrap_err().error_code(), "VALIDATION_ERROR");

        let missing = NewAllocation::new(Uuid::new_v4(), fx.taxes, dec!(1));
        assert_eq!(create(&mut fx.conn, &missing).unwrap_err().error_code(), "NOT_FOUND");

        category::deactivate_category(&mut fx.conn, fx.rent).unwrap();
        let inactive = NewAllocation::new(fact.id, fx.rent, dec!(1));
        assert!(matches!(
            create(&mut fx.conn, &inactive).unwrap_err(),
            LedgerError::CategoryInactive(_)
        ));
    }

    #[test]
    fn test_create_on_voided_fact() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");
        facts::void(&mut fx.conn, fact.id, None).unwrap();

        let err = create(&mut fx.conn, &NewAllocation::new(fact.id, fx.taxes, dec!(10))).unwrap_err();
        assert!(matches!(err, LedgerError::FactVoided(id) if id == fact.id));
    }

    #[test]
    fn test_confirmed_sum_is_bounded() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");

        let mut first = NewAllocation::new(fact.id, fx.taxes, dec!(600));
        first.confirmed = true;
        create(&mut fx.conn, &first).unwrap();

        let mut too_much = NewAllocation::new(fact.id, fx.rent, dec!(400.02));
        too_much.confirmed = true;
        let err = create(&mut fx.conn, &too_much).unwrap_err();
        assert!(matches!(err, LedgerError::OverAllocated { .. }));
        assert!(err.is_conflict());

        // within tolerance is fine
        let mut rest = NewAllocation::new(fact.id, fx.rent, dec!(400.01));
        rest.confirmed = true;
        create(&mut fx.conn, &rest).unwrap();

        let summary = allocation_summary(&fx.conn, fact.id).unwrap();
        assert_eq!(summary.confirmed_sum, dec!(1000.01));
        assert!(summary.fully_allocated);

        // an unconfirmed extra is allowed, confirming it is not
        let extra = create(&mut fx.conn, &NewAllocation::new(fact.id, fx.rent, dec!(5))).unwrap();
        assert!(matches!(
            confirm(&mut fx.conn, extra.id).unwrap_err(),
            LedgerError::OverAllocated { .. }
        ));
    }

    #[test]
    fn test_confirm_is_idempotent() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");
        let allocation = create(&mut fx.conn, &NewAllocation::new(fact.id, fx.taxes, dec!(1000))).unwrap();

        let first = confirm(&mut fx.conn, allocation.id).unwrap();
        let second = confirm(&mut fx.conn, allocation.id).unwrap();
        assert!(first.confirmed && second.confirmed);

        let confirms = audit::events_for_entity(&fx.conn, "MoneyAllocation", &allocation.id.to_string())
            .unwrap()
            .into_iter()
            .filter(|e| e.action == "confirm")
            .count();
        assert_eq!(confirms, 1);
    }

    #[test]
    fn test_patch_records_each_change() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");
        let allocation = create(&mut fx.conn, &NewAllocation::new(fact.id, fx.taxes, dec!(1000))).unwrap();

        let patched = patch(
            &mut fx.conn,
            allocation.id,
            &AllocationPatch {
                category_id: Some(fx.rent),
                note: Some("аренда склада".to_string()),
                ..AllocationPatch::default()
            },
        )
        .unwrap();
        assert_eq!(patched.category_id, fx.rent);

        let events = audit::events_for_entity(&fx.conn, "MoneyAllocation", &allocation.id.to_string()).unwrap();
        let update = events.last().unwrap();
        assert_eq!(update.action, "update");
        assert_eq!(
            update.changed_fields,
            Some(json!({
                "category_id": {"from": fx.taxes, "to": fx.rent},
                "note": {"from": null, "to": "аренда склада"},
            }))
        );

        let err = patch(
            &mut fx.conn,
            allocation.id,
            &AllocationPatch {
                amount_part: Some(dec!(1500)),
                confirmed: Some(true),
                ..AllocationPatch::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, LedgerError::OverAllocated { .. }));
    }

    #[test]
    fn test_delete() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");
        let allocation = create(&mut fx.conn, &NewAllocation::new(fact.id, fx.taxes, dec!(1000))).unwrap();

        assert!(delete(&mut fx.conn, allocation.id).unwrap());
        assert!(!delete(&mut fx.conn, allocation.id).unwrap());
        assert!(list_allocations(&fx.conn, fact.id).unwrap().is_empty());
    }

    #[test]
    fn test_locked_period_blocks_allocation_changes() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");
        let allocation = create(&mut fx.conn, &NewAllocation::new(fact.id, fx.taxes, dec!(1000))).unwrap();

        period::lock(&mut fx.conn, fact.period(), None, None).unwrap();

        assert!(create(&mut fx.conn, &NewAllocation::new(fact.id, fx.taxes, dec!(1)))
            .unwrap_err()
            .is_period_locked());
        assert!(confirm(&mut fx.conn, allocation.id).unwrap_err().is_period_locked());
        assert!(patch(
            &mut fx.conn,
            allocation.id,
            &AllocationPatch {
                note: Some("x".to_string()),
                ..AllocationPatch::default()
            }
        )
        .unwrap_err()
        .is_period_locked());
        assert!(delete(&mut fx.conn, allocation.id).unwrap_err().is_period_locked());

        period::unlock(&mut fx.conn, fact.period()).unwrap();
        assert!(confirm(&mut fx.conn, allocation.id).unwrap().confirmed);
    }

    #[test]
    fn test_auto_allocate_suggests_full_amount() {
        let mut fx = setup();
        tax_rule(&mut fx, 0.99);
        let fact = create_test_fact(&mut fx, dec!(-1000), "Налог УСН за 1 кв");
        create_test_fact(&mut fx, dec!(-50), "кофе");

        let report = auto_allocate(&mut fx.conn, &AutoAllocateParams::default()).unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.suggested, 1);
        assert_eq!(report.skipped, 1);
        assert!(report.errors.is_empty());

        let allocations = list_allocations(&fx.conn, fact.id).unwrap();
        assert_eq!(allocations.len(), 1);
        assert_eq!(allocations[0].amount_part, dec!(1000));
        assert_eq!(allocations[0].method, AllocationMethod::Rule);
        assert_eq!(allocations[0].confidence, Some(0.99));
        assert!(!allocations[0].confirmed);
        assert!(allocations[0].note.as_deref().unwrap().starts_with("rule:"));

        // re-running replaces, never duplicates
        auto_allocate(&mut fx.conn, &AutoAllocateParams::default()).unwrap();
        assert_eq!(list_allocations(&fx.conn, fact.id).unwrap().len(), 1);
    }

    #[test]
    fn test_auto_allocate_respects_existing_work() {
        let mut fx = setup();
        tax_rule(&mut fx, 0.99);
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");
        let manual = create(&mut fx.conn, &NewAllocation::new(fact.id, fx.rent, dec!(300))).unwrap();

        let report = auto_allocate(&mut fx.conn, &AutoAllocateParams::default()).unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(list_allocations(&fx.conn, fact.id).unwrap(), vec![manual.clone()]);

        let report = auto_allocate(
            &mut fx.conn,
            &AutoAllocateParams {
                include_already_allocated: true,
                ..AutoAllocateParams::default()
            },
        )
        .unwrap();
        assert_eq!(report.suggested, 1);
        // the manual allocation survives
        let allocations = list_allocations(&fx.conn, fact.id).unwrap();
        assert_eq!(allocations.len(), 2);
        assert_eq!(allocations[0], manual);
    }

    #[test]
    fn test_auto_allocate_locked_period_is_an_error() {
        let mut fx = setup();
        tax_rule(&mut fx, 0.99);
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");
        period::lock(&mut fx.conn, fact.period(), None, None).unwrap();

        let report = auto_allocate(&mut fx.conn, &AutoAllocateParams::default()).unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.suggested, 0);
        assert_eq!(report.errors.len(), 1);
        assert!(list_allocations(&fx.conn, fact.id).unwrap().is_empty());
    }

    #[test]
    fn test_inactive_category_is_never_suggested_or_confirmed() {
        let mut fx = setup();
        tax_rule(&mut fx, 0.99);
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");

        // suggestion made while the category was active
        auto_allocate(&mut fx.conn, &AutoAllocateParams::default()).unwrap();
        category::deactivate_category(&mut fx.conn, fx.taxes).unwrap();

        let report = confirm_batch(&mut fx.conn, &ConfirmBatchParams::default()).unwrap();
        assert_eq!(report.confirmed, 0);
        assert_eq!(report.skipped, 1);
        assert!(!allocation_summary(&fx.conn, fact.id).unwrap().fully_allocated);

        // the rule no longer fires and the stale suggestion is dropped
        let report = auto_allocate(&mut fx.conn, &AutoAllocateParams::default()).unwrap();
        assert_eq!(report.suggested, 0);
        assert_eq!(report.skipped, 1);
        assert!(report.errors.is_empty());
        assert!(list_allocations(&fx.conn, fact.id).unwrap().is_empty());
        assert_eq!(rules::load_engine(&fx.conn).unwrap().rule_count(), 0);
    }

    #[test]
    fn test_list_unallocated_scan_is_bounded() {
        let mut fx = setup();
        let oldest = create_test_fact(&mut fx, dec!(-100), "первый");
        create_test_fact(&mut fx, dec!(-200), "второй");
        create_test_fact(&mut fx, dec!(-300), "третий");

        let filter = UnallocatedFilter {
            scan_limit: 2,
            ..UnallocatedFilter::default()
        };
        let unallocated = list_unallocated(&fx.conn, &filter).unwrap();
        assert_eq!(unallocated.len(), 2);
        assert!(unallocated.iter().all(|u| u.fact.id != oldest.id));

        let from_config = UnallocatedFilter::from_config(&BatchConfig::default());
        assert_eq!(from_config.scan_limit, BatchConfig::default().scan_limit);
        assert_eq!(list_unallocated(&fx.conn, &from_config).unwrap().len(), 3);
    }

    #[test]
    fn test_confirm_batch_confirms_full_coverage() {
        let mut fx = setup();
        tax_rule(&mut fx, 0.99);
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");
        auto_allocate(&mut fx.conn, &AutoAllocateParams::default()).unwrap();

        let report = confirm_batch(&mut fx.conn, &ConfirmBatchParams::default()).unwrap();
        assert_eq!(report.confirmed, 1);
        assert_eq!(report.skipped, 0);

        let summary = allocation_summary(&fx.conn, fact.id).unwrap();
        assert!(summary.fully_allocated);
        assert_eq!(summary.remaining, Decimal::ZERO);
    }

    #[test]
    fn test_confirm_batch_never_confirms_partial_coverage() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");

        let mut partial = NewAllocation::new(fact.id, fx.taxes, dec!(700));
        partial.method = AllocationMethod::Rule;
        partial.confidence = Some(0.99);
        create(&mut fx.conn, &partial).unwrap();

        let report = confirm_batch(&mut fx.conn, &ConfirmBatchParams::default()).unwrap();
        assert_eq!(report.confirmed, 0);
        assert_eq!(report.skipped, 1);
        assert!(!list_allocations(&fx.conn, fact.id).unwrap()[0].confirmed);
    }

    #[test]
    fn test_confirm_batch_threshold_and_manual() {
        let mut fx = setup();
        tax_rule(&mut fx, 0.90);
        let low = create_test_fact(&mut fx, dec!(-1000), "налог");
        auto_allocate(&mut fx.conn, &AutoAllocateParams::default()).unwrap();

        let report = confirm_batch(&mut fx.conn, &ConfirmBatchParams::default()).unwrap();
        assert_eq!(report.confirmed, 0);

        let report = confirm_batch(
            &mut fx.conn,
            &ConfirmBatchParams {
                min_confidence: 0.9,
                ..ConfirmBatchParams::default()
            },
        )
        .unwrap();
        assert_eq!(report.confirmed, 1);
        assert!(allocation_summary(&fx.conn, low.id).unwrap().fully_allocated);

        let bad = ConfirmBatchParams {
            min_confidence: 1.5,
            ..ConfirmBatchParams::default()
        };
        assert_eq!(confirm_batch(&mut fx.conn, &bad).unwrap_err().error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_confirm_batch_closes_remaining_gap() {
        let mut fx = setup();
        let fact = create_test_fact(&mut fx, dec!(-1000), "налог");

        let mut manual_confirmed = NewAllocation::new(fact.id, fx.rent, dec!(300));
        manual_confirmed.method = AllocationMethod::System;
        manual_confirmed.confirmed = true;
        create(&mut fx.conn, &manual_confirmed).unwrap();

        let mut suggestion = NewAllocation::new(fact.id, fx.taxes, dec!(700));
        suggestion.method = AllocationMethod::Auto;
        suggestion.confidence = Some(0.97);
        create(&mut fx.conn, &suggestion).unwrap();

        let report = confirm_batch(&mut fx.conn, &ConfirmBatchParams::default()).unwrap();
        assert_eq!(report.confirmed, 1);
        assert!(allocation_summary(&fx.conn, fact.id).unwrap().fully_allocated);
    }

    #[test]
    fn test_list_unallocated() {
        let mut fx = setup();
        let done = create_test_fact(&mut fx, dec!(-1000), "налог");
        let open = create_test_fact(&mut fx, dec!(-500), "аренда");

        let mut full = NewAllocation::new(done.id, fx.taxes, dec!(999.995));
        full.confirmed = true;
        create(&mut fx.conn, &full).unwrap();

        let mut part = NewAllocation::new(open.id, fx.rent, dec!(200));
        part.confirmed = true;
        create(&mut fx.conn, &part).unwrap();

        let unallocated = list_unallocated(&fx.conn, &UnallocatedFilter::default()).unwrap();
        assert_eq!(unallocated.len(), 1);
        assert_eq!(unallocated[0].fact.id, open.id);
        assert_eq!(unallocated[0].confirmed_sum, dec!(200));
        assert_eq!(unallocated[0].remaining, dec!(300));
    }
}
