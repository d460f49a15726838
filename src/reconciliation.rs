// ⚖️ Reconciliation Matcher - link money facts to business documents
//
// A match says "this bank line paid for that document". Suggestions are
// scored by amount similarity inside a date window:
//
//   score = max(0, 1 - |target - |candidate|| / max(1, target) * penalty)
//
// A 20% difference (penalty 5) drives the score to zero. Matches are unique
// per (fact, right type, right id) so re-running never duplicates them.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{self, FieldChange};
use crate::config::ReconciliationConfig;
use crate::db::{self, opt_parsed_col, parsed_col};
use crate::error::{LedgerError, Result};
use crate::facts::{self, MoneyOperation};
use crate::money;
use crate::period;

// ============================================================================
// DOCUMENTS (external collaborators)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Expense,
    /// Purchase document, matched by its gross total
    Purchase,
    SaleOrder,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Expense => "expense",
            DocumentKind::Purchase => "purchase",
            DocumentKind::SaleOrder => "sale_order",
        }
    }

    /// Document kinds that can explain a fact with this sign
    pub fn for_fact(fact: &MoneyOperation) -> &'static [DocumentKind] {
        if fact.is_outflow() {
            &[DocumentKind::Expense, DocumentKind::Purchase]
        } else {
            &[DocumentKind::SaleOrder]
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentCandidate {
    pub kind: DocumentKind,
    pub id: String,
    pub date: NaiveDate,
    /// Expense amount, purchase gross or order revenue
    pub amount: Decimal,
}

/// Lookup of business documents by kind and inclusive date window
pub trait DocumentSource {
    fn documents(&self, kind: DocumentKind, from: NaiveDate, to: NaiveDate) -> Result<Vec<DocumentCandidate>>;
}

/// Documents held in memory (fixtures, pre-fetched batches)
#[derive(Debug, Clone, Default)]
pub struct InMemoryDocuments {
    documents: Vec<DocumentCandidate>,
}

impl InMemoryDocuments {
    pub fn new(documents: Vec<DocumentCandidate>) -> Self {
        InMemoryDocuments { documents }
    }

    pub fn push(&mut self, kind: DocumentKind, id: &str, date: NaiveDate, amount: Decimal) {
        self.documents.push(DocumentCandidate {
            kind,
            id: id.to_string(),
            date,
            amount,
        });
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentSource for InMemoryDocuments {
    fn documents(&self, kind: DocumentKind, from: NaiveDate, to: NaiveDate) -> Result<Vec<DocumentCandidate>> {
        Ok(self
            .documents
            .iter()
            .filter(|d| d.kind == kind && d.date >= from && d.date <= to)
            .cloned()
            .collect())
    }
}

// ============================================================================
// SCORING
// ============================================================================

/// Amount similarity in [0, 1]; `penalty` scales the relative difference
pub fn amount_score(target: Decimal, candidate: Decimal, penalty: f64) -> f64 {
    let target = money::to_f64(target.abs());
    let diff = (target - money::to_f64(candidate.abs())).abs();
    (1.0 - (diff / target.max(1.0)) * penalty).max(0.0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSuggestion {
    pub right_type: String,
    pub right_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
    /// Rounded to 3 decimals
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct MatchScorer {
    window_days: i64,
    min_score: f64,
    max_suggestions: usize,
}

impl MatchScorer {
    /// ±3 days, keep > 0.35, at most 20
    pub fn new() -> Self {
        Self::with_thresholds(3, 0.35, 20)
    }

    pub fn with_thresholds(window_days: i64, min_score: f64, max_suggestions: usize) -> Self {
        MatchScorer {
            window_days,
            min_score,
            max_suggestions,
        }
    }

    pub fn from_config(config: &ReconciliationConfig) -> Self {
        Self::with_thresholds(config.window_days, config.min_score, config.max_suggestions)
    }

    /// Ranked document suggestions for one fact
    pub fn suggest(&self, fact: &MoneyOperation, source: &dyn DocumentSource) -> Result<Vec<MatchSuggestion>> {
        let day = fact.posted_date();
        let from = day - Duration::days(self.window_days);
        let to = day + Duration::days(self.window_days);
        let target = fact.abs_amount();

        let mut suggestions = Vec::new();
        for kind in DocumentKind::for_fact(fact) {
            for doc in source.documents(*kind, from, to)? {
                let score = amount_score(target, doc.amount, 5.0);
                if score > self.min_score {
                    suggestions.push(MatchSuggestion {
                        right_type: doc.kind.as_str().to_string(),
                        right_id: doc.id,
                        date: doc.date,
                        amount: doc.amount,
                        score: money::round_score(score),
                    });
                }
            }
        }

        suggestions.sort_by(|a, b| b.score.total_cmp(&a.score));
        suggestions.truncate(self.max_suggestions);

        debug!(fact_id = %fact.id, found = suggestions.len(), "match suggestions scored");
        Ok(suggestions)
    }
}

impl Default for MatchScorer {
    fn default() -> Self {
        Self::new()
    }
}

/// Suggestions with the default window and thresholds
pub fn suggest_matches(fact: &MoneyOperation, source: &dyn DocumentSource) -> Result<Vec<MatchSuggestion>> {
    MatchScorer::default().suggest(fact, source)
}

// ============================================================================
// MATCHES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    Exact,
    Rule,
    #[default]
    Manual,
    Auto,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchMethod::Exact => "exact",
            MatchMethod::Rule => "rule",
            MatchMethod::Manual => "manual",
            MatchMethod::Auto => "auto",
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchMethod {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "exact" => Ok(MatchMethod::Exact),
            "rule" => Ok(MatchMethod::Rule),
            "manual" => Ok(MatchMethod::Manual),
            "auto" | "automatic" => Ok(MatchMethod::Auto),
            other => Err(LedgerError::validation(format!("unknown match method: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Suggested,
    #[default]
    Confirmed,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Suggested => "suggested",
            MatchStatus::Confirmed => "confirmed",
            MatchStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "suggested" => Ok(MatchStatus::Suggested),
            "confirmed" => Ok(MatchStatus::Confirmed),
            "rejected" => Ok(MatchStatus::Rejected),
            other => Err(LedgerError::validation(format!("unknown match status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationMatch {
    pub id: Uuid,
    pub money_operation_id: Uuid,
    pub right_type: String,
    /// Opaque; may be a synthetic key such as a payout batch key
    pub right_id: String,
    pub method: MatchMethod,
    pub score: Option<f64>,
    pub status: MatchStatus,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMatch {
    pub money_operation_id: Uuid,
    pub right_type: String,
    pub right_id: String,
    pub method: MatchMethod,
    pub score: Option<f64>,
    pub status: MatchStatus,
    pub note: Option<String>,
}

impl NewMatch {
    /// Manual, confirmed
    pub fn new(money_operation_id: Uuid, right_type: &str, right_id: &str) -> Self {
        NewMatch {
            money_operation_id,
            right_type: right_type.to_string(),
            right_id: right_id.to_string(),
            method: MatchMethod::Manual,
            score: None,
            status: MatchStatus::Confirmed,
            note: None,
        }
    }

    pub fn from_suggestion(money_operation_id: Uuid, suggestion: &MatchSuggestion) -> Self {
        NewMatch {
            money_operation_id,
            right_type: suggestion.right_type.clone(),
            right_id: suggestion.right_id.clone(),
            method: MatchMethod::Rule,
            score: Some(suggestion.score),
            status: MatchStatus::Suggested,
            note: None,
        }
    }
}

const MATCH_COLUMNS: &str =
    "id, money_operation_id, right_type, right_id, method, score, status, note, created_at, confirmed_at";

fn match_from_row(row: &Row<'_>) -> rusqlite::Result<ReconciliationMatch> {
    Ok(ReconciliationMatch {
        id: parsed_col(row, 0)?,
        money_operation_id: parsed_col(row, 1)?,
        right_type: row.get(2)?,
        right_id: row.get(3)?,
        method: parsed_col(row, 4)?,
        score: row.get(5)?,
        status: parsed_col(row, 6)?,
        note: row.get(7)?,
        created_at: parsed_col(row, 8)?,
        confirmed_at: opt_parsed_col(row, 9)?,
    })
}

pub fn create_match(conn: &mut Connection, new: &NewMatch) -> Result<ReconciliationMatch> {
    let right_type = new.right_type.trim();
    let right_id = new.right_id.trim();
    if right_type.is_empty() || right_id.is_empty() {
        return Err(LedgerError::validation("right_type and right_id are required"));
    }

    let tx = conn.transaction()?;

    let fact = facts::get_fact(&tx, new.money_operation_id)?;
    period::assert_unlocked(&tx, &fact.posted_at)?;
    if fact.is_void {
        return Err(LedgerError::FactVoided(fact.id));
    }

    let now = db::utc_now();
    let recon = ReconciliationMatch {
        id: Uuid::new_v4(),
        money_operation_id: fact.id,
        right_type: right_type.to_string(),
        right_id: right_id.to_string(),
        method: new.method,
        score: new.score,
        status: new.status,
        note: new.note.clone(),
        created_at: now,
        confirmed_at: (new.status == MatchStatus::Confirmed).then_some(now),
    };
    insert_match(&tx, &recon)?;

    tx.commit()?;
    info!(
        match_id = %recon.id,
        fact_id = %fact.id,
        right_type = %recon.right_type,
        right_id = %recon.right_id,
        status = %recon.status,
        "reconciliation match created"
    );

    Ok(recon)
}

/// Insert and audit; a repeated (fact, right type, right id) is `DuplicateMatch`
pub(crate) fn insert_match(conn: &Connection, recon: &ReconciliationMatch) -> Result<()> {
    let inserted = conn.execute(
        &format!("INSERT INTO reconciliation_matches ({MATCH_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
        params![
            recon.id.to_string(),
            recon.money_operation_id.to_string(),
            recon.right_type,
            recon.right_id,
            recon.method.as_str(),
            recon.score,
            recon.status.as_str(),
            recon.note,
            db::timestamp(&recon.created_at),
            recon.confirmed_at.as_ref().map(db::timestamp),
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(e) if db::is_unique_violation(&e) => {
            return Err(LedgerError::DuplicateMatch {
                fact_id: recon.money_operation_id,
                right_type: recon.right_type.clone(),
                right_id: recon.right_id.clone(),
            });
        }
        Err(e) => return Err(e.into()),
    }

    audit::record(
        conn,
        "ReconciliationMatch",
        &recon.id.to_string(),
        "create",
        Some(json!({
            "money_operation_id": recon.money_operation_id,
            "right_type": recon.right_type,
            "right_id": recon.right_id,
            "method": recon.method.as_str(),
            "status": recon.status.as_str(),
            "score": recon.score,
        })),
    )?;

    Ok(())
}

pub fn get_match(conn: &Connection, id: Uuid) -> Result<ReconciliationMatch> {
    conn.query_row(
        &format!("SELECT {MATCH_COLUMNS} FROM reconciliation_matches WHERE id = ?1"),
        params![id.to_string()],
        match_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("reconciliation match", id))
}

/// Returns whether a row was removed (missing id is not an error)
pub fn delete_match(conn: &mut Connection, id: Uuid) -> Result<bool> {
    let tx = conn.transaction()?;

    let recon = match get_match(&tx, id) {
        Ok(recon) => recon,
        Err(LedgerError::NotFound { .. }) => return Ok(false),
        Err(e) => return Err(e),
    };
    let fact = facts::get_fact(&tx, recon.money_operation_id)?;
    period::assert_unlocked(&tx, &fact.posted_at)?;

    audit::record(
        &tx,
        "ReconciliationMatch",
        &id.to_string(),
        "delete",
        Some(json!({
            "money_operation_id": recon.money_operation_id,
            "right_type": recon.right_type,
            "right_id": recon.right_id,
            "status": recon.status.as_str(),
        })),
    )?;
    tx.execute(
        "DELETE FROM reconciliation_matches WHERE id = ?1",
        params![id.to_string()],
    )?;

    tx.commit()?;
    info!(match_id = %id, fact_id = %fact.id, "reconciliation match deleted");

    Ok(true)
}

pub fn confirm_match(conn: &mut Connection, id: Uuid) -> Result<ReconciliationMatch> {
    set_status(conn, id, MatchStatus::Confirmed)
}

pub fn reject_match(conn: &mut Connection, id: Uuid) -> Result<ReconciliationMatch> {
    set_status(conn, id, MatchStatus::Rejected)
}

fn set_status(conn: &mut Connection, id: Uuid, status: MatchStatus) -> Result<ReconciliationMatch> {
    let tx = conn.transaction()?;
    let mut recon = get_match(&tx, id)?;
    let fact = facts::get_fact(&tx, recon.money_operation_id)?;
    period::assert_unlocked(&tx, &fact.posted_at)?;

    if recon.status == status {
        return Ok(recon);
    }

    let change = FieldChange::new("status", recon.status, status);
    recon.status = status;
    recon.confirmed_at = match status {
        MatchStatus::Confirmed => Some(db::utc_now()),
        _ => None,
    };

    tx.execute(
        "UPDATE reconciliation_matches SET status = ?2, confirmed_at = ?3 WHERE id = ?1",
        params![
            id.to_string(),
            recon.status.as_str(),
            recon.confirmed_at.as_ref().map(db::timestamp),
        ],
    )?;
    audit::record(
        &tx,
        "ReconciliationMatch",
        &id.to_string(),
        status.as_str(),
        Some(audit::changes_to_json(&[change])),
    )?;

    tx.commit()?;
    info!(match_id = %id, status = %status, "reconciliation match status changed");

    Ok(recon)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchFilter {
    pub money_operation_id: Option<Uuid>,
    pub status: Option<MatchStatus>,
    pub right_type: Option<String>,
    pub limit: usize,
}

impl Default for MatchFilter {
    fn default() -> Self {
        MatchFilter {
            money_operation_id: None,
            status: None,
            right_type: None,
            limit: 500,
        }
    }
}

/// Newest first
pub fn list_matches(conn: &Connection, filter: &MatchFilter) -> Result<Vec<ReconciliationMatch>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MATCH_COLUMNS} FROM reconciliation_matches
         WHERE (?1 IS NULL OR money_operation_id = ?1)
           AND (?2 IS NULL OR status = ?2)
           AND (?3 IS NULL OR right_type = ?3)
         ORDER BY created_at DESC, rowid DESC
         LIMIT ?4"
    ))?;

    let matches = stmt
        .query_map(
            params![
                db::opt_uuid_text(filter.money_operation_id),
                filter.status.map(|s| s.as_str()),
                filter.right_type,
                i64::try_from(filter.limit).unwrap_or(i64::MAX),
            ],
            match_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(matches)
}

/// Suggested or confirmed match for a right-side reference, confirmed first
pub(crate) fn active_match_for(
    conn: &Connection,
    right_type: &str,
    right_id: &str,
) -> Result<Option<ReconciliationMatch>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {MATCH_COLUMNS} FROM reconciliation_matches
                 WHERE right_type = ?1 AND right_id = ?2 AND status IN ('suggested', 'confirmed')
                 ORDER BY status != 'confirmed', created_at ASC
                 LIMIT 1"
            ),
            params![right_type, right_id],
            match_from_row,
        )
        .optional()?;

    Ok(found)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::account::{create_account, AccountKind, NewAccount};
    use crate::facts::{ingest, CandidateFact, IngestOutcome};
    use chrono::TimeZone;
    use proptest::prelude::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn setup() -> (Connection, Uuid) {
        let mut conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        let bank = create_account(&mut conn, &NewAccount::new(AccountKind::Bank, "Банк (р/с)")).unwrap();
        (conn, bank.id)
    }

    fn create_test_fact(conn: &mut Connection, account: Uuid, day: u32, amount: Decimal) -> MoneyOperation {
        let candidate = CandidateFact::new(
            account,
            Utc.with_ymd_and_hms(2025, 4, day, 12, 0, 0).unwrap(),
            amount,
            "bank_import",
        )
        .with_text(Some("ООО Поставщик"), None);

        match ingest(conn, &candidate).unwrap() {
            IngestOutcome::Inserted(fact) => fact,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 4, day).unwrap()
    }

    #[rstest]
    #[case(dec!(1000), dec!(1000), 1.0)]
    #[case(dec!(1000), dec!(-1000), 1.0)]
    #[case(dec!(1000), dec!(900), 0.5)]
    #[case(dec!(1000), dec!(800), 0.0)]
    #[case(dec!(1000), dec!(1300), 0.0)]
    #[case(dec!(0.5), dec!(0), 0.0)]
    fn test_amount_score(#[case] target: Decimal, #[case] candidate: Decimal, #[case] expected: f64) {
        let score = amount_score(target, candidate, 5.0);
        assert!((score - expected).abs() < 1e-9, "{target} vs {candidate}: {score}");
    }

    proptest! {
        #[test]
        fn prop_amount_score_is_bounded(target in -1_000_000i64..1_000_000, candidate in -1_000_000i64..1_000_000) {
            let score = amount_score(Decimal::new(target, 2), Decimal::new(candidate, 2), 5.0);
            prop_assert!((0.0..=1.0).contains(&score));
        }

        #[test]
        fn prop_identical_amounts_score_one(amount in -1_000_000i64..1_000_000) {
            let a = Decimal::new(amount, 2);
            prop_assert_eq!(amount_score(a, a, 6.0), 1.0);
        }
    }

    #[test]
    fn test_outflow_suggestions_use_expenses_and_purchases() {
        let (mut conn, bank) = setup();
        let fact = create_test_fact(&mut conn, bank, 10, dec!(-1000));

        let mut docs = InMemoryDocuments::default();
        docs.push(DocumentKind::Expense, "77", date(9), dec!(1000));
        docs.push(DocumentKind::Purchase, "p-1", date(12), dec!(950));
        docs.push(DocumentKind::Expense, "far", date(20), dec!(1000));
        docs.push(DocumentKind::Expense, "weak", date(10), dec!(860));
        docs.push(DocumentKind::SaleOrder, "so-1", date(10), dec!(1000));

        let suggestions = suggest_matches(&fact, &docs).unwrap();
        let ids: Vec<&str> = suggestions.iter().map(|s| s.right_id.as_str()).collect();
        assert_eq!(ids, vec!["77", "p-1"]);
        assert_eq!(suggestions[0].score, 1.0);
        assert_eq!(suggestions[1].score, 0.75);
        assert_eq!(suggestions[1].right_type, "purchase");
    }

    #[test]
    fn test_inflow_suggestions_use_sale_orders_and_cap() {
        let (mut conn, bank) = setup();
        let fact = create_test_fact(&mut conn, bank, 10, dec!(500));

        let mut docs = InMemoryDocuments::default();
        for i in 0..25 {
            docs.push(DocumentKind::SaleOrder, &format!("so-{i}"), date(10), dec!(500) + Decimal::from(i));
        }
        docs.push(DocumentKind::Expense, "e-1", date(10), dec!(500));

        let suggestions = suggest_matches(&fact, &docs).unwrap();
        assert_eq!(suggestions.len(), 20);
        assert!(suggestions.iter().all(|s| s.right_type == "sale_order"));
        assert!(suggestions.windows(2).all(|w| w[0].score >= w[1].score));
        assert_eq!(suggestions[0].right_id, "so-0");

        let narrow = MatchScorer::with_thresholds(3, 0.35, 5).suggest(&fact, &docs).unwrap();
        assert_eq!(narrow.len(), 5);
    }

    #[test]
    fn test_create_match_twice_is_duplicate() {
        let (mut conn, bank) = setup();
        let fact = create_test_fact(&mut conn, bank, 10, dec!(-1000));

        let first = create_match(&mut conn, &NewMatch::new(fact.id, "expense", "77")).unwrap();
        assert_eq!(first.status, MatchStatus::Confirmed);
        assert!(first.confirmed_at.is_some());

        let err = create_match(&mut conn, &NewMatch::new(fact.id, "expense", "77")).unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateMatch { .. }));
        assert!(err.is_conflict());

        let all = list_matches(
            &conn,
            &MatchFilter {
                money_operation_id: Some(fact.id),
                ..MatchFilter::default()
            },
        )
        .unwrap();
        assert_eq!(all, vec![first]);
    }

    #[test]
    fn test_create_match_validation() {
        let (mut conn, bank) = setup();
        let fact = create_test_fact(&mut conn, bank, 10, dec!(-1000));

        let err = create_match(&mut conn, &NewMatch::new(fact.id, " ", "77")).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = create_match(&mut conn, &NewMatch::new(Uuid::new_v4(), "expense", "77")).unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_status_workflow() {
        let (mut conn, bank) = setup();
        let fact = create_test_fact(&mut conn, bank, 10, dec!(-1000));
        let suggestion = MatchSuggestion {
            right_type: "expense".to_string(),
            right_id: "77".to_string(),
            date: date(10),
            amount: dec!(1000),
            score: 1.0,
        };

        let recon = create_match(&mut conn, &NewMatch::from_suggestion(fact.id, &suggestion)).unwrap();
        assert_eq!(recon.status, MatchStatus::Suggested);
        assert!(recon.confirmed_at.is_none());

        let confirmed = confirm_match(&mut conn, recon.id).unwrap();
        assert_eq!(confirmed.status, MatchStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());

        let rejected = reject_match(&mut conn, recon.id).unwrap();
        assert_eq!(rejected.status, MatchStatus::Rejected);
        assert!(rejected.confirmed_at.is_none());

        let only_rejected = list_matches(
            &conn,
            &MatchFilter {
                status: Some(MatchStatus::Rejected),
                ..MatchFilter::default()
            },
        )
        .unwrap();
        assert_eq!(only_rejected.len(), 1);
        assert!(active_match_for(&conn, "expense", "77").unwrap().is_none());

        let actions: Vec<String> = audit::events_for_entity(&conn, "ReconciliationMatch", &recon.id.to_string())
            .unwrap()
            .into_iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(actions, vec!["create", "confirmed", "rejected"]);
    }

    #[test]
    fn test_locked_period_blocks_match_changes() {
        let (mut conn, bank) = setup();
        let fact = create_test_fact(&mut conn, bank, 10, dec!(-1000));
        let recon = create_match(&mut conn, &NewMatch::new(fact.id, "expense", "77")).unwrap();

        period::lock(&mut conn, fact.period(), Some("accountant"), None).unwrap();

        assert!(create_match(&mut conn, &NewMatch::new(fact.id, "expense", "78"))
            .unwrap_err()
            .is_period_locked());
        assert!(delete_match(&mut conn, recon.id).unwrap_err().is_period_locked());
        assert!(reject_match(&mut conn, recon.id).unwrap_err().is_period_locked());

        period::unlock(&mut conn, fact.period()).unwrap();
        assert!(delete_match(&mut conn, recon.id).unwrap());
        assert!(!delete_match(&mut conn, recon.id).unwrap());
    }
}
