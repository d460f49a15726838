// 🏦 Marketplace Payouts - find the bank inflow behind each payout day
//
// Marketplace payout lines are grouped per (marketplace, day) into a
// batch with a synthetic key:
//
//   payout:<marketplace>:<YYYY-MM-DD>:<|amount| 2dp>
//
// Each batch is scored against unvoided bank inflows near its date:
//
//   score = min(1, 0.6 * amount(6x) + 0.4 * max(0, 1 - days/4) + boost)
//
// auto_confirm links a batch to its best inflow only above a threshold.

use chrono::{Duration, NaiveDate};
use rusqlite::Connection;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit;
use crate::config::ReconciliationConfig;
use crate::db;
use crate::entities::account::{self, AccountKind};
use crate::error::{LedgerError, Result};
use crate::facts::{self, FactFilter, MoneyOperation};
use crate::money;
use crate::period;
use crate::reconciliation::{self, amount_score, MatchMethod, MatchStatus, ReconciliationMatch};

pub const PAYOUT_RIGHT_TYPE: &str = "marketplace_payout";

const TEXT_BOOST: f64 = 0.15;

// ============================================================================
// BATCHES
// ============================================================================

/// One payout operation reported by a marketplace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutLine {
    pub marketplace: String,
    pub operation_id: String,
    pub date: NaiveDate,
    pub amount: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutBatch {
    pub marketplace: String,
    pub date: NaiveDate,
    /// Signed sum as the marketplace reports it
    pub amount: Decimal,
    pub operation_ids: Vec<String>,
}

impl PayoutBatch {
    /// Group lines per (marketplace, day), ordered by day then marketplace
    pub fn group(lines: &[PayoutLine]) -> Vec<PayoutBatch> {
        let mut groups: BTreeMap<(NaiveDate, String), PayoutBatch> = BTreeMap::new();

        for line in lines {
            let marketplace = line.marketplace.trim().to_lowercase();
            let batch = groups
                .entry((line.date, marketplace.clone()))
                .or_insert_with(|| PayoutBatch {
                    marketplace,
                    date: line.date,
                    amount: Decimal::ZERO,
                    operation_ids: Vec::new(),
                });
            batch.amount += line.amount;
            batch.operation_ids.push(line.operation_id.clone());
        }

        groups.into_values().collect()
    }

    pub fn key(&self) -> String {
        format!(
            "payout:{}:{}:{}",
            self.marketplace,
            self.date.format("%Y-%m-%d"),
            money::format_2dp(self.amount.abs())
        )
    }

    /// What should land on the bank account
    pub fn expected_inflow(&self) -> Decimal {
        self.amount.abs()
    }
}

// ============================================================================
// SCORING
// ============================================================================

#[derive(Debug, Clone)]
pub struct PayoutScorer {
    window_days: i64,
    min_score: f64,
    top: usize,
    scan_limit: usize,
    tokens: Vec<String>,
}

impl PayoutScorer {
    pub fn from_config(config: &ReconciliationConfig) -> Self {
        PayoutScorer {
            window_days: config.payout_window_days,
            min_score: config.payout_min_score,
            top: config.payout_top,
            scan_limit: config.payout_scan_limit,
            tokens: config.marketplace_tokens.iter().map(|t| t.to_lowercase()).collect(),
        }
    }

    fn text_boost(&self, fact: &MoneyOperation) -> f64 {
        let text = format!(
            "{} {}",
            fact.counterparty.as_deref().unwrap_or(""),
            fact.description.as_deref().unwrap_or("")
        )
        .to_lowercase();

        if self.tokens.iter().any(|t| !t.is_empty() && text.contains(t.as_str())) {
            TEXT_BOOST
        } else {
            0.0
        }
    }

    /// Rounded to 3 decimals
    pub fn score(&self, batch: &PayoutBatch, fact: &MoneyOperation) -> f64 {
        let amount = amount_score(batch.expected_inflow(), fact.amount, 6.0);
        let days_apart = (fact.posted_date() - batch.date).num_days().abs() as f64;
        let date = (1.0 - days_apart / 4.0).max(0.0);

        money::round_score((0.6 * amount + 0.4 * date + self.text_boost(fact)).min(1.0))
    }

    /// Best candidate; ties keep the earlier one, zero scores never win
    fn best<'a>(&self, batch: &PayoutBatch, candidates: &'a [MoneyOperation]) -> Option<(f64, &'a MoneyOperation)> {
        let mut best: Option<(f64, &MoneyOperation)> = None;
        for fact in candidates {
            let score = self.score(batch, fact);
            if score > best.map_or(0.0, |(s, _)| s) {
                best = Some((score, fact));
            }
        }
        best
    }
}

impl Default for PayoutScorer {
    fn default() -> Self {
        Self::from_config(&ReconciliationConfig::default())
    }
}

/// Unvoided inflows on the chosen account within the batch dates ± window,
/// at most `scan_limit` facts. Without an explicit account the first active
/// bank account is used.
fn bank_candidates(
    conn: &Connection,
    account_id: Option<Uuid>,
    batches: &[PayoutBatch],
    scorer: &PayoutScorer,
) -> Result<Vec<MoneyOperation>> {
    let window_days = scorer.window_days;
    let account = match account_id {
        Some(id) => Some(account::get_account(conn, id)?),
        None => account::first_active_of_kind(conn, AccountKind::Bank)?,
    };
    let Some(account) = account else {
        debug!("no bank account for payout reconciliation");
        return Ok(Vec::new());
    };

    let (Some(first), Some(last)) = (
        batches.iter().map(|b| b.date).min(),
        batches.iter().map(|b| b.date).max(),
    ) else {
        return Ok(Vec::new());
    };

    let facts = facts::list_facts(
        conn,
        &FactFilter {
            account_id: Some(account.id),
            date_from: Some(first - Duration::days(window_days)),
            date_to: Some(last + Duration::days(window_days)),
            include_void: false,
            limit: scorer.scan_limit,
        },
    )?;

    Ok(facts.into_iter().filter(MoneyOperation::is_inflow).collect())
}

// ============================================================================
// SUGGESTIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutCandidate {
    pub fact: MoneyOperation,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutReconRow {
    pub payout_key: String,
    pub batch: PayoutBatch,
    pub expected_inflow: Decimal,
    pub suggestions: Vec<PayoutCandidate>,
    /// Existing suggested or confirmed match, confirmed first
    pub matched_fact_id: Option<Uuid>,
    pub match_status: Option<MatchStatus>,
}

pub fn payout_suggestions(
    conn: &Connection,
    lines: &[PayoutLine],
    account_id: Option<Uuid>,
    scorer: &PayoutScorer,
) -> Result<Vec<PayoutReconRow>> {
    let batches = PayoutBatch::group(lines);
    let candidates = bank_candidates(conn, account_id, &batches, scorer)?;

    let mut rows = Vec::with_capacity(batches.len());
    for batch in batches {
        let mut scored: Vec<PayoutCandidate> = candidates
            .iter()
            .map(|fact| PayoutCandidate {
                score: scorer.score(&batch, fact),
                fact: fact.clone(),
            })
            .filter(|c| c.score >= scorer.min_score)
            .collect();
        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(scorer.top);

        let payout_key = batch.key();
        let existing = reconciliation::active_match_for(conn, PAYOUT_RIGHT_TYPE, &payout_key)?;

        rows.push(PayoutReconRow {
            expected_inflow: batch.expected_inflow(),
            matched_fact_id: existing.as_ref().map(|m| m.money_operation_id),
            match_status: existing.as_ref().map(|m| m.status),
            suggestions: scored,
            payout_key,
            batch,
        });
    }

    Ok(rows)
}

// ============================================================================
// AUTO CONFIRM
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoConfirmParams {
    pub account_id: Option<Uuid>,
    pub threshold: f64,
}

impl AutoConfirmParams {
    pub fn from_config(config: &ReconciliationConfig, account_id: Option<Uuid>) -> Self {
        AutoConfirmParams {
            account_id,
            threshold: config.auto_confirm_threshold,
        }
    }
}

impl Default for AutoConfirmParams {
    fn default() -> Self {
        AutoConfirmParams {
            account_id: None,
            threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AutoConfirmReport {
    pub scanned: usize,
    pub confirmed: usize,
    pub skipped_existing: usize,
    pub skipped_locked: usize,
    pub below_threshold: usize,
    pub errors: Vec<String>,
}

enum Outcome {
    Confirmed,
    Existing,
    Locked,
}

/// Confirm each unmatched batch against its best inflow when the score
/// reaches `threshold`. Safe to re-run: existing matches are skipped.
pub fn auto_confirm(
    conn: &mut Connection,
    lines: &[PayoutLine],
    params: &AutoConfirmParams,
    scorer: &PayoutScorer,
) -> Result<AutoConfirmReport> {
    if !(0.0..=1.0).contains(&params.threshold) {
        return Err(LedgerError::validation(format!(
            "threshold must be in [0, 1], got {}",
            params.threshold
        )));
    }

    let batches = PayoutBatch::group(lines);
    let candidates = bank_candidates(conn, params.account_id, &batches, scorer)?;
    let mut report = AutoConfirmReport {
        scanned: batches.len(),
        ..AutoConfirmReport::default()
    };

    for batch in &batches {
        let payout_key = batch.key();

        if reconciliation::active_match_for(conn, PAYOUT_RIGHT_TYPE, &payout_key)?.is_some() {
            report.skipped_existing += 1;
            continue;
        }

        let Some((score, best)) = scorer.best(batch, &candidates) else {
            report.below_threshold += 1;
            continue;
        };
        if score < params.threshold {
            debug!(payout_key = %payout_key, score, "payout left for review");
            report.below_threshold += 1;
            continue;
        }

        match confirm_payout(conn, &payout_key, best, score) {
            Ok(Outcome::Confirmed) => report.confirmed += 1,
            Ok(Outcome::Existing) => report.skipped_existing += 1,
            Ok(Outcome::Locked) => report.skipped_locked += 1,
            Err(err) => {
                warn!(payout_key = %payout_key, error = %err, "payout auto_confirm failed");
                report.errors.push(format!("{payout_key}: {err}"));
            }
        }
    }

    if report.confirmed > 0 {
        audit::record(
            conn,
            "PayoutReconcile",
            &db::opt_uuid_text(params.account_id).unwrap_or_else(|| "default_bank".to_string()),
            "auto_confirm",
            Some(json!({
                "threshold": params.threshold,
                "scanned": report.scanned,
                "confirmed": report.confirmed,
            })),
        )?;
    }

    info!(
        scanned = report.scanned,
        confirmed = report.confirmed,
        skipped_existing = report.skipped_existing,
        skipped_locked = report.skipped_locked,
        below_threshold = report.below_threshold,
        errors = report.errors.len(),
        "payout auto_confirm finished"
    );

    Ok(report)
}

fn confirm_payout(conn: &mut Connection, payout_key: &str, fact: &MoneyOperation, score: f64) -> Result<Outcome> {
    let tx = conn.transaction()?;

    match period::assert_unlocked(&tx, &fact.posted_at) {
        Ok(()) => {}
        Err(LedgerError::PeriodLocked { .. }) => return Ok(Outcome::Locked),
        Err(err) => return Err(err),
    }

    let now = db::utc_now();
    let recon = ReconciliationMatch {
        id: Uuid::new_v4(),
        money_operation_id: fact.id,
        right_type: PAYOUT_RIGHT_TYPE.to_string(),
        right_id: payout_key.to_string(),
        method: MatchMethod::Auto,
        score: Some(score),
        status: MatchStatus::Confirmed,
        note: Some(format!("auto_confirm score={score}")),
        created_at: now,
        confirmed_at: Some(now),
    };

    match reconciliation::insert_match(&tx, &recon) {
        Ok(()) => {}
        Err(LedgerError::DuplicateMatch { .. }) => return Ok(Outcome::Existing),
        Err(err) => return Err(err),
    }

    tx.commit()?;
    info!(payout_key, fact_id = %fact.id, score, "payout matched");
    Ok(Outcome::Confirmed)
}

// ============================================================================
// TESTS
// ============================================================================
