// 🏷️ Classification Rules - Rules as Data
// Keyword rules that map a money fact to a suggested category
//
// Rules are rows, editable by the user. Evaluation order is
// priority desc, then newest first; the first matching rule wins and
// nothing is blended.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Reverse;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{self, FieldChange};
use crate::db::{self, opt_parsed_col, parsed_col};
use crate::entities::{account, category};
use crate::error::{LedgerError, Result};
use crate::facts::MoneyOperation;

// ============================================================================
// MATCH FIELD / DIRECTION
// ============================================================================

/// Which part of a fact the pattern is matched against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchField {
    /// Counterparty and description together
    #[default]
    Text,
    Counterparty,
    Description,
    Source,
}

impl MatchField {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchField::Text => "text",
            MatchField::Counterparty => "counterparty",
            MatchField::Description => "description",
            MatchField::Source => "source",
        }
    }

    /// Lower-cased text of `fact` this field selects
    pub fn extract(&self, fact: &MoneyOperation) -> String {
        match self {
            MatchField::Text => fact.text_blob(),
            MatchField::Counterparty => fact.counterparty.as_deref().unwrap_or("").to_lowercase(),
            MatchField::Description => fact.description.as_deref().unwrap_or("").to_lowercase(),
            MatchField::Source => fact.source.to_lowercase(),
        }
    }
}

impl fmt::Display for MatchField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchField {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" => Ok(MatchField::Text),
            "counterparty" => Ok(MatchField::Counterparty),
            "description" => Ok(MatchField::Description),
            "source" => Ok(MatchField::Source),
            other => Err(LedgerError::validation(format!("unknown match field: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Inflows only (amount > 0)
    In,
    /// Outflows only (amount < 0)
    Out,
    #[default]
    Any,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
            Direction::Any => "any",
        }
    }

    pub fn accepts(&self, fact: &MoneyOperation) -> bool {
        match self {
            Direction::In => fact.is_inflow(),
            Direction::Out => fact.is_outflow(),
            Direction::Any => true,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            "any" => Ok(Direction::Any),
            other => Err(LedgerError::validation(format!("unknown direction: {other}"))),
        }
    }
}

// ============================================================================
// KEYWORD PATTERN
// ============================================================================

/// `"фнс|налог, усн; ндс"` → ["фнс", "налог", "усн", "ндс"]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordPattern {
    keywords: Vec<String>,
}

impl KeywordPattern {
    pub fn parse(pattern: &str) -> Self {
        let keywords = pattern
            .split(['|', ',', ';'])
            .map(|k| k.trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();

        KeywordPattern { keywords }
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    /// Substring match of any keyword; `text` is expected lower-cased.
    /// An empty pattern never matches.
    pub fn matches(&self, text: &str) -> bool {
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

// ============================================================================
// RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoneyRule {
    pub id: Uuid,

    /// Description/notes about this rule
    pub name: Option<String>,

    pub match_field: MatchField,

    /// Keyword alternatives separated by `|`, `,` or `;`
    pub pattern: String,

    pub direction: Direction,

    /// Only facts of this account (None = any account)
    pub account_id: Option<Uuid>,

    /// Category to suggest
    pub category_id: Uuid,

    /// Confidence score (0.0 - 1.0]
    pub confidence: f64,

    /// Priority (higher = applied first)
    pub priority: i32,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MoneyRule {
    /// Direction, account scope and pattern all accept `fact`
    pub fn matches(&self, fact: &MoneyOperation) -> bool {
        self.matches_with(&KeywordPattern::parse(&self.pattern), fact)
    }

    fn matches_with(&self, pattern: &KeywordPattern, fact: &MoneyOperation) -> bool {
        if !self.direction.accepts(fact) {
            return false;
        }
        if let Some(account_id) = self.account_id {
            if account_id != fact.account_id {
                return false;
            }
        }
        pattern.matches(&self.match_field.extract(fact))
    }
}

// ============================================================================
// SUGGESTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSuggestion {
    pub rule_id: Uuid,
    pub category_id: Uuid,
    pub confidence: f64,
}

// ============================================================================
// RULE ENGINE
// ============================================================================

pub struct RuleEngine {
    rules: Vec<(MoneyRule, KeywordPattern)>,
}

impl RuleEngine {
    /// Create engine from a list of rules. Inactive rules are dropped;
    /// the rest are ordered by priority desc, then created_at desc
    /// (full ties keep their input order).
    pub fn from_rules(rules: Vec<MoneyRule>) -> Self {
        let mut rules: Vec<(MoneyRule, KeywordPattern)> = rules
            .into_iter()
            .filter(|r| r.is_active)
            .map(|r| {
                let pattern = KeywordPattern::parse(&r.pattern);
                (r, pattern)
            })
            .collect();

        rules.sort_by_key(|(r, _)| (Reverse(r.priority), Reverse(r.created_at)));
        RuleEngine { rules }
    }

    /// First matching rule, if any. Voided facts and transfer legs are
    /// never classified.
    pub fn suggest(&self, fact: &MoneyOperation) -> Option<RuleSuggestion> {
        if fact.is_void || fact.is_transfer() {
            return None;
        }

        self.rules
            .iter()
            .find(|(rule, pattern)| rule.matches_with(pattern, fact))
            .map(|(rule, _)| RuleSuggestion {
                rule_id: rule.id,
                category_id: rule.category_id,
                confidence: rule.confidence,
            })
    }

    /// Rules in evaluation order
    pub fn rules(&self) -> impl Iterator<Item = &MoneyRule> {
        self.rules.iter().map(|(r, _)| r)
    }

    /// Get number of rules loaded
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }
}

// ============================================================================
// STORAGE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub name: Option<String>,
    pub match_field: MatchField,
    pub pattern: String,
    pub direction: Direction,
    pub account_id: Option<Uuid>,
    pub category_id: Uuid,
    pub confidence: f64,
    pub priority: i32,
}

/// Only the `Some` fields change. `account_id: Some(None)` removes the scope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RulePatch {
    pub name: Option<String>,
    pub match_field: Option<MatchField>,
    pub pattern: Option<String>,
    pub direction: Option<Direction>,
    pub account_id: Option<Option<Uuid>>,
    pub category_id: Option<Uuid>,
    pub confidence: Option<f64>,
    pub priority: Option<i32>,
    pub is_active: Option<bool>,
}

const RULE_COLUMNS: &str = "id, name, match_field, pattern, direction, account_id, category_id, \
     confidence, priority, is_active, created_at, updated_at";

/// Evaluation order; rowid breaks ties between rules created in the same instant
const RULE_ORDER: &str = "ORDER BY priority DESC, created_at DESC, rowid DESC";

fn rule_from_row(row: &Row<'_>) -> rusqlite::Result<MoneyRule> {
    Ok(MoneyRule {
        id: parsed_col(row, 0)?,
        name: row.get(1)?,
        match_field: parsed_col(row, 2)?,
        pattern: row.get(3)?,
        direction: parsed_col(row, 4)?,
        account_id: opt_parsed_col(row, 5)?,
        category_id: parsed_col(row, 6)?,
        confidence: row.get(7)?,
        priority: row.get(8)?,
        is_active: row.get(9)?,
        created_at: parsed_col(row, 10)?,
        updated_at: parsed_col(row, 11)?,
    })
}

fn validate_pattern(pattern: &str) -> Result<String> {
    let pattern = pattern.trim();
    if KeywordPattern::parse(pattern).is_empty() {
        return Err(LedgerError::validation("pattern must contain at least one keyword"));
    }
    Ok(pattern.to_string())
}

fn validate_confidence(confidence: f64) -> Result<()> {
    if !(confidence > 0.0 && confidence <= 1.0) {
        return Err(LedgerError::validation(format!(
            "confidence must be in (0, 1], got {confidence}"
        )));
    }
    Ok(())
}

fn validate_scope(conn: &Connection, category_id: Uuid, account_id: Option<Uuid>) -> Result<()> {
    category::require_active(conn, category_id)?;
    if let Some(account_id) = account_id {
        account::require_active(conn, account_id)?;
    }
    Ok(())
}

pub fn create_rule(conn: &mut Connection, new: &NewRule) -> Result<MoneyRule> {
    let tx = conn.transaction()?;
    let rule = create_rule_in(&tx, new)?;
    tx.commit()?;
    Ok(rule)
}

pub(crate) fn create_rule_in(conn: &Connection, new: &NewRule) -> Result<MoneyRule> {
    let pattern = validate_pattern(&new.pattern)?;
    validate_confidence(new.confidence)?;
    validate_scope(conn, new.category_id, new.account_id)?;

    let now = db::utc_now();
    let rule = MoneyRule {
        id: Uuid::new_v4(),
        name: new.name.as_deref().map(str::trim).filter(|n| !n.is_empty()).map(str::to_string),
        match_field: new.match_field,
        pattern,
        direction: new.direction,
        account_id: new.account_id,
        category_id: new.category_id,
        confidence: new.confidence,
        priority: new.priority,
        is_active: true,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO money_rules (
            id, name, match_field, pattern, direction, account_id, category_id,
            confidence, priority, is_active, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, ?10, ?10)",
        params![
            rule.id.to_string(),
            rule.name,
            rule.match_field.as_str(),
            rule.pattern,
            rule.direction.as_str(),
            db::opt_uuid_text(rule.account_id),
            rule.category_id.to_string(),
            rule.confidence,
            rule.priority,
            db::timestamp(&now),
        ],
    )?;

    audit::record(
        conn,
        "MoneyRule",
        &rule.id.to_string(),
        "create",
        Some(json!({
            "name": rule.name,
            "pattern": rule.pattern,
            "direction": rule.direction.as_str(),
            "category_id": rule.category_id,
            "confidence": rule.confidence,
            "priority": rule.priority,
        })),
    )?;

    info!(rule_id = %rule.id, pattern = %rule.pattern, priority = rule.priority, "rule created");
    Ok(rule)
}

/// Apply a patch; every changed field is audited as `{from, to}`
pub fn patch_rule(conn: &mut Connection, id: Uuid, patch: &RulePatch) -> Result<MoneyRule> {
    let tx = conn.transaction()?;
    let mut rule = get_rule(&tx, id)?;
    let mut changes = Vec::new();

    if let Some(name) = &patch.name {
        let name = Some(name.trim().to_string()).filter(|n| !n.is_empty());
        if name != rule.name {
            changes.push(FieldChange::new("name", &rule.name, &name));
            rule.name = name;
        }
    }
    if let Some(match_field) = patch.match_field {
        if match_field != rule.match_field {
            changes.push(FieldChange::new("match_field", rule.match_field, match_field));
            rule.match_field = match_field;
        }
    }
    if let Some(pattern) = &patch.pattern {
        let pattern = validate_pattern(pattern)?;
        if pattern != rule.pattern {
            changes.push(FieldChange::new("pattern", &rule.pattern, &pattern));
            rule.pattern = pattern;
        }
    }
    if let Some(direction) = patch.direction {
        if direction != rule.direction {
            changes.push(FieldChange::new("direction", rule.direction, direction));
            rule.direction = direction;
        }
    }
    if let Some(account_id) = patch.account_id {
        if account_id != rule.account_id {
            changes.push(FieldChange::new("account_id", rule.account_id, account_id));
            rule.account_id = account_id;
        }
    }
    if let Some(category_id) = patch.category_id {
        if category_id != rule.category_id {
            changes.push(FieldChange::new("category_id", rule.category_id, category_id));
            rule.category_id = category_id;
        }
    }
    if let Some(confidence) = patch.confidence {
        validate_confidence(confidence)?;
        if confidence != rule.confidence {
            changes.push(FieldChange::new("confidence", rule.confidence, confidence));
            rule.confidence = confidence;
        }
    }
    if let Some(priority) = patch.priority {
        if priority != rule.priority {
            changes.push(FieldChange::new("priority", rule.priority, priority));
            rule.priority = priority;
        }
    }
    if let Some(is_active) = patch.is_active {
        if is_active != rule.is_active {
            changes.push(FieldChange::new("is_active", rule.is_active, is_active));
            rule.is_active = is_active;
        }
    }

    if changes.is_empty() {
        return Ok(rule);
    }

    if rule.is_active {
        validate_scope(&tx, rule.category_id, rule.account_id)?;
    }

    rule.updated_at = db::utc_now();
    save_rule(&tx, &rule)?;
    audit::record(
        &tx,
        "MoneyRule",
        &id.to_string(),
        "update",
        Some(audit::changes_to_json(&changes)),
    )?;

    tx.commit()?;
    debug!(rule_id = %id, changed = changes.len(), "rule patched");

    Ok(rule)
}

pub fn deactivate_rule(conn: &mut Connection, id: Uuid) -> Result<MoneyRule> {
    patch_rule(
        conn,
        id,
        &RulePatch {
            is_active: Some(false),
            ..RulePatch::default()
        },
    )
}

fn save_rule(conn: &Connection, rule: &MoneyRule) -> Result<()> {
    conn.execute(
        "UPDATE money_rules
         SET name = ?2, match_field = ?3, pattern = ?4, direction = ?5, account_id = ?6,
             category_id = ?7, confidence = ?8, priority = ?9, is_active = ?10, updated_at = ?11
         WHERE id = ?1",
        params![
            rule.id.to_string(),
            rule.name,
            rule.match_field.as_str(),
            rule.pattern,
            rule.direction.as_str(),
            db::opt_uuid_text(rule.account_id),
            rule.category_id.to_string(),
            rule.confidence,
            rule.priority,
            rule.is_active,
            db::timestamp(&rule.updated_at),
        ],
    )?;
    Ok(())
}

pub fn get_rule(conn: &Connection, id: Uuid) -> Result<MoneyRule> {
    conn.query_row(
        &format!("SELECT {RULE_COLUMNS} FROM money_rules WHERE id = ?1"),
        params![id.to_string()],
        rule_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("rule", id))
}

/// Rules in evaluation order
pub fn list_rules(conn: &Connection, active_only: bool) -> Result<Vec<MoneyRule>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULE_COLUMNS} FROM money_rules WHERE (?1 = 0 OR is_active = 1) {RULE_ORDER}"
    ))?;

    let rules = stmt
        .query_map(params![active_only], rule_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rules)
}

pub fn count_rules(conn: &Connection) -> Result<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM money_rules", [], |row| row.get(0))?;
    Ok(count)
}

/// Engine over the active rules whose category is still active
pub fn load_engine(conn: &Connection) -> Result<RuleEngine> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {RULE_COLUMNS} FROM money_rules
         WHERE is_active = 1
           AND category_id IN (SELECT id FROM categories WHERE is_active = 1)
         {RULE_ORDER}"
    ))?;

    let rules = stmt
        .query_map([], rule_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(RuleEngine::from_rules(rules))
}

// ============================================================================
// TESTS
// ============================================================================
