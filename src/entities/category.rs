// 🏷️ Category Entity - hierarchical classification buckets
//
// "Category name is a VALUE (can change), Category UUID is IDENTITY (never changes)"
//
// Categories form a tree (parent pointers, no cycles). System categories
// (the internal transfer bucket) are protected: they cannot be renamed,
// deactivated or deleted. Lookups by name ignore case, per category type.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

use crate::audit::{self, FieldChange};
use crate::db::{self, opt_parsed_col, parsed_col};
use crate::entities::account::name_key;
use crate::error::{LedgerError, Result};

// ============================================================================
// CATEGORY TYPE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryType {
    /// Money coming in
    Income,

    /// Money going out
    Expense,

    /// Movement between own accounts (neutral)
    Transfer,

    /// Corrections of opening balances
    BalanceAdjustment,
}

impl CategoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryType::Income => "income",
            CategoryType::Expense => "expense",
            CategoryType::Transfer => "transfer",
            CategoryType::BalanceAdjustment => "balance_adjustment",
        }
    }
}

impl fmt::Display for CategoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CategoryType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "income" => Ok(CategoryType::Income),
            "expense" => Ok(CategoryType::Expense),
            "transfer" => Ok(CategoryType::Transfer),
            "balance_adjustment" => Ok(CategoryType::BalanceAdjustment),
            other => Err(LedgerError::validation(format!("unknown category type: {other}"))),
        }
    }
}

// ============================================================================
// CATEGORY ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    /// Stable identity - NEVER changes
    pub id: Uuid,

    /// Display name (e.g. "Налоги", "Аренда")
    pub name: String,

    pub category_type: CategoryType,

    /// Parent category (None = root)
    pub parent_id: Option<Uuid>,

    pub is_tax_related: bool,
    pub is_payroll_related: bool,

    /// Protected from rename / deactivation / deletion
    pub is_system: bool,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Category {
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCategory {
    pub name: String,
    pub category_type: CategoryType,
    pub parent_id: Option<Uuid>,
    pub is_tax_related: bool,
    pub is_payroll_related: bool,
    pub is_system: bool,
}

impl NewCategory {
    pub fn new(name: &str, category_type: CategoryType) -> Self {
        NewCategory {
            name: name.to_string(),
            category_type,
            parent_id: None,
            is_tax_related: false,
            is_payroll_related: false,
            is_system: false,
        }
    }
}

/// What `retire_category` actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireOutcome {
    /// Nothing referenced it, the row is gone
    Deleted,
    /// Still referenced, kept but inactive
    Deactivated,
}

const CATEGORY_COLUMNS: &str = "id, name, category_type, parent_id, is_tax_related, \
     is_payroll_related, is_system, is_active, created_at, updated_at";

fn category_from_row(row: &Row<'_>) -> rusqlite::Result<Category> {
    Ok(Category {
        id: parsed_col(row, 0)?,
        name: row.get(1)?,
        category_type: parsed_col(row, 2)?,
        parent_id: opt_parsed_col(row, 3)?,
        is_tax_related: row.get(4)?,
        is_payroll_related: row.get(5)?,
        is_system: row.get(6)?,
        is_active: row.get(7)?,
        created_at: parsed_col(row, 8)?,
        updated_at: parsed_col(row, 9)?,
    })
}

// ============================================================================
// LOOKUPS
// ============================================================================

pub fn get_category(conn: &Connection, id: Uuid) -> Result<Category> {
    conn.query_row(
        &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE id = ?1"),
        params![id.to_string()],
        category_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("category", id))
}

/// Category that may receive allocations or rules
pub(crate) fn require_active(conn: &Connection, id: Uuid) -> Result<Category> {
    let category = get_category(conn, id)?;
    if !category.is_active {
        return Err(LedgerError::CategoryInactive(id));
    }
    Ok(category)
}

pub fn find_category(conn: &Connection, category_type: CategoryType, name: &str) -> Result<Option<Category>> {
    let category = conn
        .query_row(
            &format!("SELECT {CATEGORY_COLUMNS} FROM categories WHERE category_type = ?1 AND name_key = ?2"),
            params![category_type.as_str(), name_key(name)],
            category_from_row,
        )
        .optional()?;

    Ok(category)
}

/// First active system category of a type (e.g. the transfer bucket)
pub fn find_system_category(conn: &Connection, category_type: CategoryType) -> Result<Option<Category>> {
    let category = conn
        .query_row(
            &format!(
                "SELECT {CATEGORY_COLUMNS} FROM categories
                 WHERE category_type = ?1 AND is_system = 1 AND is_active = 1
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1"
            ),
            params![category_type.as_str()],
            category_from_row,
        )
        .optional()?;

    Ok(category)
}

/// Categories ordered by type, then name
pub fn list_categories(conn: &Connection, active_only: bool) -> Result<Vec<Category>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CATEGORY_COLUMNS} FROM categories
         WHERE (?1 = 0 OR is_active = 1)
         ORDER BY category_type ASC, name_key ASC"
    ))?;

    let categories = stmt
        .query_map(params![active_only], category_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(categories)
}

fn category_count(conn: &Connection) -> Result<usize> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM categories", [], |row| row.get(0))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

/// Parent chain, nearest first, up to the root
pub fn ancestors(conn: &Connection, id: Uuid) -> Result<Vec<Category>> {
    let start = get_category(conn, id)?;
    let limit = category_count(conn)?;

    let mut chain = Vec::new();
    let mut next = start.parent_id;
    while let Some(parent_id) = next {
        if chain.len() >= limit {
            // corrupted data: a cycle that slipped past set_parent
            return Err(LedgerError::CategoryCycle {
                category_id: id,
                parent_id,
            });
        }
        let parent = get_category(conn, parent_id)?;
        next = parent.parent_id;
        chain.push(parent);
    }

    Ok(chain)
}

// ============================================================================
// MUTATIONS
// ============================================================================

/// Idempotent upsert by (type, name ignoring case).
/// Flags are only ever raised; an inactive match is re-activated.
pub fn ensure_category(conn: &mut Connection, new: &NewCategory) -> Result<Category> {
    let tx = conn.transaction()?;
    let category = ensure_category_in(&tx, new)?;
    tx.commit()?;
    Ok(category)
}

pub(crate) fn ensure_category_in(conn: &Connection, new: &NewCategory) -> Result<Category> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(LedgerError::validation("category name is required"));
    }

    if let Some(existing) = find_category(conn, new.category_type, name)? {
        return raise_flags(conn, existing, new);
    }

    if let Some(parent_id) = new.parent_id {
        get_category(conn, parent_id)?;
    }

    let now = db::utc_now();
    let category = Category {
        id: Uuid::new_v4(),
        name: name.to_string(),
        category_type: new.category_type,
        parent_id: new.parent_id,
        is_tax_related: new.is_tax_related,
        is_payroll_related: new.is_payroll_related,
        is_system: new.is_system,
        is_active: true,
        created_at: now,
        updated_at: now,
    };

    conn.execute(
        "INSERT INTO categories (
            id, name, name_key, category_type, parent_id, is_tax_related,
            is_payroll_related, is_system, is_active, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?9)",
        params![
            category.id.to_string(),
            category.name,
            name_key(name),
            category.category_type.as_str(),
            db::opt_uuid_text(category.parent_id),
            category.is_tax_related,
            category.is_payroll_related,
            category.is_system,
            db::timestamp(&now),
        ],
    )?;

    audit::record(
        conn,
        "Category",
        &category.id.to_string(),
        "create",
        Some(serde_json::to_value(&category)?),
    )?;

    info!(category_id = %category.id, name = %category.name, category_type = %category.category_type, "category created");
    Ok(category)
}

fn raise_flags(conn: &Connection, mut existing: Category, new: &NewCategory) -> Result<Category> {
    let mut changes = Vec::new();

    if new.is_tax_related && !existing.is_tax_related {
        changes.push(FieldChange::new("is_tax_related", false, true));
        existing.is_tax_related = true;
    }
    if new.is_payroll_related && !existing.is_payroll_related {
        changes.push(FieldChange::new("is_payroll_related", false, true));
        existing.is_payroll_related = true;
    }
    if new.is_system && !existing.is_system {
        changes.push(FieldChange::new("is_system", false, true));
        existing.is_system = true;
    }
    if !existing.is_active {
        changes.push(FieldChange::new("is_active", false, true));
        existing.is_active = true;
    }

    if changes.is_empty() {
        return Ok(existing);
    }

    existing.updated_at = db::utc_now();
    conn.execute(
        "UPDATE categories
         SET is_tax_related = ?2, is_payroll_related = ?3, is_system = ?4, is_active = ?5, updated_at = ?6
         WHERE id = ?1",
        params![
            existing.id.to_string(),
            existing.is_tax_related,
            existing.is_payroll_related,
            existing.is_system,
            existing.is_active,
            db::timestamp(&existing.updated_at),
        ],
    )?;

    audit::record(
        conn,
        "Category",
        &existing.id.to_string(),
        "update",
        Some(audit::changes_to_json(&changes)),
    )?;

    debug!(category_id = %existing.id, changed = changes.len(), "category flags raised");
    Ok(existing)
}

/// Move a category under `parent_id` (None = make it a root).
pub fn set_parent(conn: &mut Connection, id: Uuid, parent_id: Option<Uuid>) -> Result<Category> {
    let tx = conn.transaction()?;
    let mut category = get_category(&tx, id)?;

    if let Some(parent_id) = parent_id {
        get_category(&tx, parent_id)?;
        ensure_no_cycle(&tx, id, parent_id)?;
    }

    if category.parent_id != parent_id {
        let change = FieldChange::new("parent_id", category.parent_id, parent_id);
        category.parent_id = parent_id;
        category.updated_at = db::utc_now();

        tx.execute(
            "UPDATE categories SET parent_id = ?2, updated_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                db::opt_uuid_text(parent_id),
                db::timestamp(&category.updated_at),
            ],
        )?;
        audit::record(
            &tx,
            "Category",
            &id.to_string(),
            "update",
            Some(audit::changes_to_json(&[change])),
        )?;
    }

    tx.commit()?;
    Ok(category)
}

/// Walk up from the proposed parent; reaching `id` means a cycle.
/// Bounded by the number of categories so bad data cannot loop forever.
fn ensure_no_cycle(conn: &Connection, id: Uuid, parent_id: Uuid) -> Result<()> {
    let cycle = LedgerError::CategoryCycle {
        category_id: id,
        parent_id,
    };

    let limit = category_count(conn)?;
    let mut current = Some(parent_id);
    let mut steps = 0;

    while let Some(node) = current {
        if node == id || steps > limit {
            return Err(cycle);
        }
        current = get_category(conn, node)?.parent_id;
        steps += 1;
    }

    Ok(())
}

pub fn rename_category(conn: &mut Connection, id: Uuid, new_name: &str) -> Result<Category> {
    let tx = conn.transaction()?;
    let mut category = get_category(&tx, id)?;

    if category.is_system {
        return Err(LedgerError::SystemCategoryProtected(id));
    }

    let name = new_name.trim();
    if name.is_empty() {
        return Err(LedgerError::validation("category name is required"));
    }
    if name == category.name {
        return Ok(category);
    }

    if let Some(other) = find_category(&tx, category.category_type, name)? {
        if other.id != id {
            return Err(LedgerError::validation(format!(
                "category '{name}' already exists for type {}",
                category.category_type
            )));
        }
    }

    let change = FieldChange::new("name", &category.name, name);
    category.name = name.to_string();
    category.updated_at = db::utc_now();

    tx.execute(
        "UPDATE categories SET name = ?2, name_key = ?3, updated_at = ?4 WHERE id = ?1",
        params![
            id.to_string(),
            category.name,
            name_key(name),
            db::timestamp(&category.updated_at),
        ],
    )?;
    audit::record(
        &tx,
        "Category",
        &id.to_string(),
        "update",
        Some(audit::changes_to_json(&[change])),
    )?;

    tx.commit()?;
    Ok(category)
}

pub fn deactivate_category(conn: &mut Connection, id: Uuid) -> Result<Category> {
    let tx = conn.transaction()?;
    let category = deactivate_in(&tx, id)?;
    tx.commit()?;
    Ok(category)
}

fn deactivate_in(conn: &Connection, id: Uuid) -> Result<Category> {
    let mut category = get_category(conn, id)?;

    if category.is_system {
        return Err(LedgerError::SystemCategoryProtected(id));
    }
    if !category.is_active {
        return Ok(category);
    }

    category.is_active = false;
    category.updated_at = db::utc_now();

    conn.execute(
        "UPDATE categories SET is_active = 0, updated_at = ?2 WHERE id = ?1",
        params![id.to_string(), db::timestamp(&category.updated_at)],
    )?;
    audit::record(
        conn,
        "Category",
        &id.to_string(),
        "deactivate",
        Some(json!({ "is_active": { "from": true, "to": false } })),
    )?;

    info!(category_id = %id, "category deactivated");
    Ok(category)
}

/// Delete when nothing references the category, otherwise deactivate it
pub fn retire_category(conn: &mut Connection, id: Uuid) -> Result<RetireOutcome> {
    let tx = conn.transaction()?;
    let category = get_category(&tx, id)?;

    if category.is_system {
        return Err(LedgerError::SystemCategoryProtected(id));
    }

    let references: i64 = tx.query_row(
        "SELECT
            (SELECT COUNT(*) FROM money_allocations WHERE category_id = ?1)
          + (SELECT COUNT(*) FROM money_rules WHERE category_id = ?1)
          + (SELECT COUNT(*) FROM categories WHERE parent_id = ?1)",
        params![id.to_string()],
        |row| row.get(0),
    )?;

    let outcome = if references > 0 {
        deactivate_in(&tx, id)?;
        RetireOutcome::Deactivated
    } else {
        tx.execute("DELETE FROM categories WHERE id = ?1", params![id.to_string()])?;
        audit::record(
            &tx,
            "Category",
            &id.to_string(),
            "delete",
            Some(serde_json::to_value(&category)?),
        )?;
        RetireOutcome::Deleted
    };

    tx.commit()?;
    info!(category_id = %id, ?outcome, references, "category retired");
    Ok(outcome)
}

// ============================================================================
// TESTS
// ============================================================================
