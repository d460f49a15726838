// 💳 Account Entity - where money physically sits
//
// "Account name is a VALUE, Account UUID is IDENTITY"
//
// Bank current account, cash desk, marketplace balances, acquiring.
// Accounts are created idempotently by name and never deleted: facts
// reference them forever, so retiring one means deactivating it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tracing::info;
use uuid::Uuid;

use crate::audit;
use crate::db::{self, parsed_col};
use crate::error::{LedgerError, Result};

/// Currency used when neither the caller nor the account names one
pub const DEFAULT_CURRENCY: &str = "RUB";

// ============================================================================
// ACCOUNT KIND
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountKind {
    /// Settlement account at a bank
    Bank,

    /// Cash desk
    Cash,

    /// Balance held by a marketplace until payout
    Marketplace,

    /// Card acquiring / online payments
    Acquiring,

    Other,
}

impl AccountKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountKind::Bank => "bank",
            AccountKind::Cash => "cash",
            AccountKind::Marketplace => "marketplace",
            AccountKind::Acquiring => "acquiring",
            AccountKind::Other => "other",
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "bank" => Ok(AccountKind::Bank),
            "cash" => Ok(AccountKind::Cash),
            "marketplace" => Ok(AccountKind::Marketplace),
            "acquiring" => Ok(AccountKind::Acquiring),
            "other" => Ok(AccountKind::Other),
            other => Err(LedgerError::validation(format!("unknown account kind: {other}"))),
        }
    }
}

// ============================================================================
// ACCOUNT ENTITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Stable identity - NEVER changes
    pub id: Uuid,

    pub kind: AccountKind,

    /// Display name, unique ignoring case (e.g. "Банк (р/с)")
    pub name: String,

    /// ISO code, upper-case
    pub currency: String,

    /// Bank account number, marketplace cabinet id, ...
    pub external_ref: Option<String>,

    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAccount {
    pub kind: AccountKind,
    pub name: String,
    pub currency: Option<String>,
    pub external_ref: Option<String>,
}

impl NewAccount {
    pub fn new(kind: AccountKind, name: &str) -> Self {
        NewAccount {
            kind,
            name: name.to_string(),
            currency: None,
            external_ref: None,
        }
    }
}

/// Case-insensitive identity key for names (works for Cyrillic too)
pub(crate) fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

const ACCOUNT_COLUMNS: &str = "id, kind, name, currency, external_ref, is_active, created_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: parsed_col(row, 0)?,
        kind: parsed_col(row, 1)?,
        name: row.get(2)?,
        currency: row.get(3)?,
        external_ref: row.get(4)?,
        is_active: row.get(5)?,
        created_at: parsed_col(row, 6)?,
    })
}

// ============================================================================
// OPERATIONS
// ============================================================================

/// Create an account, or return the existing one with the same name
pub fn create_account(conn: &mut Connection, new: &NewAccount) -> Result<Account> {
    let tx = conn.transaction()?;
    let account = create_account_in(&tx, new)?;
    tx.commit()?;
    Ok(account)
}

pub(crate) fn create_account_in(conn: &Connection, new: &NewAccount) -> Result<Account> {
    let name = new.name.trim();
    if name.is_empty() {
        return Err(LedgerError::validation("account name is required"));
    }

    let key = name_key(name);
    if let Some(existing) = find_by_key(conn, &key)? {
        return Ok(existing);
    }

    let currency = new
        .currency
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(DEFAULT_CURRENCY)
        .to_uppercase();

    let account = Account {
        id: Uuid::new_v4(),
        kind: new.kind,
        name: name.to_string(),
        currency,
        external_ref: new.external_ref.clone(),
        is_active: true,
        created_at: db::utc_now(),
    };

    conn.execute(
        "INSERT INTO money_accounts (id, kind, name, name_key, currency, external_ref, is_active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
        params![
            account.id.to_string(),
            account.kind.as_str(),
            account.name,
            key,
            account.currency,
            account.external_ref,
            db::timestamp(&account.created_at),
        ],
    )?;

    audit::record(
        conn,
        "MoneyAccount",
        &account.id.to_string(),
        "create",
        Some(json!({
            "kind": account.kind.as_str(),
            "name": account.name,
            "currency": account.currency,
        })),
    )?;

    info!(account_id = %account.id, kind = %account.kind, name = %account.name, "account created");
    Ok(account)
}

/// Soft retirement. Facts keep pointing at the account.
pub fn deactivate_account(conn: &mut Connection, id: Uuid) -> Result<Account> {
    let tx = conn.transaction()?;
    let mut account = get_account(&tx, id)?;

    if account.is_active {
        tx.execute(
            "UPDATE money_accounts SET is_active = 0 WHERE id = ?1",
            params![id.to_string()],
        )?;
        audit::record(
            &tx,
            "MoneyAccount",
            &id.to_string(),
            "deactivate",
            Some(json!({ "is_active": { "from": true, "to": false } })),
        )?;
        account.is_active = false;
        info!(account_id = %id, "account deactivated");
    }

    tx.commit()?;
    Ok(account)
}

pub fn get_account(conn: &Connection, id: Uuid) -> Result<Account> {
    conn.query_row(
        &format!("SELECT {ACCOUNT_COLUMNS} FROM money_accounts WHERE id = ?1"),
        params![id.to_string()],
        account_from_row,
    )
    .optional()?
    .ok_or_else(|| LedgerError::not_found("account", id))
}

/// Account that may receive new facts
pub(crate) fn require_active(conn: &Connection, id: Uuid) -> Result<Account> {
    let account = get_account(conn, id)?;
    if !account.is_active {
        return Err(LedgerError::AccountInactive(id));
    }
    Ok(account)
}

fn find_by_key(conn: &Connection, key: &str) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!("SELECT {ACCOUNT_COLUMNS} FROM money_accounts WHERE name_key = ?1"),
            params![key],
            account_from_row,
        )
        .optional()?;

    Ok(account)
}

pub fn find_account_by_name(conn: &Connection, name: &str) -> Result<Option<Account>> {
    find_by_key(conn, &name_key(name))
}

/// Accounts in creation order
pub fn list_accounts(conn: &Connection, active_only: bool) -> Result<Vec<Account>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {ACCOUNT_COLUMNS} FROM money_accounts
         WHERE (?1 = 0 OR is_active = 1)
         ORDER BY created_at ASC, rowid ASC"
    ))?;

    let accounts = stmt
        .query_map(params![active_only], account_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(accounts)
}

/// Oldest active account of a kind (the default bank account for payouts)
pub fn first_active_of_kind(conn: &Connection, kind: AccountKind) -> Result<Option<Account>> {
    let account = conn
        .query_row(
            &format!(
                "SELECT {ACCOUNT_COLUMNS} FROM money_accounts
                 WHERE kind = ?1 AND is_active = 1
                 ORDER BY created_at ASC, rowid ASC
                 LIMIT 1"
            ),
            params![kind.as_str()],
            account_from_row,
        )
        .optional()?;

    Ok(account)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        db::setup_database(&conn).unwrap();
        conn
    }

    #[rstest]
    #[case("bank", AccountKind::Bank)]
    #[case("Cash", AccountKind::Cash)]
    #[case(" marketplace ", AccountKind::Marketplace)]
    #[case("acquiring", AccountKind::Acquiring)]
    #[case("other", AccountKind::Other)]
    fn test_account_kind_parse(#[case] raw: &str, #[case] expected: AccountKind) {
        assert_eq!(raw.parse::<AccountKind>().unwrap(), expected);
        assert_eq!(expected.as_str().parse::<AccountKind>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_account_kind() {
        assert!("wallet".parse::<AccountKind>().is_err());
    }

    #[test]
    fn test_create_account_is_idempotent_by_name() {
        let mut conn = setup();

        let first = create_account(&mut conn, &NewAccount::new(AccountKind::Bank, "Банк (р/с)")).unwrap();
        let again = create_account(&mut conn, &NewAccount::new(AccountKind::Cash, "  БАНК (Р/С) ")).unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(again.kind, AccountKind::Bank);
        assert_eq!(first.currency, DEFAULT_CURRENCY);
        assert_eq!(list_accounts(&conn, false).unwrap().len(), 1);
    }

    #[test]
    fn test_currency_is_upper_cased() {
        let mut conn = setup();
        let mut new = NewAccount::new(AccountKind::Marketplace, "Ozon баланс");
        new.currency = Some("usd".to_string());

        let account = create_account(&mut conn, &new).unwrap();
        assert_eq!(account.currency, "USD");
    }

    #[test]
    fn test_empty_name_rejected() {
        let mut conn = setup();
        let err = create_account(&mut conn, &NewAccount::new(AccountKind::Bank, "   ")).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_deactivate_and_require_active() {
        let mut conn = setup();
        let account = create_account(&mut conn, &NewAccount::new(AccountKind::Cash, "Касса")).unwrap();

        let deactivated = deactivate_account(&mut conn, account.id).unwrap();
        assert!(!deactivated.is_active);

        let err = require_active(&conn, account.id).unwrap_err();
        assert!(matches!(err, LedgerError::AccountInactive(id) if id == account.id));

        assert!(list_accounts(&conn, true).unwrap().is_empty());
        assert_eq!(list_accounts(&conn, false).unwrap().len(), 1);
    }

    #[test]
    fn test_get_missing_account() {
        let conn = setup();
        let err = get_account(&conn, Uuid::new_v4()).unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_first_active_of_kind() {
        let mut conn = setup();
        let first = create_account(&mut conn, &NewAccount::new(AccountKind::Bank, "Банк 1")).unwrap();
        create_account(&mut conn, &NewAccount::new(AccountKind::Bank, "Банк 2")).unwrap();

        let found = first_active_of_kind(&conn, AccountKind::Bank).unwrap().unwrap();
        assert_eq!(found.id, first.id);

        deactivate_account(&mut conn, first.id).unwrap();
        let found = first_active_of_kind(&conn, AccountKind::Bank).unwrap().unwrap();
        assert_eq!(found.name, "Банк 2");

        assert!(first_active_of_kind(&conn, AccountKind::Acquiring).unwrap().is_none());
    }
}
