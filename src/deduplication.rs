// 🔍 Deduplication - the same money movement is recorded once
//
// Two identities for "same fact":
//   1. (source, account, external id)  - when the statement carries an id
//   2. fingerprint                     - when it does not
//
// The fingerprint is a SHA-256 over a normalized key. It is for
// DEDUPLICATION, not IDENTITY: the fact's identity is its UUID.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::parsed_col;
use crate::error::Result;
use crate::money;

// ============================================================================
// FINGERPRINT
// ============================================================================

/// `account_id|YYYY-MM-DD|amount(2dp)|counterparty|description`, trimmed and
/// lower-cased, hashed to lowercase hex
pub fn compute_fingerprint(
    account_id: Uuid,
    posted_at: &DateTime<Utc>,
    amount: Decimal,
    counterparty: Option<&str>,
    description: Option<&str>,
) -> String {
    let key = [
        account_id.to_string(),
        posted_at.format("%Y-%m-%d").to_string(),
        money::format_2dp(amount),
        normalize(counterparty),
        normalize(description),
    ]
    .join("|");

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize(value: Option<&str>) -> String {
    value.unwrap_or("").trim().to_lowercase()
}

// ============================================================================
// LOOKUP
// ============================================================================

/// Which identity matched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicateReason {
    ExternalId,
    Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingFact {
    pub fact_id: Uuid,
    pub reason: DuplicateReason,
}

/// Find an already stored fact that a candidate would duplicate.
///
/// With an external id only (source, account, external id) counts; the
/// fingerprint is unique only among facts that lack an external id.
pub fn find_existing(
    conn: &Connection,
    source: &str,
    account_id: Uuid,
    external_id: Option<&str>,
    fingerprint: &str,
) -> Result<Option<ExistingFact>> {
    let found = match external_id {
        Some(external_id) => conn
            .query_row(
                "SELECT id FROM money_operations
                 WHERE source = ?1 AND account_id = ?2 AND external_id = ?3",
                params![source, account_id.to_string(), external_id],
                |row| parsed_col::<Uuid>(row, 0),
            )
            .optional()?
            .map(|fact_id| ExistingFact {
                fact_id,
                reason: DuplicateReason::ExternalId,
            }),
        None => conn
            .query_row(
                "SELECT id FROM money_operations
                 WHERE fingerprint = ?1 AND external_id IS NULL",
                params![fingerprint],
                |row| parsed_col::<Uuid>(row, 0),
            )
            .optional()?
            .map(|fact_id| ExistingFact {
                fact_id,
                reason: DuplicateReason::Fingerprint,
            }),
    };

    Ok(found)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn account() -> Uuid {
        Uuid::parse_str("2f1c1a7e-4b8e-4d8c-9f3e-0a1b2c3d4e5f").unwrap()
    }

    #[test]
    fn test_fingerprint_matches_known_key() {
        let posted = Utc.with_ymd_and_hms(2025, 3, 10, 14, 30, 0).unwrap();
        let fp = compute_fingerprint(account(), &posted, dec!(-1000), Some(" УФК (ФНС) "), Some("Налог УСН"));

        let mut hasher = Sha256::new();
        hasher.update(
            "2f1c1a7e-4b8e-4d8c-9f3e-0a1b2c3d4e5f|2025-03-10|-1000.00|уфк (фнс)|налог усн".as_bytes(),
        );
        assert_eq!(fp, format!("{:x}", hasher.finalize()));
        assert_eq!(fp.len(), 64);
    }

    #[test]
    fn test_fingerprint_ignores_time_of_day_and_case() {
        let morning = Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap();
        let evening = Utc.with_ymd_and_hms(2025, 3, 10, 20, 0, 0).unwrap();

        let a = compute_fingerprint(account(), &morning, dec!(250.5), Some("СДЭК"), None);
        let b = compute_fingerprint(account(), &evening, dec!(250.50), Some("сдэк "), Some(""));

        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_distinguishes_sign_and_day() {
        let day = Utc.with_ymd_and_hms(2025, 3, 10, 8, 0, 0).unwrap();
        let next = Utc.with_ymd_and_hms(2025, 3, 11, 8, 0, 0).unwrap();

        let out = compute_fingerprint(account(), &day, dec!(-100), None, None);
        let inflow = compute_fingerprint(account(), &day, dec!(100), None, None);
        let later = compute_fingerprint(account(), &next, dec!(-100), None, None);

        assert_ne!(out, inflow);
        assert_ne!(out, later);
    }
}
