// 🌱 Bootstrap - seed accounts, categories and default rules
//
// Runs in one transaction and is safe to repeat: accounts upsert by name,
// categories by (type, name), and default rules are only written into an
// empty rule table so user edits are never overwritten.

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::SeedConfig;
use crate::entities::account::{self, NewAccount};
use crate::entities::category::{self, NewCategory};
use crate::error::Result;
use crate::rules::{self, NewRule};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedReport {
    pub accounts_created: usize,
    pub categories_created: usize,
    pub rules_created: usize,
    /// Seed rules whose category is missing
    pub rules_skipped: Vec<String>,
}

pub fn bootstrap(conn: &mut Connection, seed: &SeedConfig) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    if !seed.enabled {
        info!("seeding disabled");
        return Ok(report);
    }

    let tx = conn.transaction()?;

    for entry in &seed.accounts {
        if account::find_account_by_name(&tx, &entry.name)?.is_none() {
            report.accounts_created += 1;
        }
        account::create_account_in(
            &tx,
            &NewAccount {
                currency: Some(entry.currency.clone()),
                ..NewAccount::new(entry.kind, &entry.name)
            },
        )?;
    }

    for entry in &seed.categories {
        if category::find_category(&tx, entry.category_type, &entry.name)?.is_none() {
            report.categories_created += 1;
        }
        category::ensure_category_in(
            &tx,
            &NewCategory {
                is_tax_related: entry.is_tax_related,
                is_payroll_related: entry.is_payroll_related,
                is_system: entry.is_system,
                ..NewCategory::new(&entry.name, entry.category_type)
            },
        )?;
    }

    if rules::count_rules(&tx)? == 0 {
        for entry in &seed.rules {
            let Some(target) = category::find_category(&tx, entry.category_type, &entry.category_name)? else {
                warn!(rule = %entry.name, category = %entry.category_name, "seed rule category missing");
                report.rules_skipped.push(entry.name.clone());
                continue;
            };

            rules::create_rule_in(
                &tx,
                &NewRule {
                    name: Some(entry.name.clone()),
                    match_field: entry.match_field,
                    pattern: entry.pattern.clone(),
                    direction: entry.direction,
                    account_id: None,
                    category_id: target.id,
                    confidence: entry.confidence,
                    priority: entry.priority,
                },
            )?;
            report.rules_created += 1;
        }
    }

    tx.commit()?;
    info!(
        accounts = report.accounts_created,
        categories = report.categories_created,
        rules = report.rules_created,
        "seed complete"
    );

    Ok(report)
}
