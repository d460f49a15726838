// ⚙️ Configuration - files + LEDGER__* environment overrides
//
// Every field has a default, so an empty environment yields a working
// ledger with the stock seed (accounts, categories, keyword rules).

use serde::Deserialize;

use crate::entities::account::AccountKind;
use crate::entities::category::CategoryType;
use crate::rules::{Direction, MatchField};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub seed: SeedConfig,
}

impl LedgerConfig {
    /// Loads `config/default`, `config/<RUN_MODE>` (both optional) and
    /// `LEDGER__SECTION__KEY` environment variables, in that order.
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".to_string());

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(config::Environment::with_prefix("LEDGER").separator("__"))
            .build()?;

        config.try_deserialize()
    }
}

// ============================================================================
// DATABASE
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file path
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "money_ledger.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            path: default_db_path(),
        }
    }
}

// ============================================================================
// BATCHES
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    /// Facts scanned per auto_allocate run
    #[serde(default = "default_auto_allocate_limit")]
    pub auto_allocate_limit: usize,
    /// Suggestions scanned per confirm_batch run
    #[serde(default = "default_confirm_limit")]
    pub confirm_limit: usize,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Facts read when looking for unallocated ones
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,
}

fn default_auto_allocate_limit() -> usize {
    1000
}

fn default_confirm_limit() -> usize {
    2000
}

fn default_min_confidence() -> f64 {
    0.95
}

fn default_scan_limit() -> usize {
    10_000
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            auto_allocate_limit: default_auto_allocate_limit(),
            confirm_limit: default_confirm_limit(),
            min_confidence: default_min_confidence(),
            scan_limit: default_scan_limit(),
        }
    }
}

// ============================================================================
// RECONCILIATION
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Document search window around a fact's date
    #[serde(default = "default_window_days")]
    pub window_days: i64,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    /// Bank search window around payout dates
    #[serde(default = "default_payout_window_days")]
    pub payout_window_days: i64,
    #[serde(default = "default_payout_min_score")]
    pub payout_min_score: f64,
    #[serde(default = "default_payout_top")]
    pub payout_top: usize,
    /// Bank facts read per payout run
    #[serde(default = "default_payout_scan_limit")]
    pub payout_scan_limit: usize,
    #[serde(default = "default_auto_confirm_threshold")]
    pub auto_confirm_threshold: f64,
    /// Lower-case tokens that boost a bank line's payout score
    #[serde(default = "default_marketplace_tokens")]
    pub marketplace_tokens: Vec<String>,
}

fn default_window_days() -> i64 {
    3
}

fn default_min_score() -> f64 {
    0.35
}

fn default_max_suggestions() -> usize {
    20
}

fn default_payout_window_days() -> i64 {
    4
}

fn default_payout_min_score() -> f64 {
    0.45
}

fn default_payout_top() -> usize {
    3
}

fn default_payout_scan_limit() -> usize {
    5_000
}

fn default_auto_confirm_threshold() -> f64 {
    0.85
}

fn default_marketplace_tokens() -> Vec<String> {
    vec!["ozon".to_string(), "озон".to_string()]
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        ReconciliationConfig {
            window_days: default_window_days(),
            min_score: default_min_score(),
            max_suggestions: default_max_suggestions(),
            payout_window_days: default_payout_window_days(),
            payout_min_score: default_payout_min_score(),
            payout_top: default_payout_top(),
            payout_scan_limit: default_payout_scan_limit(),
            auto_confirm_threshold: default_auto_confirm_threshold(),
            marketplace_tokens: default_marketplace_tokens(),
        }
    }
}

// ============================================================================
// SEED
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct SeedAccount {
    pub kind: AccountKind,
    pub name: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedCategory {
    pub name: String,
    pub category_type: CategoryType,
    #[serde(default)]
    pub is_tax_related: bool,
    #[serde(default)]
    pub is_payroll_related: bool,
    #[serde(default)]
    pub is_system: bool,
}

/// A default rule, pointing at a seeded category by (type, name)
#[derive(Debug, Clone, Deserialize)]
pub struct SeedRule {
    pub name: String,
    pub category_name: String,
    pub category_type: CategoryType,
    pub pattern: String,
    #[serde(default)]
    pub match_field: MatchField,
    pub direction: Direction,
    pub confidence: f64,
    pub priority: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeedConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_seed_accounts")]
    pub accounts: Vec<SeedAccount>,
    #[serde(default = "default_seed_categories")]
    pub categories: Vec<SeedCategory>,
    #[serde(default = "default_seed_rules")]
    pub rules: Vec<SeedRule>,
}

fn default_true() -> bool {
    true
}

fn default_currency() -> String {
    "RUB".to_string()
}

impl Default for SeedConfig {
    fn default() -> Self {
        SeedConfig {
            enabled: true,
            accounts: default_seed_accounts(),
            categories: default_seed_categories(),
            rules: default_seed_rules(),
        }
    }
}

fn default_seed_accounts() -> Vec<SeedAccount> {
    let account = |kind, name: &str| SeedAccount {
        kind,
        name: name.to_string(),
        currency: default_currency(),
    };

    vec![
        account(AccountKind::Bank, "Банк (р/с)"),
        account(AccountKind::Cash, "Касса (наличка)"),
        account(AccountKind::Marketplace, "WB баланс"),
        account(AccountKind::Marketplace, "Ozon баланс"),
        account(AccountKind::Marketplace, "Яндекс Маркет баланс"),
        account(AccountKind::Acquiring, "Эквайринг (онлайн-оплата)"),
    ]
}

/// Name of the seeded system category used for internal transfers
pub const TRANSFER_CATEGORY_NAME: &str = "Перевод между счетами";

fn default_seed_categories() -> Vec<SeedCategory> {
    let category = |name: &str, category_type| SeedCategory {
        name: name.to_string(),
        category_type,
        is_tax_related: false,
        is_payroll_related: false,
        is_system: false,
    };

    vec![
        category("Выручка", CategoryType::Income),
        category("Закупки", CategoryType::Expense),
        category("Аренда", CategoryType::Expense),
        category("Реклама", CategoryType::Expense),
        category("Сервис/ремонт", CategoryType::Expense),
        category("Логистика/доставка", CategoryType::Expense),
        category("Комиссии банка", CategoryType::Expense),
        SeedCategory {
            is_tax_related: true,
            ..category("Налоги", CategoryType::Expense)
        },
        SeedCategory {
            is_payroll_related: true,
            ..category("Зарплата", CategoryType::Expense)
        },
        category("Выплаты маркетплейсов", CategoryType::Income),
        category("Комиссии/услуги маркетплейсов", CategoryType::Expense),
        SeedCategory {
            is_system: true,
            ..category(TRANSFER_CATEGORY_NAME, CategoryType::Transfer)
        },
    ]
}

fn default_seed_rules() -> Vec<SeedRule> {
    const MARKETPLACES: &str = "ozon|озон|wildberries|валберис|wb|яндекс маркет|yandex market";

    let rule = |category_name: &str,
                category_type,
                pattern: &str,
                direction,
                confidence,
                priority| SeedRule {
        name: format!("default: {category_name}"),
        category_name: category_name.to_string(),
        category_type,
        pattern: pattern.to_string(),
        match_field: MatchField::Text,
        direction,
        confidence,
        priority,
    };

    vec![
        rule(
            "Налоги",
            CategoryType::Expense,
            "фнс|налог|усн|ндс|взнос|страх|пфр|фсс",
            Direction::Out,
            0.99,
            1000,
        ),
        rule("Аренда", CategoryType::Expense, "аренд", Direction::Out, 0.98, 900),
        rule(
            "Комиссии банка",
            CategoryType::Expense,
            "комисс|обслуж|тариф|пакет|эквайр",
            Direction::Out,
            0.97,
            800,
        ),
        rule(
            "Реклама",
            CategoryType::Expense,
            "директ|yandex|яндекс|vk|google|meta|ads",
            Direction::Out,
            0.90,
            700,
        ),
        rule(
            "Логистика/доставка",
            CategoryType::Expense,
            "сдэк|почта|курьер|доставка|logistic",
            Direction::Out,
            0.90,
            650,
        ),
        rule(
            "Выплаты маркетплейсов",
            CategoryType::Income,
            MARKETPLACES,
            Direction::In,
            0.70,
            500,
        ),
        rule(
            "Комиссии/услуги маркетплейсов",
            CategoryType::Expense,
            MARKETPLACES,
            Direction::Out,
            0.70,
            500,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_mirror_stock_values() {
        let cfg = LedgerConfig::default();

        assert_eq!(cfg.batch.auto_allocate_limit, 1000);
        assert_eq!(cfg.batch.confirm_limit, 2000);
        assert_eq!(cfg.batch.min_confidence, 0.95);
        assert_eq!(cfg.reconciliation.window_days, 3);
        assert_eq!(cfg.reconciliation.auto_confirm_threshold, 0.85);
        assert_eq!(cfg.seed.accounts.len(), 6);
        assert_eq!(cfg.seed.rules.len(), 7);
        assert!(cfg
            .seed
            .categories
            .iter()
            .any(|c| c.name == TRANSFER_CATEGORY_NAME && c.is_system));
    }

    #[test]
    fn test_seed_rules_reference_seed_categories() {
        let seed = SeedConfig::default();
        for rule in &seed.rules {
            assert!(
                seed.categories
                    .iter()
                    .any(|c| c.name == rule.category_name && c.category_type == rule.category_type),
                "rule {} points at unknown category",
                rule.name
            );
        }
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let cfg: LedgerConfig = config::Config::builder()
            .add_source(config::File::from_str(
                "[database]\npath = \"/tmp/ledger.db\"\n[batch]\nmin_confidence = 0.9\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(cfg.database.path, "/tmp/ledger.db");
        assert_eq!(cfg.batch.min_confidence, 0.9);
        assert_eq!(cfg.batch.confirm_limit, 2000);
        assert!(cfg.seed.enabled);
        assert_eq!(cfg.reconciliation.marketplace_tokens, vec!["ozon", "озон"]);
    }
}
