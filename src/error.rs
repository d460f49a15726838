// 🚨 Ledger Errors - one taxonomy for every operation
// Validation, immutability, period locks, missing references and conflicts
//
// Duplicate facts on ingest are NOT errors (they are reported as an
// outcome); everything else a caller can hit lives here.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

use crate::period::PeriodKey;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Error)]
pub enum LedgerError {
    // ========== Input ==========
    /// Malformed input, nothing persisted
    #[error("Validation failed: {0}")]
    Validation(String),

    // ========== Facts ==========
    /// Attempt to alter a fact's financial content or delete a fact
    #[error("Money operation facts are immutable ({field})")]
    ImmutabilityViolation { fact_id: Option<Uuid>, field: String },

    #[error("Money operation {0} is voided")]
    FactVoided(Uuid),

    /// Transfer legs that would collide with already recorded facts
    #[error("Money operation duplicates an existing fact: {0}")]
    DuplicateFact(String),

    // ========== Period locks ==========
    #[error("Period {period} is closed, changes are not allowed")]
    PeriodLocked { period: PeriodKey },

    // ========== References ==========
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Account {0} is inactive")]
    AccountInactive(Uuid),

    #[error("Category {0} is inactive")]
    CategoryInactive(Uuid),

    #[error("Category {0} is a system category and cannot be changed")]
    SystemCategoryProtected(Uuid),

    #[error("Category {category_id} cannot be placed under {parent_id}: cycle")]
    CategoryCycle { category_id: Uuid, parent_id: Uuid },

    // ========== Allocation / reconciliation conflicts ==========
    #[error("Confirmed allocations for {fact_id} would reach {confirmed}, above {limit}")]
    OverAllocated {
        fact_id: Uuid,
        confirmed: Decimal,
        limit: Decimal,
    },

    #[error("Match already exists for {fact_id} -> {right_type}:{right_id}")]
    DuplicateMatch {
        fact_id: Uuid,
        right_type: String,
        right_id: String,
    },

    // ========== Infrastructure ==========
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Stable code for callers that map errors onto their own transport
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::ImmutabilityViolation { .. } => "IMMUTABILITY_VIOLATION",
            Self::FactVoided(_) => "FACT_VOIDED",
            Self::DuplicateFact(_) => "DUPLICATE_FACT",
            Self::PeriodLocked { .. } => "PERIOD_LOCKED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AccountInactive(_) => "ACCOUNT_INACTIVE",
            Self::CategoryInactive(_) => "CATEGORY_INACTIVE",
            Self::SystemCategoryProtected(_) => "SYSTEM_CATEGORY_PROTECTED",
            Self::CategoryCycle { .. } => "CATEGORY_CYCLE",
            Self::OverAllocated { .. } => "OVER_ALLOCATED",
            Self::DuplicateMatch { .. } => "DUPLICATE_MATCH",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Conflicts: the request was well-formed but the ledger state forbids it
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::PeriodLocked { .. }
                | Self::DuplicateFact(_)
                | Self::DuplicateMatch { .. }
                | Self::OverAllocated { .. }
                | Self::SystemCategoryProtected(_)
        )
    }

    pub fn is_period_locked(&self) -> bool {
        matches!(self, Self::PeriodLocked { .. })
    }
}

// ============================================================================
// TESTS
// ============================================================================
