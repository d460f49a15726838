// Money Ledger - Core Library
// Immutable money facts, categories, rules, allocations, period locks and
// reconciliation over one SQLite database.

pub mod error;
pub mod db;
pub mod audit;          // Append-only mutation log
pub mod money;          // Decimal helpers and tolerance
pub mod period;         // Month locks
pub mod config;         // Layered configuration + seed data
pub mod entities;       // Accounts and categories
pub mod deduplication;  // Fingerprints and duplicate lookup
pub mod facts;          // Fact store, voids, transfers
pub mod rules;          // Keyword rule engine
pub mod allocation;     // Allocation ledger and batches
pub mod reconciliation; // Document matching
pub mod payouts;        // Marketplace payout matching
pub mod bootstrap;      // Seeding

// Re-export commonly used types
pub use error::{LedgerError, Result};
pub use db::{open, setup_database, verify_count};
pub use audit::{AuditEvent, FieldChange};
pub use period::{PeriodKey, PeriodLock};
pub use config::LedgerConfig;
pub use entities::{
    Account, AccountKind, NewAccount,
    Category, CategoryType, NewCategory, RetireOutcome,
};
pub use deduplication::{compute_fingerprint, DuplicateReason, ExistingFact};
pub use facts::{
    CandidateFact, FactFilter, IngestOutcome, IngestReport,
    MoneyOperation, NewTransfer, OperationKind, TransferLegs, VoidOutcome,
};
pub use rules::{
    Direction, KeywordPattern, MatchField, MoneyRule, NewRule, RuleEngine, RulePatch, RuleSuggestion,
};
pub use allocation::{
    AllocationMethod, AllocationPatch, AllocationSummary,
    AutoAllocateParams, AutoAllocateReport, ConfirmBatchParams, ConfirmBatchReport,
    MoneyAllocation, NewAllocation, UnallocatedFact, UnallocatedFilter,
};
pub use reconciliation::{
    DocumentCandidate, DocumentKind, DocumentSource, InMemoryDocuments,
    MatchFilter, MatchMethod, MatchScorer, MatchStatus, MatchSuggestion,
    NewMatch, ReconciliationMatch,
};
pub use payouts::{
    AutoConfirmParams, AutoConfirmReport, PayoutBatch, PayoutCandidate,
    PayoutLine, PayoutReconRow, PayoutScorer,
};
pub use bootstrap::{bootstrap, SeedReport};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
