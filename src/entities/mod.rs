// Entity Models - accounts and categories
// "Identity persists, values change"
//
// Each entity has a stable UUID identity; names and flags are values that
// may change (and every change is audited).

pub mod account;
pub mod category;

pub use account::{Account, AccountKind, NewAccount};
pub use category::{Category, CategoryType, NewCategory, RetireOutcome};
