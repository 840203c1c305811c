//! Durable account/group records and the ledger trait over them.

mod ledger;
mod models;
mod sqlite;

pub use ledger::{Ledger, LedgerError};
pub use models::{Account, Group, GroupRole, NewAccount};
pub use sqlite::SqliteLedger;
