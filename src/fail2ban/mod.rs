pub mod handler;
pub mod ledger;

pub use ledger::*;
