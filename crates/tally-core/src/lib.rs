//! # tally-core
//! Foundation types, the script/address codec, and ledger traits for Tally.

pub mod address;
pub mod constants;
pub mod error;
pub mod traits;
pub mod types;
