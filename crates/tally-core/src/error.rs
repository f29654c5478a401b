//! Error types for the Tally index.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid HRP")] InvalidHrp,
    #[error("invalid length")] InvalidLength,
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid character: {0}")] InvalidCharacter(char),
    #[error("invalid witness version: {0}")] InvalidVersion(u8),
    #[error("invalid padding bits")] InvalidPadding,
    #[error("unknown version byte: {0:#04x}")] UnknownVersionByte(u8),
    #[error("missing separator")] MissingSeparator,
    #[error("mixed case")] MixedCase,
    #[error("invalid base58: {0}")] InvalidBase58(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("empty amount")] Empty,
    #[error("negative amount: {0}")] Negative(String),
    #[error("too many decimal places: {0}")] TooPrecise(String),
    #[error("invalid amount: {0}")] Invalid(String),
    #[error("amount overflow: {0}")] Overflow(String),
}

/// Failure talking to the ledger source. Every variant is retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("not found: {0}")] NotFound(String),
    #[error("transient ledger failure: {0}")] Transient(String),
    #[error("malformed ledger response: {0}")] Malformed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("storage: {0}")] Backend(String),
    #[error("row locked by a concurrent unit: {0}")] Busy(String),
    #[error("corrupt row in {table}: {reason}")] Corrupt { table: &'static str, reason: String },
    #[error("missing column family: {0}")] MissingColumnFamily(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error(transparent)] Fetch(#[from] FetchError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error("ledger returned block at height {got}, expected {expected}")] HeightMismatch { expected: u64, got: u64 },
    #[error("value overflow in {0}")] ValueOverflow(String),
}

impl ApplyError {
    /// Whether a later attempt at the same height may succeed.
    ///
    /// An overflowing block overflows again on every attempt, so the
    /// orchestrator stops re-attempting it immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ApplyError::ValueOverflow(_))
    }
}

#[derive(Error, Debug)]
pub enum IndexError {
    #[error(transparent)] Address(#[from] AddressError),
    #[error(transparent)] Amount(#[from] AmountError),
    #[error(transparent)] Fetch(#[from] FetchError),
    #[error(transparent)] Store(#[from] StoreError),
    #[error(transparent)] Apply(#[from] ApplyError),
}
