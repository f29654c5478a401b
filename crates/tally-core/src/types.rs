//! Ledger data model: blocks, transactions, outpoints.
//!
//! All monetary values are integer satoshis (1 coin = 10^8 satoshis). Amounts
//! reported by the ledger as decimal coin values are converted exactly with
//! [`parse_amount`]; no floating-point scaling is ever applied.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::constants::AMOUNT_DECIMALS;
use crate::error::AmountError;

/// A 32-byte hash value (transaction id or block hash).
///
/// Bytes are kept in the order of the ledger's hex text, so
/// `Hash256::from_str(s)?.to_string() == s` for any lowercase hex `s`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash256, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A transaction input. Coinbase inputs reference no previous output.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxInput {
    pub previous_output: Option<OutPoint>,
}

impl TxInput {
    pub fn spending(outpoint: OutPoint) -> Self {
        Self { previous_output: Some(outpoint) }
    }

    pub fn coinbase() -> Self {
        Self { previous_output: None }
    }
}

/// A transaction output: a value locked by a spending condition.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TxOutput {
    /// Position of the output within its transaction.
    pub index: u32,
    /// Value in satoshis.
    pub value: u64,
    /// Raw locking script.
    pub script_pubkey: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub txid: Hash256,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// True if no input references a previous output.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.iter().all(|input| input.previous_output.is_none())
    }
}

/// A block with full transaction detail, as returned by the ledger source.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub hash: Hash256,
    pub height: u64,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Number of outputs across all transactions.
    pub fn output_count(&self) -> usize {
        self.transactions.iter().map(|tx| tx.outputs.len()).sum()
    }
}

/// The ledger's current best chain.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChainTip {
    pub height: u64,
    pub best_hash: Hash256,
}

/// Convert a decimal coin amount (e.g. `"0.5"`, `"50.00000000"`, `"1e-8"`)
/// into satoshis without rounding.
///
/// # Examples
///
/// ```
/// use tally_core::types::parse_amount;
/// assert_eq!(parse_amount("50.00000000").unwrap(), 5_000_000_000);
/// assert_eq!(parse_amount("1e-8").unwrap(), 1);
/// assert!(parse_amount("0.000000001").is_err());
/// ```
pub fn parse_amount(text: &str) -> Result<u64, AmountError> {
    let s = text.trim();
    if s.is_empty() {
        return Err(AmountError::Empty);
    }
    if s.starts_with('-') {
        return Err(AmountError::Negative(s.to_string()));
    }
    let s = s.strip_prefix('+').unwrap_or(s);

    let (mantissa, exponent) = match s.find(['e', 'E']) {
        Some(pos) => {
            let exp = s[pos + 1..]
                .parse::<i32>()
                .map_err(|_| AmountError::Invalid(text.to_string()))?;
            (&s[..pos], exp)
        }
        None => (s, 0),
    };
    let (int_part, frac_part) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(AmountError::Invalid(text.to_string()));
    }
    if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(AmountError::Invalid(text.to_string()));
    }

    let digits = format!("{int_part}{frac_part}");
    let digits = digits.trim_start_matches('0');
    let mut value: u128 = if digits.is_empty() {
        0
    } else {
        digits
            .parse()
            .map_err(|_| AmountError::Overflow(text.to_string()))?
    };

    let scale = exponent
        .checked_sub(frac_part.len() as i32)
        .and_then(|v| v.checked_add(AMOUNT_DECIMALS as i32))
        .ok_or_else(|| AmountError::Invalid(text.to_string()))?;

    if scale >= 0 {
        let factor = 10u128
            .checked_pow(scale as u32)
            .ok_or_else(|| AmountError::Overflow(text.to_string()))?;
        value = value
            .checked_mul(factor)
            .ok_or_else(|| AmountError::Overflow(text.to_string()))?;
    } else if value != 0 {
        let divisor = 10u128
            .checked_pow(scale.unsigned_abs())
            .ok_or_else(|| AmountError::TooPrecise(text.to_string()))?;
        if value % divisor != 0 {
            return Err(AmountError::TooPrecise(text.to_string()));
        }
        value /= divisor;
    }

    u64::try_from(value).map_err(|_| AmountError::Overflow(text.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::COIN;

    const GENESIS_TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    #[test]
    fn hash_hex_roundtrip() {
        let h: Hash256 = GENESIS_TXID.parse().unwrap();
        assert_eq!(h.to_string(), GENESIS_TXID);
    }

    #[test]
    fn hash_rejects_short_hex() {
        assert!("abcd".parse::<Hash256>().is_err());
    }

    #[test]
    fn outpoint_display() {
        let op = OutPoint::new(Hash256([0x11; 32]), 3);
        assert!(op.to_string().ends_with(":3"));
        assert!(op.to_string().starts_with("1111"));
    }

    #[test]
    fn coinbase_detection() {
        let cb = Transaction {
            txid: Hash256::ZERO,
            inputs: vec![TxInput::coinbase()],
            outputs: vec![],
        };
        assert!(cb.is_coinbase());
        let spend = Transaction {
            txid: Hash256::ZERO,
            inputs: vec![TxInput::spending(OutPoint::new(Hash256([1; 32]), 0))],
            outputs: vec![],
        };
        assert!(!spend.is_coinbase());
    }

    #[test]
    fn amount_whole_coins() {
        assert_eq!(parse_amount("50").unwrap(), 50 * COIN);
        assert_eq!(parse_amount("50.00000000").unwrap(), 50 * COIN);
    }

    #[test]
    fn amount_fractions_are_exact() {
        assert_eq!(parse_amount("0.1").unwrap(), 10_000_000);
        assert_eq!(parse_amount("0.29").unwrap(), 29_000_000);
        assert_eq!(parse_amount("0.00005").unwrap(), 5_000);
        assert_eq!(parse_amount("20999999.97690000").unwrap(), 2_099_999_997_690_000);
    }

    #[test]
    fn amount_exponent_forms() {
        assert_eq!(parse_amount("1e-8").unwrap(), 1);
        assert_eq!(parse_amount("5E-05").unwrap(), 5_000);
        assert_eq!(parse_amount("2.5e1").unwrap(), 25 * COIN);
    }

    #[test]
    fn amount_zero() {
        assert_eq!(parse_amount("0").unwrap(), 0);
        assert_eq!(parse_amount("0.0").unwrap(), 0);
        assert_eq!(parse_amount("0e-30").unwrap(), 0);
    }

    #[test]
    fn amount_trailing_zeros_past_eight_places() {
        assert_eq!(parse_amount("0.000000010").unwrap(), 1);
    }

    #[test]
    fn amount_rejects_sub_satoshi() {
        assert!(matches!(parse_amount("0.000000001"), Err(AmountError::TooPrecise(_))));
    }

    #[test]
    fn amount_rejects_garbage() {
        assert_eq!(parse_amount(""), Err(AmountError::Empty));
        assert!(matches!(parse_amount("-1"), Err(AmountError::Negative(_))));
        assert!(matches!(parse_amount("1.2.3"), Err(AmountError::Invalid(_))));
        assert!(matches!(parse_amount("."), Err(AmountError::Invalid(_))));
        assert!(matches!(parse_amount("abc"), Err(AmountError::Invalid(_))));
    }

    #[test]
    fn amount_rejects_overflow() {
        assert!(matches!(parse_amount("1e20"), Err(AmountError::Overflow(_))));
    }

    #[test]
    fn block_output_count() {
        let tx = Transaction {
            txid: Hash256::ZERO,
            inputs: vec![TxInput::coinbase()],
            outputs: vec![
                TxOutput { index: 0, value: 1, script_pubkey: vec![] },
                TxOutput { index: 1, value: 2, script_pubkey: vec![] },
            ],
        };
        let block = Block { hash: Hash256::ZERO, height: 0, transactions: vec![tx.clone(), tx] };
        assert_eq!(block.output_count(), 4);
    }
}
