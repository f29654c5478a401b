//! Spending-condition (script) to address codec.
//!
//! Recognised templates, each producing a network-parameterized address:
//! - P2PKH `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`: base58check
//! - P2SH `OP_HASH160 <20> OP_EQUAL`: base58check
//! - P2WPKH / P2WSH `OP_0 <20|32>`: Bech32 ([BIP-173])
//! - P2TR `OP_1 <32>`: Bech32m ([BIP-350])
//!
//! Anything else decodes to [`ScriptAddress::NonStandard`]. Decoding never
//! fails and never panics.
//!
//! [BIP-173]: https://github.com/bitcoin/bips/blob/master/bip-0173.mediawiki
//! [BIP-350]: https://github.com/bitcoin/bips/blob/master/bip-0350.mediawiki

use std::fmt;

use sha2::{Digest, Sha256};

use crate::constants::NetworkParams;
use crate::error::AddressError;

/// Bech32 checksum constant (BIP-173).
const BECH32_CONST: u32 = 1;

/// Bech32m checksum constant (BIP-350).
const BECH32M_CONST: u32 = 0x2bc830a3;

/// Bech32 character set for encoding 5-bit values.
const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// Maximum length of a Bech32 string.
const BECH32_MAX_LEN: usize = 90;

const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const PUSH_20: u8 = 0x14;
const PUSH_32: u8 = 0x20;

/// Which checksum constant a Bech32-family string uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Variant {
    Bech32,
    Bech32m,
}

impl Variant {
    fn constant(self) -> u32 {
        match self {
            Variant::Bech32 => BECH32_CONST,
            Variant::Bech32m => BECH32M_CONST,
        }
    }

    /// Witness v0 uses Bech32; every later version uses Bech32m.
    fn for_witness_version(version: u8) -> Self {
        if version == 0 { Variant::Bech32 } else { Variant::Bech32m }
    }
}

/// The spending-condition template an address was derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
}

/// A canonical, network-specific address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    kind: AddressKind,
    program: Vec<u8>,
    text: String,
}

/// Result of decoding a spending condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScriptAddress {
    Standard(Address),
    NonStandard,
}

impl ScriptAddress {
    pub fn address(&self) -> Option<&Address> {
        match self {
            ScriptAddress::Standard(addr) => Some(addr),
            ScriptAddress::NonStandard => None,
        }
    }

    pub fn is_standard(&self) -> bool {
        matches!(self, ScriptAddress::Standard(_))
    }
}

/// Decode a locking script into an address for the given network.
///
/// # Examples
///
/// ```
/// use tally_core::address::decode_script;
/// use tally_core::constants::Network;
///
/// let script = hex::decode("0014751e76e8199196d454941c45d1b3a323f1433bd6").unwrap();
/// let decoded = decode_script(&script, &Network::Main.params());
/// assert_eq!(
///     decoded.address().unwrap().to_string(),
///     "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4"
/// );
/// ```
pub fn decode_script(script: &[u8], params: &NetworkParams) -> ScriptAddress {
    let address = match script {
        [OP_DUP, OP_HASH160, PUSH_20, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            Some(Address::base58(AddressKind::P2pkh, params.p2pkh_version, hash))
        }
        [OP_HASH160, PUSH_20, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            Some(Address::base58(AddressKind::P2sh, params.p2sh_version, hash))
        }
        [OP_0, PUSH_20, program @ ..] if program.len() == 20 => {
            Address::witness(AddressKind::P2wpkh, params.hrp, program)
        }
        [OP_0, PUSH_32, program @ ..] if program.len() == 32 => {
            Address::witness(AddressKind::P2wsh, params.hrp, program)
        }
        [OP_1, PUSH_32, program @ ..] if program.len() == 32 => {
            Address::witness(AddressKind::P2tr, params.hrp, program)
        }
        _ => None,
    };

    address.map_or(ScriptAddress::NonStandard, ScriptAddress::Standard)
}

impl Address {
    fn base58(kind: AddressKind, version: u8, hash: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(1 + hash.len() + 4);
        payload.push(version);
        payload.extend_from_slice(hash);
        let checksum = double_sha256(&payload);
        payload.extend_from_slice(&checksum[..4]);

        Self {
            kind,
            program: hash.to_vec(),
            text: bs58::encode(payload).into_string(),
        }
    }

    fn witness(kind: AddressKind, hrp: &str, program: &[u8]) -> Option<Self> {
        let version = kind.witness_version()?;
        let data_5bit = convert_bits(program, 8, 5, true)?;

        let mut payload = Vec::with_capacity(1 + data_5bit.len());
        payload.push(version);
        payload.extend_from_slice(&data_5bit);

        let variant = Variant::for_witness_version(version);
        let checksum = bech32_create_checksum(hrp, &payload, variant);

        let mut text = String::with_capacity(hrp.len() + 1 + payload.len() + 6);
        text.push_str(hrp);
        text.push('1');
        for &d in payload.iter().chain(checksum.iter()) {
            text.push(CHARSET[d as usize] as char);
        }

        Some(Self {
            kind,
            program: program.to_vec(),
            text,
        })
    }

    /// Parse a textual address for the given network.
    pub fn parse(s: &str, params: &NetworkParams) -> Result<Self, AddressError> {
        let bech32_prefix = format!("{}1", params.hrp);
        if s.to_ascii_lowercase().starts_with(&bech32_prefix) {
            Self::parse_bech32(s, params)
        } else {
            Self::parse_base58(s, params)
        }
    }

    fn parse_base58(s: &str, params: &NetworkParams) -> Result<Self, AddressError> {
        let raw = bs58::decode(s)
            .into_vec()
            .map_err(|e| AddressError::InvalidBase58(e.to_string()))?;
        if raw.len() != 25 {
            return Err(AddressError::InvalidLength);
        }

        let (payload, checksum) = raw.split_at(21);
        if double_sha256(payload)[..4] != *checksum {
            return Err(AddressError::InvalidChecksum);
        }

        let version = payload[0];
        let kind = if version == params.p2pkh_version {
            AddressKind::P2pkh
        } else if version == params.p2sh_version {
            AddressKind::P2sh
        } else {
            return Err(AddressError::UnknownVersionByte(version));
        };

        Ok(Self::base58(kind, version, &payload[1..]))
    }

    fn parse_bech32(s: &str, params: &NetworkParams) -> Result<Self, AddressError> {
        // Reject mixed case (all alpha chars must be same case)
        let has_lower = s.chars().any(|c| c.is_ascii_lowercase());
        let has_upper = s.chars().any(|c| c.is_ascii_uppercase());
        if has_lower && has_upper {
            return Err(AddressError::MixedCase);
        }
        if s.len() > BECH32_MAX_LEN {
            return Err(AddressError::InvalidLength);
        }

        let s_lower = s.to_ascii_lowercase();
        let sep_pos = s_lower.rfind('1').ok_or(AddressError::MissingSeparator)?;
        if &s_lower[..sep_pos] != params.hrp {
            return Err(AddressError::InvalidHrp);
        }
        // At least a version char and 6 checksum chars after the separator.
        if sep_pos + 8 > s_lower.len() {
            return Err(AddressError::InvalidLength);
        }

        let mut data = Vec::with_capacity(s_lower.len() - sep_pos - 1);
        for c in s_lower[sep_pos + 1..].chars() {
            let pos = CHARSET
                .iter()
                .position(|&ch| ch as char == c)
                .ok_or(AddressError::InvalidCharacter(c))?;
            data.push(pos as u8);
        }

        let variant = bech32_verify_checksum(params.hrp, &data).ok_or(AddressError::InvalidChecksum)?;
        let payload = &data[..data.len() - 6];

        let version = payload[0];
        if variant != Variant::for_witness_version(version) {
            return Err(AddressError::InvalidChecksum);
        }
        let program = convert_bits(&payload[1..], 5, 8, false).ok_or(AddressError::InvalidPadding)?;

        let kind = match (version, program.len()) {
            (0, 20) => AddressKind::P2wpkh,
            (0, 32) => AddressKind::P2wsh,
            (1, 32) => AddressKind::P2tr,
            (0 | 1, _) => return Err(AddressError::InvalidLength),
            (v, _) => return Err(AddressError::InvalidVersion(v)),
        };

        Self::witness(kind, params.hrp, &program).ok_or(AddressError::InvalidLength)
    }

    /// Re-encode the locking script this address pays to.
    pub fn script_pubkey(&self) -> Vec<u8> {
        let mut script = Vec::with_capacity(self.program.len() + 5);
        match self.kind {
            AddressKind::P2pkh => {
                script.extend_from_slice(&[OP_DUP, OP_HASH160, PUSH_20]);
                script.extend_from_slice(&self.program);
                script.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
            }
            AddressKind::P2sh => {
                script.extend_from_slice(&[OP_HASH160, PUSH_20]);
                script.extend_from_slice(&self.program);
                script.push(OP_EQUAL);
            }
            AddressKind::P2wpkh | AddressKind::P2wsh | AddressKind::P2tr => {
                let op = if self.kind == AddressKind::P2tr { OP_1 } else { OP_0 };
                script.push(op);
                script.push(self.program.len() as u8);
                script.extend_from_slice(&self.program);
            }
        }
        script
    }

    pub fn kind(&self) -> AddressKind {
        self.kind
    }

    /// Hash or witness program carried by the address.
    pub fn program(&self) -> &[u8] {
        &self.program
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl AddressKind {
    fn witness_version(self) -> Option<u8> {
        match self {
            AddressKind::P2wpkh | AddressKind::P2wsh => Some(0),
            AddressKind::P2tr => Some(1),
            AddressKind::P2pkh | AddressKind::P2sh => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

fn double_sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

// --- Bech32 internals ---

/// Compute the Bech32 polymod over a sequence of 5-bit values.
fn bech32_polymod(values: &[u8]) -> u32 {
    const GEN: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];
    let mut chk: u32 = 1;
    for &v in values {
        let b = chk >> 25;
        chk = ((chk & 0x1ffffff) << 5) ^ (v as u32);
        for (i, &g) in GEN.iter().enumerate() {
            if (b >> i) & 1 != 0 {
                chk ^= g;
            }
        }
    }
    chk
}

/// Expand the HRP for checksum computation.
fn bech32_hrp_expand(hrp: &str) -> Vec<u8> {
    let mut ret = Vec::with_capacity(hrp.len() * 2 + 1);
    for c in hrp.bytes() {
        ret.push(c >> 5);
    }
    ret.push(0);
    for c in hrp.bytes() {
        ret.push(c & 31);
    }
    ret
}

/// Create the 6-value checksum for the given HRP, data and variant.
fn bech32_create_checksum(hrp: &str, data: &[u8], variant: Variant) -> Vec<u8> {
    let mut values = bech32_hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    let polymod = bech32_polymod(&values) ^ variant.constant();
    (0..6)
        .map(|i| ((polymod >> (5 * (5 - i))) & 31) as u8)
        .collect()
}

/// Verify a checksum (data includes the checksum) and report which variant it uses.
fn bech32_verify_checksum(hrp: &str, data: &[u8]) -> Option<Variant> {
    let mut values = bech32_hrp_expand(hrp);
    values.extend_from_slice(data);
    match bech32_polymod(&values) {
        BECH32_CONST => Some(Variant::Bech32),
        BECH32M_CONST => Some(Variant::Bech32m),
        _ => None,
    }
}

/// Convert between bit widths (e.g. 8-bit bytes to 5-bit Bech32 groups).
fn convert_bits(data: &[u8], from_bits: u32, to_bits: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut ret = Vec::new();
    let maxv = (1u32 << to_bits) - 1;
    for &value in data {
        let v = value as u32;
        if v >> from_bits != 0 {
            return None;
        }
        acc = (acc << from_bits) | v;
        bits += from_bits;
        while bits >= to_bits {
            bits -= to_bits;
            ret.push(((acc >> bits) & maxv) as u8);
        }
    }
    if pad {
        if bits > 0 {
            ret.push(((acc << (to_bits - bits)) & maxv) as u8);
        }
    } else if bits >= from_bits || ((acc << (to_bits - bits)) & maxv) != 0 {
        return None;
    }
    Some(ret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::Network;
    use proptest::prelude::*;

    struct Fixture {
        network: Network,
        script: &'static str,
        address: &'static str,
        kind: AddressKind,
    }

    const FIXTURES: &[Fixture] = &[
        // Genesis coinbase key
        Fixture { network: Network::Main, script: "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac", address: "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", kind: AddressKind::P2pkh },
        Fixture { network: Network::Test, script: "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac", address: "mpXwg4jMtRhuSpVq4xS3HFHmCmWp9NyGKt", kind: AddressKind::P2pkh },
        Fixture { network: Network::Main, script: "a914b472a266d0bd89c13706a4132ccfb16f7c3b9fcb87", address: "3J98t1WpEZ73CNmQviecrnyiWrnqRhWNLy", kind: AddressKind::P2sh },
        Fixture { network: Network::Test, script: "a914b472a266d0bd89c13706a4132ccfb16f7c3b9fcb87", address: "2N9hLwkSqr1cPQAPxbrGVUjxyjD11G2e1he", kind: AddressKind::P2sh },
        Fixture { network: Network::Main, script: "0014751e76e8199196d454941c45d1b3a323f1433bd6", address: "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", kind: AddressKind::P2wpkh },
        Fixture { network: Network::Test, script: "0014751e76e8199196d454941c45d1b3a323f1433bd6", address: "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx", kind: AddressKind::P2wpkh },
        Fixture { network: Network::Main, script: "00201863143c14c5166804bd19203356da136c985678cd4d27a1b8c6329604903262", address: "bc1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3qccfmv3", kind: AddressKind::P2wsh },
        Fixture { network: Network::Test, script: "00201863143c14c5166804bd19203356da136c985678cd4d27a1b8c6329604903262", address: "tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7", kind: AddressKind::P2wsh },
        Fixture { network: Network::Main, script: "512079be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798", address: "bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqzk5jj0", kind: AddressKind::P2tr },
        Fixture { network: Network::Test, script: "512079be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798", address: "tb1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vq47zagq", kind: AddressKind::P2tr },
    ];

    fn script(hex_str: &str) -> Vec<u8> {
        hex::decode(hex_str).unwrap()
    }

    #[test]
    fn fixtures_decode_to_expected_addresses() {
        for f in FIXTURES {
            let decoded = decode_script(&script(f.script), &f.network.params());
            let addr = decoded.address().unwrap_or_else(|| panic!("{} decoded as non-standard", f.script));
            assert_eq!(addr.as_str(), f.address);
            assert_eq!(addr.kind(), f.kind);
        }
    }

    #[test]
    fn fixtures_reencode_identically() {
        for f in FIXTURES {
            let params = f.network.params();
            let parsed = Address::parse(f.address, &params).unwrap();
            assert_eq!(parsed.script_pubkey(), script(f.script));
            assert_eq!(decode_script(&parsed.script_pubkey(), &params), ScriptAddress::Standard(parsed));
        }
    }

    #[test]
    fn non_standard_scripts() {
        let params = Network::Main.params();
        let cases = [
            "",
            // OP_RETURN data carrier
            "6a0b68656c6c6f20776f726c64",
            // Pay-to-pubkey
            "4104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac",
            // P2PKH with a 19-byte hash
            "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f88ac",
            // P2PKH missing OP_CHECKSIG
            "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888",
            // P2SH with trailing byte
            "a914b472a266d0bd89c13706a4132ccfb16f7c3b9fcb8700",
            // Witness v0 with a 21-byte program
            "0015751e76e8199196d454941c45d1b3a323f1433bd6aa",
            // Witness v2
            "5214751e76e8199196d454941c45d1b3a323f1433bd6",
            // Taproot with a 20-byte program
            "5114751e76e8199196d454941c45d1b3a323f1433bd6",
            // 1-of-1 bare multisig
            "51210279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f8179851ae",
        ];
        for case in cases {
            assert_eq!(decode_script(&script(case), &params), ScriptAddress::NonStandard, "{case}");
        }
    }

    #[test]
    fn network_selects_prefixes() {
        let s = script("0014751e76e8199196d454941c45d1b3a323f1433bd6");
        let main = decode_script(&s, &Network::Main.params());
        let test = decode_script(&s, &Network::Test.params());
        assert!(main.address().unwrap().as_str().starts_with("bc1q"));
        assert!(test.address().unwrap().as_str().starts_with("tb1q"));
    }

    #[test]
    fn custom_params_are_honoured() {
        let params = NetworkParams { hrp: "ltc", p2pkh_version: 0x30, p2sh_version: 0x32 };
        let decoded = decode_script(&script("76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac"), &params);
        assert_eq!(decoded.address().unwrap().as_str(), "LUEweDxDA4WhvWiNXXSxjM9CYzHPJv4QQF");
    }

    // --- Parsing ---

    #[test]
    fn parse_uppercase_bech32() {
        let params = Network::Main.params();
        let parsed = Address::parse("BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4", &params).unwrap();
        assert_eq!(parsed.as_str(), "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
    }

    #[test]
    fn parse_rejects_mixed_case() {
        let params = Network::Main.params();
        assert_eq!(
            Address::parse("bc1qW508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", &params).unwrap_err(),
            AddressError::MixedCase
        );
    }

    #[test]
    fn parse_rejects_wrong_checksum_variant() {
        let params = Network::Main.params();
        // v0 program with a Bech32m checksum
        assert_eq!(
            Address::parse("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kemeawh", &params).unwrap_err(),
            AddressError::InvalidChecksum
        );
        // v1 program with a Bech32 checksum
        assert_eq!(
            Address::parse("bc1p0xlxvlhemja6c4dqv22uapctqupfhlxm9h8z3k2e72q4k9hcz7vqh2y7hd", &params).unwrap_err(),
            AddressError::InvalidChecksum
        );
    }

    #[test]
    fn parse_rejects_unsupported_witness() {
        let params = Network::Main.params();
        assert_eq!(
            Address::parse("bc1zw508d6qejxtdg4y5r3zarvary0c5xw7k0w7t5p", &params).unwrap_err(),
            AddressError::InvalidVersion(2)
        );
        assert_eq!(
            Address::parse("bc1qqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqqzmcn54", &params).unwrap_err(),
            AddressError::InvalidLength
        );
    }

    #[test]
    fn parse_rejects_flipped_character() {
        let params = Network::Main.params();
        let mut s = "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4".to_string();
        let last = s.pop().unwrap();
        s.push(if last == 'q' { 'p' } else { 'q' });
        assert_eq!(Address::parse(&s, &params).unwrap_err(), AddressError::InvalidChecksum);
    }

    #[test]
    fn parse_rejects_invalid_character() {
        let params = Network::Main.params();
        assert_eq!(
            Address::parse("bc1qb508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", &params).unwrap_err(),
            AddressError::InvalidCharacter('b')
        );
    }

    #[test]
    fn parse_base58_wrong_network() {
        let params = Network::Test.params();
        assert_eq!(
            Address::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa", &params).unwrap_err(),
            AddressError::UnknownVersionByte(0x00)
        );
    }

    #[test]
    fn parse_base58_bad_checksum() {
        let params = Network::Main.params();
        assert_eq!(
            Address::parse("1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNb", &params).unwrap_err(),
            AddressError::InvalidChecksum
        );
    }

    #[test]
    fn parse_base58_garbage() {
        let params = Network::Main.params();
        assert!(matches!(
            Address::parse("0OIl", &params).unwrap_err(),
            AddressError::InvalidBase58(_)
        ));
        assert_eq!(Address::parse("1111", &params).unwrap_err(), AddressError::InvalidLength);
    }

    #[test]
    fn all_zero_hash_keeps_leading_ones() {
        let mut s = vec![OP_DUP, OP_HASH160, PUSH_20];
        s.extend_from_slice(&[0u8; 20]);
        s.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        let decoded = decode_script(&s, &Network::Main.params());
        assert_eq!(decoded.address().unwrap().as_str(), "1111111111111111111114oLvT2");
    }

    // --- Bech32 internals ---

    #[test]
    fn convert_bits_8_to_5_roundtrip() {
        let original = [0xDE, 0xAD, 0xBE, 0xEF];
        let five_bit = convert_bits(&original, 8, 5, true).unwrap();
        let back = convert_bits(&five_bit, 5, 8, false).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn checksum_variants_differ() {
        let data = vec![0u8; 33];
        assert_ne!(
            bech32_create_checksum("bc", &data, Variant::Bech32),
            bech32_create_checksum("bc", &data, Variant::Bech32m)
        );
    }

    #[test]
    fn checksum_verification_reports_variant() {
        let data: Vec<u8> = vec![1; 53];
        for variant in [Variant::Bech32, Variant::Bech32m] {
            let mut full = data.clone();
            full.extend_from_slice(&bech32_create_checksum("tb", &data, variant));
            assert_eq!(bech32_verify_checksum("tb", &full), Some(variant));
            full[10] ^= 1;
            assert_eq!(bech32_verify_checksum("tb", &full), None);
        }
    }

    proptest! {
        #[test]
        fn arbitrary_scripts_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..64)) {
            let _ = decode_script(&bytes, &Network::Main.params());
        }

        #[test]
        fn p2wsh_programs_reencode(program in proptest::array::uniform32(any::<u8>())) {
            let params = Network::Test.params();
            let mut s = vec![OP_0, PUSH_32];
            s.extend_from_slice(&program);
            let decoded = decode_script(&s, &params);
            let addr = decoded.address().unwrap();
            let parsed = Address::parse(addr.as_str(), &params).unwrap();
            prop_assert_eq!(parsed.script_pubkey(), s);
        }
    }
}
