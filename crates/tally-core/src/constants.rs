//! Network parameters and monetary constants.
//!
//! Address prefixes are never hard-coded inside the codec: callers obtain a
//! [`NetworkParams`] from [`Network::params`] and pass it to
//! [`decode_script`](crate::address::decode_script).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Number of satoshis in one coin.
pub const COIN: u64 = 100_000_000;

/// Maximum number of fractional digits in a ledger-reported coin amount.
pub const AMOUNT_DECIMALS: usize = 8;

/// The ledger network an index is built for.
///
/// # Examples
///
/// ```
/// use tally_core::constants::Network;
/// assert_eq!(Network::default(), Network::Main);
/// assert_eq!(Network::Test.params().hrp, "tb");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Production network.
    #[default]
    Main,
    /// Public test network.
    Test,
}

impl Network {
    /// Address-encoding parameters for this network.
    pub fn params(&self) -> NetworkParams {
        match self {
            Self::Main => NetworkParams {
                hrp: "bc",
                p2pkh_version: 0x00,
                p2sh_version: 0x05,
            },
            Self::Test => NetworkParams {
                hrp: "tb",
                p2pkh_version: 0x6f,
                p2sh_version: 0xc4,
            },
        }
    }

    /// Subdirectory name appended to the base data directory path.
    ///
    /// # Examples
    ///
    /// ```
    /// use tally_core::constants::Network;
    /// assert_eq!(Network::Test.data_dir_suffix(), "testnet");
    /// ```
    pub fn data_dir_suffix(&self) -> &'static str {
        match self {
            Self::Main => "mainnet",
            Self::Test => "testnet",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Main => write!(f, "main"),
            Self::Test => write!(f, "test"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "main" | "mainnet" => Ok(Self::Main),
            "test" | "testnet" | "testnet4" => Ok(Self::Test),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// Address-encoding parameters of one network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkParams {
    /// Bech32 human-readable part for witness addresses.
    pub hrp: &'static str,
    /// Base58check version byte for pay-to-public-key-hash.
    pub p2pkh_version: u8,
    /// Base58check version byte for pay-to-script-hash.
    pub p2sh_version: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_params() {
        let p = Network::Main.params();
        assert_eq!(p.hrp, "bc");
        assert_eq!(p.p2pkh_version, 0x00);
        assert_eq!(p.p2sh_version, 0x05);
    }

    #[test]
    fn test_params() {
        let p = Network::Test.params();
        assert_eq!(p.hrp, "tb");
        assert_eq!(p.p2pkh_version, 0x6f);
        assert_eq!(p.p2sh_version, 0xc4);
    }

    #[test]
    fn parse_aliases() {
        assert_eq!("mainnet".parse::<Network>().unwrap(), Network::Main);
        assert_eq!("TEST".parse::<Network>().unwrap(), Network::Test);
        assert_eq!("testnet4".parse::<Network>().unwrap(), Network::Test);
        assert!("regtest".parse::<Network>().is_err());
    }

    #[test]
    fn serde_uses_lowercase_names() {
        assert_eq!(serde_json::to_string(&Network::Test).unwrap(), "\"test\"");
        let net: Network = serde_json::from_str("\"main\"").unwrap();
        assert_eq!(net, Network::Main);
    }

    #[test]
    fn display_roundtrip() {
        for net in [Network::Main, Network::Test] {
            assert_eq!(net.to_string().parse::<Network>().unwrap(), net);
        }
    }
}
