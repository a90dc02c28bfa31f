use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BaseCurrencyNetwork {
    Mainnet,
    Testnet,
    Regtest,
}

impl BaseCurrencyNetwork {
    pub fn magic_bytes(&self) -> [u8; 4] {
        match self {
            BaseCurrencyNetwork::Mainnet => [0x0A, 0x7C, 0xE0, 0x01],
            BaseCurrencyNetwork::Testnet => [0x0A, 0x7C, 0xE0, 0x7E],
            BaseCurrencyNetwork::Regtest => [0x0A, 0x7C, 0xE0, 0xFF],
        }
    }

    pub fn default_p2p_port(&self) -> u16 {
        match self {
            BaseCurrencyNetwork::Mainnet => 9999,
            BaseCurrencyNetwork::Testnet => 9998,
            BaseCurrencyNetwork::Regtest => 2002,
        }
    }

    pub fn is_regtest(&self) -> bool {
        matches!(self, BaseCurrencyNetwork::Regtest)
    }

    /// Delay before gossiping a freshly computed state hash, so peers have
    /// time to reach the same height. `jitter_secs` is drawn by the caller.
    pub fn state_hash_broadcast_delay(&self, jitter_secs: u64) -> Duration {
        if self.is_regtest() {
            Duration::from_secs(1)
        } else {
            Duration::from_secs(5 + jitter_secs % 10)
        }
    }

    pub fn data_dir_name(&self) -> &'static str {
        match self {
            BaseCurrencyNetwork::Mainnet => "mainnet",
            BaseCurrencyNetwork::Testnet => "testnet",
            BaseCurrencyNetwork::Regtest => "regtest",
        }
    }
}

impl std::str::FromStr for BaseCurrencyNetwork {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" => Ok(BaseCurrencyNetwork::Mainnet),
            "testnet" => Ok(BaseCurrencyNetwork::Testnet),
            "regtest" => Ok(BaseCurrencyNetwork::Regtest),
            other => Err(format!("Unknown network: {}", other)),
        }
    }
}

impl std::fmt::Display for BaseCurrencyNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaseCurrencyNetwork::Mainnet => write!(f, "Mainnet"),
            BaseCurrencyNetwork::Testnet => write!(f, "Testnet"),
            BaseCurrencyNetwork::Regtest => write!(f, "Regtest"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regtest_broadcast_delay_is_short() {
        assert_eq!(
            BaseCurrencyNetwork::Regtest.state_hash_broadcast_delay(9),
            Duration::from_secs(1)
        );
        let delay = BaseCurrencyNetwork::Mainnet.state_hash_broadcast_delay(23);
        assert_eq!(delay, Duration::from_secs(8));
    }

    #[test]
    fn test_parse_network() {
        assert_eq!(
            "TESTNET".parse::<BaseCurrencyNetwork>().unwrap(),
            BaseCurrencyNetwork::Testnet
        );
        assert!("signet".parse::<BaseCurrencyNetwork>().is_err());
    }
}
