//! Seed node addresses per network.

use crate::error::NetworkError;
use crate::network::node_address::NodeAddress;
use crate::network_type::BaseCurrencyNetwork;

const MAINNET_SEEDS: &[&str] = &[
    "seed1.otcnode.net:9999",
    "seed2.otcnode.net:9999",
    "seed3.otcnode.net:9999",
];

const TESTNET_SEEDS: &[&str] = &["testnet-seed1.otcnode.net:9998", "testnet-seed2.otcnode.net:9998"];

const REGTEST_SEEDS: &[&str] = &["127.0.0.1:2002", "127.0.0.1:3002"];

pub fn default_seed_nodes(network: &BaseCurrencyNetwork) -> Vec<NodeAddress> {
    let seeds = match network {
        BaseCurrencyNetwork::Mainnet => MAINNET_SEEDS,
        BaseCurrencyNetwork::Testnet => TESTNET_SEEDS,
        BaseCurrencyNetwork::Regtest => REGTEST_SEEDS,
    };
    seeds.iter().filter_map(|s| s.parse().ok()).collect()
}

/// Parses `host[:port]` entries; a missing port means the network default.
pub fn parse_seed_nodes(entries: &[String], network: &BaseCurrencyNetwork) -> Result<Vec<NodeAddress>, NetworkError> {
    let mut seeds: Vec<NodeAddress> = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let address = if entry.contains(':') {
            entry.parse()?
        } else {
            NodeAddress::new(entry, network.default_p2p_port())
        };
        if !seeds.contains(&address) {
            seeds.push(address);
        }
    }
    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_seed_nodes_fills_default_port() {
        let entries = vec![
            "seed.example".to_string(),
            "other.example:4000".to_string(),
            "seed.example:9999".to_string(),
            " ".to_string(),
        ];
        let seeds = parse_seed_nodes(&entries, &BaseCurrencyNetwork::Mainnet).unwrap();
        assert_eq!(
            seeds,
            vec![
                NodeAddress::new("seed.example", 9999),
                NodeAddress::new("other.example", 4000)
            ]
        );
        assert!(parse_seed_nodes(&["bad:port".to_string()], &BaseCurrencyNetwork::Mainnet).is_err());
    }

    #[test]
    fn test_every_network_has_seeds() {
        for network in [
            BaseCurrencyNetwork::Mainnet,
            BaseCurrencyNetwork::Testnet,
            BaseCurrencyNetwork::Regtest,
        ] {
            assert!(!default_seed_nodes(&network).is_empty());
        }
    }
}
