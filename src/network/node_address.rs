use crate::error::NetworkError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address of a peer as it is advertised on the network (`host:port`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn full_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| NetworkError::InvalidAddress(s.to_string()))?;
        if host.is_empty() {
            return Err(NetworkError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| NetworkError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_node_address() {
        let address: NodeAddress = "seed1.example.onion:8000".parse().unwrap();
        assert_eq!(address.host, "seed1.example.onion");
        assert_eq!(address.port, 8000);
        assert_eq!(address.full_address(), "seed1.example.onion:8000");
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        assert!("localhost".parse::<NodeAddress>().is_err());
        assert!(":9999".parse::<NodeAddress>().is_err());
        assert!("localhost:notaport".parse::<NodeAddress>().is_err());
    }
}
