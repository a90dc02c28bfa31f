//! Node configuration.
//!
//! A TOML file with one section per subsystem. On first run the file is
//! written with defaults for the selected network, and the data directory
//! is created under the platform's home directory.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::PubKeyBytes;
use crate::error::AppError;
use crate::monitoring::Checkpoint;
use crate::network::node_address::NodeAddress;
use crate::network_type::BaseCurrencyNetwork;
use crate::seed_nodes;
use crate::storage::P2PDataStorageConfig;

/// Platform-specific base data directory.
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\otcnode
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("otcnode")
    } else {
        // Linux/Mac: ~/.otcnode
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".otcnode")
    }
}

/// Mainnet lives in the base directory, the others in a subdirectory.
pub fn get_network_data_dir(network: &BaseCurrencyNetwork) -> PathBuf {
    let base = get_data_dir();
    match network {
        BaseCurrencyNetwork::Mainnet => base,
        other => base.join(other.data_dir_name()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default = "default_network")]
    pub network: String,
}

fn default_network() -> String {
    "regtest".to_string()
}

impl NodeConfig {
    pub fn network_type(&self) -> BaseCurrencyNetwork {
        self.network
            .parse()
            .unwrap_or(BaseCurrencyNetwork::Regtest)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_address: String,
    /// Address we advertise to peers. Defaults to the listen address.
    pub external_address: Option<String>,
    /// Seed nodes as `host[:port]`. Empty means the network's defaults.
    #[serde(default)]
    pub seed_nodes: Vec<String>,
    /// Run as a seed node: serve data and skip the initial sync from other seeds.
    #[serde(default)]
    pub is_seed_node: bool,
}

impl NetworkConfig {
    pub fn full_listen_address(&self, network_type: &BaseCurrencyNetwork) -> String {
        if self.listen_address.contains(':') {
            self.listen_address.clone()
        } else {
            format!("{}:{}", self.listen_address, network_type.default_p2p_port())
        }
    }

    pub fn advertised_address(&self, network_type: &BaseCurrencyNetwork) -> Result<NodeAddress, AppError> {
        let raw = match &self.external_address {
            Some(external) if !external.is_empty() => {
                if external.contains(':') {
                    external.clone()
                } else {
                    format!("{}:{}", external, network_type.default_p2p_port())
                }
            }
            _ => self.full_listen_address(network_type),
        };
        raw.parse()
            .map_err(|e| AppError::Config(format!("advertised address {}: {}", raw, e)))
    }

    pub fn seed_node_addresses(&self, network_type: &BaseCurrencyNetwork) -> Result<Vec<NodeAddress>, AppError> {
        if self.seed_nodes.is_empty() {
            return Ok(seed_nodes::default_seed_nodes(network_type));
        }
        seed_nodes::parse_seed_nodes(&self.seed_nodes, network_type)
            .map_err(|e| AppError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    #[serde(default = "default_max_sequence_number_map_size")]
    pub max_sequence_number_map_size_before_purge: usize,
    #[serde(default = "default_check_ttl_interval_secs")]
    pub check_ttl_interval_secs: u64,
}

fn default_max_sequence_number_map_size() -> usize {
    1000
}

fn default_check_ttl_interval_secs() -> u64 {
    60
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join("db")
    }

    pub fn p2p_data_storage_config(&self) -> P2PDataStorageConfig {
        P2PDataStorageConfig {
            max_sequence_number_map_size_before_purge: self.max_sequence_number_map_size_before_purge,
            check_ttl_interval: Duration::from_secs(self.check_ttl_interval_secs.max(1)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Periodically resend our persisted mailbox entries. Off by default.
    #[serde(default)]
    pub republish_mailbox_entries: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub height: u32,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dao_checkpoints: Vec<CheckpointConfig>,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dao_checkpoints: Vec::new(),
        }
    }
}

impl MonitoringConfig {
    pub fn checkpoints(&self) -> Result<Vec<Checkpoint>, AppError> {
        self.dao_checkpoints
            .iter()
            .map(|c| Checkpoint::from_hex(c.height, &c.hash))
            .collect()
    }
}

fn default_true() -> bool {
    true
}

/// Keys allowed to publish alerts, filters and dispute agents, plus signer
/// keys whose account signatures are no longer trusted. Hex encoded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub privileged_pub_keys: Vec<String>,
    #[serde(default)]
    pub banned_signer_pub_keys: Vec<String>,
}

fn parse_keys(keys: &[String], what: &str) -> Result<HashSet<PubKeyBytes>, AppError> {
    keys.iter()
        .map(|k| PubKeyBytes::from_hex(k).map_err(|e| AppError::Config(format!("{} {}: {}", what, k, e))))
        .collect()
}

impl FilterConfig {
    pub fn privileged_keys(&self) -> Result<HashSet<PubKeyBytes>, AppError> {
        parse_keys(&self.privileged_pub_keys, "privileged key")
    }

    pub fn banned_signer_keys(&self) -> Result<HashSet<PubKeyBytes>, AppError> {
        parse_keys(&self.banned_signer_pub_keys, "banned signer key")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`
    pub format: String,
    /// `stdout` or `file`
    pub output: String,
    pub file_path: String,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, AppError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self {
            node: NodeConfig {
                name: "otcnode".to_string(),
                network: default_network(),
            },
            network: NetworkConfig {
                listen_address: "127.0.0.1".to_string(),
                external_address: None,
                seed_nodes: vec![],
                is_seed_node: false,
            },
            storage: StorageConfig {
                data_dir: String::new(),
                max_sequence_number_map_size_before_purge: default_max_sequence_number_map_size(),
                check_ttl_interval_secs: default_check_ttl_interval_secs(),
            },
            mailbox: MailboxConfig::default(),
            monitoring: MonitoringConfig::default(),
            filter: FilterConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
                output: "stdout".to_string(),
                file_path: "./logs/otcnode.log".to_string(),
            },
        }
    }

    /// Loads `path`, or writes defaults for `network_type` there first.
    pub fn load_or_create(path: &str, network_type: &BaseCurrencyNetwork) -> Result<Self, AppError> {
        let data_dir = get_network_data_dir(network_type);

        if fs::metadata(path).is_ok() {
            let mut config = Self::load_from_file(path)?;
            if config.storage.data_dir.is_empty() {
                config.storage.data_dir = data_dir.to_string_lossy().to_string();
            }
            fs::create_dir_all(&config.storage.data_dir)?;
            Ok(config)
        } else {
            fs::create_dir_all(&data_dir)?;
            let mut config = Config::default();
            config.node.network = network_type.data_dir_name().to_string();
            config.storage.data_dir = data_dir.to_string_lossy().to_string();
            config.save_to_file(path)?;
            Ok(config)
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), AppError> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.storage.data_dir = dir.path().join("data").to_string_lossy().to_string();
        config.mailbox.republish_mailbox_entries = true;
        config.save_to_file(path).unwrap();

        let loaded = Config::load_or_create(path, &BaseCurrencyNetwork::Regtest).unwrap();
        assert!(loaded.mailbox.republish_mailbox_entries);
        assert_eq!(loaded.node.network_type(), BaseCurrencyNetwork::Regtest);
        assert!(dir.path().join("data").exists());
    }

    #[test]
    fn test_optional_sections_default() {
        let toml = r#"
            [node]
            name = "seed"
            network = "testnet"

            [network]
            listen_address = "0.0.0.0"

            [storage]
            data_dir = "/tmp/otc"

            [logging]
            level = "debug"
            format = "json"
            output = "stdout"
            file_path = ""
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.node.network_type(), BaseCurrencyNetwork::Testnet);
        assert!(!config.mailbox.republish_mailbox_entries);
        assert!(config.monitoring.enabled);
        assert_eq!(config.storage.max_sequence_number_map_size_before_purge, 1000);
        assert_eq!(
            config.network.full_listen_address(&BaseCurrencyNetwork::Testnet),
            "0.0.0.0:9998"
        );
    }

    #[test]
    fn test_bad_filter_key_is_a_config_error() {
        let filter = FilterConfig {
            privileged_pub_keys: vec!["zz".to_string()],
            banned_signer_pub_keys: vec![],
        };
        assert!(matches!(filter.privileged_keys(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_checkpoints_parse() {
        let monitoring = MonitoringConfig {
            enabled: true,
            dao_checkpoints: vec![CheckpointConfig {
                height: 10,
                hash: "00".repeat(32),
            }],
        };
        assert_eq!(monitoring.checkpoints().unwrap()[0].height, 10);
    }
}
