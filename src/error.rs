use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlEncode(#[from] toml::ser::Error),

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Initialization error: {0}")]
    Initialization(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to open {name} database: {source}")]
    DatabaseOpen {
        name: String,
        #[source]
        source: sled::Error,
    },

    #[error("Database operation failed: {0}")]
    DatabaseOp(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<sled::Error> for StorageError {
    fn from(e: sled::Error) -> Self {
        StorageError::DatabaseOp(e.to_string())
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Peer {0} not connected")]
    NotConnected(String),

    #[error("Connection {0} is closed")]
    ConnectionClosed(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Invalid node address: {0}")]
    InvalidAddress(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        NetworkError::Io(e.to_string())
    }
}

/// Decoding failures keep peer garbage apart from our own encoding bugs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// The peer sent bytes we cannot interpret.
    #[error("Malformed data from peer: {0}")]
    Foreign(String),

    /// We failed to encode one of our own messages.
    #[error("Internal encoding failure: {0}")]
    Internal(String),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Encryption failed")]
    EncryptionFailed,

    /// Expected when a sealed message was not addressed to us.
    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Key derivation failed")]
    KeyDerivation,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Error, Debug)]
pub enum MailboxError {
    #[error("The P2P network is not ready yet")]
    NetworkNotReady,

    #[error("Sending a mailbox message to ourselves is not supported")]
    SendToSelf,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_kinds_are_distinct() {
        let foreign = ProtocolError::Foreign("bad tag".to_string());
        let internal = ProtocolError::Internal("bad tag".to_string());
        assert_ne!(foreign, internal);
        assert!(foreign.to_string().starts_with("Malformed data from peer"));
    }

    #[test]
    fn test_network_error_wraps_protocol_error() {
        let err: NetworkError = ProtocolError::FrameTooLarge { size: 11, max: 10 }.into();
        assert_eq!(err.to_string(), "Frame too large: 11 bytes (max: 10)");
    }
}
