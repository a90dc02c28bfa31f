//! Cryptographic boundary.
//!
//! The storage layer only ever calls `sign`, `verify` and `hash`; mailbox
//! delivery additionally seals and opens envelopes (see [`sealed`]).

pub mod sealed;

use crate::error::CryptoError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub type Hash256 = [u8; 32];

/// SHA-256 over arbitrary bytes.
pub fn hash(bytes: &[u8]) -> Hash256 {
    Sha256::digest(bytes).into()
}

/// Canonical bincode encoding used for hashing and signing.
///
/// The in-memory types passed here are plain data (no unsized sequences),
/// so encoding cannot fail; an empty encoding would only ever hash to a key
/// that no valid signature covers.
pub fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Vec<u8> {
    bincode::serialize(value).unwrap_or_default()
}

pub fn hash_of<T: Serialize + ?Sized>(value: &T) -> Hash256 {
    hash(&canonical_bytes(value))
}

fn random_32_bytes() -> [u8; 32] {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Raw ed25519 public key bytes as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PubKeyBytes(pub [u8; 32]);

impl PubKeyBytes {
    pub fn to_verifying_key(&self) -> Result<VerifyingKey, CryptoError> {
        VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidPublicKey)?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self(array))
    }
}

impl std::fmt::Debug for PubKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PubKey({}..)", &self.to_hex()[..12])
    }
}

impl std::fmt::Display for PubKeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn sign(key: &SigningKey, data: &[u8]) -> Vec<u8> {
    key.sign(data).to_bytes().to_vec()
}

/// Returns false for malformed keys or signatures as well as for mismatches.
pub fn verify(pub_key: &PubKeyBytes, data: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = pub_key.to_verifying_key() else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    verifying_key.verify(data, &signature).is_ok()
}

/// Storage/ownership key pair (ed25519).
#[derive(Clone)]
pub struct SignatureKeyPair {
    key: SigningKey,
}

impl SignatureKeyPair {
    pub fn generate() -> Self {
        Self::from_secret_bytes(&random_32_bytes())
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn public(&self) -> PubKeyBytes {
        PubKeyBytes(self.key.verifying_key().to_bytes())
    }

    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        sign(&self.key, data)
    }
}

impl std::fmt::Debug for SignatureKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureKeyPair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

/// Sealing key pair (x25519).
#[derive(Clone)]
pub struct EncryptionKeyPair {
    secret: StaticSecret,
}

impl EncryptionKeyPair {
    pub fn generate() -> Self {
        Self::from_secret_bytes(random_32_bytes())
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: StaticSecret::from(bytes),
        }
    }

    pub fn public(&self) -> [u8; 32] {
        X25519PublicKey::from(&self.secret).to_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

/// The public half of a [`KeyRing`], published so others can seal
/// messages to us and verify our storage signatures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PubKeyRing {
    pub signature_pub_key: PubKeyBytes,
    pub encryption_pub_key: [u8; 32],
}

#[derive(Clone)]
pub struct KeyRing {
    signature_key_pair: SignatureKeyPair,
    encryption_key_pair: EncryptionKeyPair,
}

impl KeyRing {
    pub fn generate() -> Self {
        Self {
            signature_key_pair: SignatureKeyPair::generate(),
            encryption_key_pair: EncryptionKeyPair::generate(),
        }
    }

    pub fn signature_key_pair(&self) -> &SignatureKeyPair {
        &self.signature_key_pair
    }

    pub fn encryption_key_pair(&self) -> &EncryptionKeyPair {
        &self.encryption_key_pair
    }

    pub fn pub_key_ring(&self) -> PubKeyRing {
        PubKeyRing {
            signature_pub_key: self.signature_key_pair.public(),
            encryption_pub_key: self.encryption_key_pair.public(),
        }
    }

    pub fn to_persisted(&self) -> PersistedKeyRing {
        PersistedKeyRing {
            signature_secret: self.signature_key_pair.key.to_bytes(),
            encryption_secret: self.encryption_key_pair.secret.to_bytes(),
        }
    }

    pub fn from_persisted(persisted: &PersistedKeyRing) -> Self {
        Self {
            signature_key_pair: SignatureKeyPair::from_secret_bytes(&persisted.signature_secret),
            encryption_key_pair: EncryptionKeyPair::from_secret_bytes(persisted.encryption_secret),
        }
    }
}

impl std::fmt::Debug for KeyRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRing")
            .field("pub_key_ring", &self.pub_key_ring())
            .finish_non_exhaustive()
    }
}

/// On-disk form of a key ring; wiped from memory when dropped.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct PersistedKeyRing {
    signature_secret: [u8; 32],
    encryption_secret: [u8; 32],
}
