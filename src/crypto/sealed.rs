//! Sealed envelopes for store-and-forward delivery.
//!
//! An envelope is encrypted to the recipient's x25519 key using a fresh
//! ephemeral key per message, then signed by the sender's ed25519 key so the
//! recipient learns who sent it. Nodes relaying the envelope learn neither.

use super::{verify, EncryptionKeyPair, KeyRing, PubKeyBytes, PubKeyRing};
use crate::error::CryptoError;
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

const KEY_LABEL: &[u8] = b"otcnode-sealed-v1";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SealedAndSigned {
    pub ephemeral_pub_key: [u8; 32],
    pub nonce: [u8; 12],
    pub ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
    pub sig_public_key: PubKeyBytes,
}

impl SealedAndSigned {
    fn signed_bytes(ephemeral_pub_key: &[u8; 32], nonce: &[u8; 12], ciphertext: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(32 + 12 + ciphertext.len());
        bytes.extend_from_slice(ephemeral_pub_key);
        bytes.extend_from_slice(nonce);
        bytes.extend_from_slice(ciphertext);
        bytes
    }

    pub fn size(&self) -> usize {
        32 + 12 + self.ciphertext.len() + self.signature.len() + 32
    }
}

fn derive_key(
    shared_secret: &[u8; 32],
    ephemeral_pub_key: &[u8; 32],
    recipient_pub_key: &[u8; 32],
) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
    let mut mac =
        <HmacSha256 as Mac>::new_from_slice(shared_secret).map_err(|_| CryptoError::KeyDerivation)?;
    mac.update(KEY_LABEL);
    mac.update(ephemeral_pub_key);
    mac.update(recipient_pub_key);
    Ok(Zeroizing::new(mac.finalize().into_bytes().into()))
}

/// Seals `plaintext` for the owner of `peers_pub_key_ring`.
pub fn encrypt_and_sign(
    peers_pub_key_ring: &PubKeyRing,
    plaintext: &[u8],
    sender: &KeyRing,
) -> Result<SealedAndSigned, CryptoError> {
    let mut ephemeral_bytes = Zeroizing::new([0u8; 32]);
    rand::thread_rng().fill_bytes(&mut *ephemeral_bytes);
    let ephemeral_secret = StaticSecret::from(*ephemeral_bytes);
    let ephemeral_pub_key = X25519PublicKey::from(&ephemeral_secret).to_bytes();

    let recipient = X25519PublicKey::from(peers_pub_key_ring.encryption_pub_key);
    let shared = ephemeral_secret.diffie_hellman(&recipient);
    let key = derive_key(
        shared.as_bytes(),
        &ephemeral_pub_key,
        &peers_pub_key_ring.encryption_pub_key,
    )?;

    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::EncryptionFailed)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let signature = sender
        .signature_key_pair()
        .sign(&SealedAndSigned::signed_bytes(&ephemeral_pub_key, &nonce, &ciphertext));

    Ok(SealedAndSigned {
        ephemeral_pub_key,
        nonce,
        ciphertext,
        signature,
        sig_public_key: sender.signature_key_pair().public(),
    })
}

/// Opens an envelope addressed to `recipient`.
///
/// Returns the plaintext and the sender's signature key. `DecryptionFailed`
/// is the normal outcome for envelopes meant for someone else.
pub fn decrypt_and_verify(
    sealed: &SealedAndSigned,
    recipient: &EncryptionKeyPair,
) -> Result<(Vec<u8>, PubKeyBytes), CryptoError> {
    let own_pub_key = recipient.public();
    let ephemeral = X25519PublicKey::from(sealed.ephemeral_pub_key);
    let shared = recipient.secret().diffie_hellman(&ephemeral);
    let key = derive_key(shared.as_bytes(), &sealed.ephemeral_pub_key, &own_pub_key)?;

    let cipher = Aes256Gcm::new_from_slice(&key[..]).map_err(|_| CryptoError::DecryptionFailed)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&sealed.nonce), sealed.ciphertext.as_slice())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let signed = SealedAndSigned::signed_bytes(&sealed.ephemeral_pub_key, &sealed.nonce, &sealed.ciphertext);
    if !verify(&sealed.sig_public_key, &signed, &sealed.signature) {
        return Err(CryptoError::InvalidSignature);
    }

    Ok((plaintext, sealed.sig_public_key))
}
