use crate::crypto::Hash256;
use crate::error::AppError;
use crate::monitoring::state_hash::StateHash;
use serde::{Deserialize, Serialize};

/// A known-good DAO state hash at a given height.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub height: u32,
    pub hash: Hash256,
}

impl Checkpoint {
    pub fn from_hex(height: u32, hash_hex: &str) -> Result<Self, AppError> {
        let bytes = hex::decode(hash_hex.trim())
            .map_err(|e| AppError::Config(format!("checkpoint at {}: {}", height, e)))?;
        let hash: Hash256 = bytes
            .try_into()
            .map_err(|_| AppError::Config(format!("checkpoint at {}: hash must be 32 bytes", height)))?;
        Ok(Self { height, hash })
    }
}

/// Checks every checkpoint our chain reaches. Returns the number passed,
/// or the first checkpoint we disagree with.
pub fn verify_checkpoints(chain: &[StateHash], checkpoints: &[Checkpoint]) -> Result<usize, Checkpoint> {
    let mut passed = 0;
    for checkpoint in checkpoints {
        let Some(ours) = chain.iter().find(|h| h.height == checkpoint.height) else {
            continue;
        };
        if ours.hash != checkpoint.hash {
            return Err(checkpoint.clone());
        }
        passed += 1;
    }
    Ok(passed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::state_hash::build_chain;

    #[test]
    fn test_unreached_checkpoints_are_skipped() {
        let chain = build_chain([(10, &b"x"[..]), (11, &b"y"[..])]);
        let good = Checkpoint {
            height: 11,
            hash: chain[1].hash,
        };
        let future = Checkpoint {
            height: 500,
            hash: [0; 32],
        };
        assert_eq!(verify_checkpoints(&chain, &[good.clone(), future]), Ok(1));

        let bad = Checkpoint {
            height: 10,
            hash: [1; 32],
        };
        assert_eq!(verify_checkpoints(&chain, &[good, bad.clone()]), Err(bad));
    }

    #[test]
    fn test_checkpoint_from_hex() {
        let hex = "ab".repeat(32);
        assert_eq!(Checkpoint::from_hex(3, &hex).unwrap().hash, [0xab; 32]);
        assert!(Checkpoint::from_hex(3, "abcd").is_err());
    }
}
