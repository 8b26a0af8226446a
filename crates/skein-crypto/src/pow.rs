//! Proof-of-work stamps.
//!
//! A node proves it spent work on its identity by finding a nonce whose
//! BLAKE3 hash together with the public key starts with `difficulty` zero
//! hex digits. Receivers drop envelopes whose sender stamp is too weak.

use serde::{Deserialize, Serialize};

use crate::IdentityPublicKey;

/// Proof-of-work nonce carried in every envelope header.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProofOfWork(i32);

impl ProofOfWork {
    /// Wrap a raw nonce.
    #[must_use]
    pub const fn new(nonce: i32) -> Self {
        Self(nonce)
    }

    /// Raw nonce.
    #[must_use]
    pub const fn nonce(&self) -> i32 {
        self.0
    }

    /// Search for the first nonce satisfying `difficulty` for `key`.
    ///
    /// Cost grows by a factor of 16 per difficulty step.
    #[must_use]
    pub fn generate(key: &IdentityPublicKey, difficulty: u8) -> Self {
        let mut nonce = 0i32;
        loop {
            let candidate = Self(nonce);
            if candidate.is_valid(key, difficulty) {
                return candidate;
            }
            nonce = nonce.wrapping_add(1);
        }
    }

    /// Whether this stamp satisfies `difficulty` for `key`.
    #[must_use]
    pub fn is_valid(&self, key: &IdentityPublicKey, difficulty: u8) -> bool {
        leading_zero_nibbles(&self.digest(key)) >= u32::from(difficulty)
    }

    fn digest(&self, key: &IdentityPublicKey) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(key.as_bytes());
        hasher.update(&self.0.to_be_bytes());
        *hasher.finalize().as_bytes()
    }
}

fn leading_zero_nibbles(digest: &[u8]) -> u32 {
    let mut count = 0;
    for byte in digest {
        if *byte == 0 {
            count += 2;
            continue;
        }
        if byte >> 4 == 0 {
            count += 1;
        }
        break;
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeyPair;
    use rand_core::OsRng;

    #[test]
    fn test_leading_zero_nibbles() {
        assert_eq!(leading_zero_nibbles(&[0x00, 0x00, 0x1f]), 5);
        assert_eq!(leading_zero_nibbles(&[0x0f, 0xff]), 1);
        assert_eq!(leading_zero_nibbles(&[0xf0]), 0);
    }

    #[test]
    fn test_generate_meets_difficulty() {
        let key = KeyPair::generate(&mut OsRng).public_key();
        let pow = ProofOfWork::generate(&key, 2);
        assert!(pow.is_valid(&key, 2));
        assert!(pow.is_valid(&key, 0));
    }

    #[test]
    fn test_weak_stamp_is_rejected() {
        let key = KeyPair::generate(&mut OsRng).public_key();
        let weak = (0..)
            .map(ProofOfWork::new)
            .find(|pow| !pow.is_valid(&key, 2))
            .unwrap();
        assert!(!weak.is_valid(&key, 2));
        assert!(weak.is_valid(&key, 0));
    }
}
