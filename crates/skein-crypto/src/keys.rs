//! X25519 identity keys.
//!
//! A node is identified by its X25519 public key. The same key is used for
//! long-time agreements when armoring envelopes, so there is no separate
//! signing key.

use std::fmt;
use std::str::FromStr;

use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::{CryptoError, PUBLIC_KEY_SIZE};

/// Public identity of a node (32-byte X25519 public key).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityPublicKey([u8; PUBLIC_KEY_SIZE]);

impl IdentityPublicKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse a key from a slice.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if the slice is not 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; PUBLIC_KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: PUBLIC_KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self(array))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_SIZE] {
        &self.0
    }

    /// Lowercase hex form of the key.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub(crate) fn to_dalek(self) -> x25519_dalek::PublicKey {
        x25519_dalek::PublicKey::from(self.0)
    }
}

impl fmt::Display for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for IdentityPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Eight bytes are plenty to tell peers apart in logs.
        write!(f, "IdentityPublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

impl FromStr for IdentityPublicKey {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for IdentityPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for IdentityPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// Secret half of a node identity.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct IdentitySecretKey(x25519_dalek::StaticSecret);

impl IdentitySecretKey {
    /// Generate a new random secret key.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self(x25519_dalek::StaticSecret::random_from_rng(rng))
    }

    /// Import from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(x25519_dalek::StaticSecret::from(bytes))
    }

    /// Derive the matching public key.
    #[must_use]
    pub fn public_key(&self) -> IdentityPublicKey {
        IdentityPublicKey(*x25519_dalek::PublicKey::from(&self.0).as_bytes())
    }

    /// Diffie-Hellman with a peer's public key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] when the peer key is a
    /// low-order point and the shared secret would be all zeros.
    pub(crate) fn agree(&self, peer: &IdentityPublicKey) -> Result<[u8; 32], CryptoError> {
        let shared = self.0.diffie_hellman(&peer.to_dalek());
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }
        Ok(*shared.as_bytes())
    }
}

impl fmt::Debug for IdentitySecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("IdentitySecretKey(..)")
    }
}

/// Public and secret key of one identity.
#[derive(Clone, Debug)]
pub struct KeyPair {
    secret: IdentitySecretKey,
    public: IdentityPublicKey,
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self::from_secret(IdentitySecretKey::generate(rng))
    }

    /// Build a key pair from an existing secret key.
    #[must_use]
    pub fn from_secret(secret: IdentitySecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Public identity.
    #[must_use]
    pub fn public_key(&self) -> IdentityPublicKey {
        self.public
    }

    /// Secret key.
    #[must_use]
    pub fn secret_key(&self) -> &IdentitySecretKey {
        &self.secret
    }
}
