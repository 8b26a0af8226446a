//! # skein Crypto
//!
//! Cryptographic primitives for the skein overlay.
//!
//! This crate provides:
//! - X25519 identity keys and their hex text form
//! - Proof-of-work stamps binding an identity to a difficulty
//! - Long-time key agreements with stable agreement ids
//! - `XChaCha20-Poly1305` armoring of envelope payloads
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Agreement | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | Hash / KDF | BLAKE3 | 128-bit collision |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod armor;
pub mod error;
pub mod keys;
pub mod pow;

pub use armor::{AgreementId, Armor, LongTimeArmor};
pub use error::CryptoError;
pub use keys::{IdentityPublicKey, IdentitySecretKey, KeyPair};
pub use pow::ProofOfWork;

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const SECRET_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size, also the size of an envelope nonce
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// Agreement id size
pub const AGREEMENT_ID_SIZE: usize = 32;
