//! Envelope armoring.
//!
//! Armoring encrypts and authenticates the private part of an envelope for
//! exactly one recipient. The envelope's public header names the agreement
//! it was armed under, so the recipient can pick the right key before
//! decrypting.
//!
//! [`LongTimeArmor`] derives one key per peer from the static X25519
//! identities. Keys are cached after the first agreement with a peer.

use std::fmt;

use dashmap::DashMap;

use crate::aead::AeadKey;
use crate::{AGREEMENT_ID_SIZE, CryptoError, IdentityPublicKey, KeyPair, NONCE_SIZE};

const AGREEMENT_ID_CONTEXT: &str = "skein 2026-01 agreement id";
const AGREEMENT_KEY_CONTEXT: &str = "skein 2026-01 long-time agreement key";

/// Identifier of a key agreement between two nodes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct AgreementId([u8; AGREEMENT_ID_SIZE]);

impl AgreementId {
    /// Wrap raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; AGREEMENT_ID_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; AGREEMENT_ID_SIZE] {
        &self.0
    }

    /// Agreement id of two public keys, independent of their order.
    #[must_use]
    pub fn between(a: &IdentityPublicKey, b: &IdentityPublicKey) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = blake3::Hasher::new_derive_key(AGREEMENT_ID_CONTEXT);
        hasher.update(low.as_bytes());
        hasher.update(high.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for AgreementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AgreementId({}..)", hex::encode(&self.0[..8]))
    }
}

/// Arm and disarm envelope payloads for a peer.
///
/// Implementations must be safe to call concurrently from pipeline stages.
pub trait Armor: Send + Sync {
    /// Agreement this node uses with `peer`.
    ///
    /// # Errors
    ///
    /// Fails when no agreement can be established with the peer key.
    fn agreement_id(&self, peer: &IdentityPublicKey) -> Result<AgreementId, CryptoError>;

    /// Encrypt `plaintext` for `peer`, authenticating `aad`.
    ///
    /// # Errors
    ///
    /// Fails when no agreement exists or encryption fails.
    fn arm(
        &self,
        peer: &IdentityPublicKey,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;

    /// Verify and decrypt `ciphertext` received from `peer` under `agreement`.
    ///
    /// # Errors
    ///
    /// Fails with [`CryptoError::UnknownAgreement`] for a foreign agreement id
    /// and [`CryptoError::DecryptionFailed`] on authentication failure.
    fn disarm(
        &self,
        peer: &IdentityPublicKey,
        agreement: &AgreementId,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError>;
}

struct Agreement {
    id: AgreementId,
    key: AeadKey,
}

/// Armor built on the static X25519 identity keys of both nodes.
pub struct LongTimeArmor {
    keys: KeyPair,
    agreements: DashMap<IdentityPublicKey, Agreement>,
}

impl LongTimeArmor {
    /// Create an armor for the local identity.
    #[must_use]
    pub fn new(keys: KeyPair) -> Self {
        Self {
            keys,
            agreements: DashMap::new(),
        }
    }

    /// Number of peers an agreement has been derived for.
    #[must_use]
    pub fn agreement_count(&self) -> usize {
        self.agreements.len()
    }

    fn with_agreement<T>(
        &self,
        peer: &IdentityPublicKey,
        f: impl FnOnce(&Agreement) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        if let Some(agreement) = self.agreements.get(peer) {
            return f(&agreement);
        }

        let shared = self.keys.secret_key().agree(peer)?;
        let agreement = Agreement {
            id: AgreementId::between(&self.keys.public_key(), peer),
            key: AeadKey::new(blake3::derive_key(AGREEMENT_KEY_CONTEXT, &shared)),
        };
        let entry = self.agreements.entry(*peer).or_insert(agreement);
        f(&entry)
    }
}

impl fmt::Debug for LongTimeArmor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LongTimeArmor")
            .field("identity", &self.keys.public_key())
            .field("agreements", &self.agreements.len())
            .finish()
    }
}

impl Armor for LongTimeArmor {
    fn agreement_id(&self, peer: &IdentityPublicKey) -> Result<AgreementId, CryptoError> {
        self.with_agreement(peer, |agreement| Ok(agreement.id))
    }

    fn arm(
        &self,
        peer: &IdentityPublicKey,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.with_agreement(peer, |agreement| {
            agreement.key.encrypt(nonce, plaintext, aad)
        })
    }

    fn disarm(
        &self,
        peer: &IdentityPublicKey,
        agreement: &AgreementId,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        self.with_agreement(peer, |known| {
            if known.id != *agreement {
                return Err(CryptoError::UnknownAgreement);
            }
            known.key.decrypt(nonce, ciphertext, aad)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn pair() -> (LongTimeArmor, LongTimeArmor, IdentityPublicKey, IdentityPublicKey) {
        let alice = KeyPair::generate(&mut OsRng);
        let bob = KeyPair::generate(&mut OsRng);
        let (a, b) = (alice.public_key(), bob.public_key());
        (LongTimeArmor::new(alice), LongTimeArmor::new(bob), a, b)
    }

    #[test]
    fn test_agreement_id_is_symmetric() {
        let (alice, bob, a, b) = pair();
        assert_eq!(
            alice.agreement_id(&b).unwrap(),
            bob.agreement_id(&a).unwrap()
        );
        assert_eq!(AgreementId::between(&a, &b), AgreementId::between(&b, &a));
    }

    #[test]
    fn test_arm_disarm_round_trip() {
        let (alice, bob, a, b) = pair();
        let nonce = [9u8; NONCE_SIZE];

        let armed = alice.arm(&b, &nonce, b"public header", b"secret body").unwrap();
        let agreement = alice.agreement_id(&b).unwrap();
        let body = bob
            .disarm(&a, &agreement, &nonce, b"public header", &armed)
            .unwrap();
        assert_eq!(body, b"secret body");
        assert_eq!(alice.agreement_count(), 1);
    }

    #[test]
    fn test_disarm_rejects_foreign_agreement() {
        let (alice, bob, a, b) = pair();
        let nonce = [1u8; NONCE_SIZE];
        let armed = alice.arm(&b, &nonce, b"", b"x").unwrap();

        let foreign = AgreementId::from_bytes([0xAA; AGREEMENT_ID_SIZE]);
        assert_eq!(
            bob.disarm(&a, &foreign, &nonce, b"", &armed),
            Err(CryptoError::UnknownAgreement)
        );
    }

    #[test]
    fn test_disarm_rejects_tampered_ciphertext() {
        let (alice, bob, a, b) = pair();
        let nonce = [1u8; NONCE_SIZE];
        let mut armed = alice.arm(&b, &nonce, b"aad", b"payload").unwrap();
        armed[0] ^= 0x01;

        let agreement = bob.agreement_id(&a).unwrap();
        assert_eq!(
            bob.disarm(&a, &agreement, &nonce, b"aad", &armed),
            Err(CryptoError::DecryptionFailed)
        );
    }
}
