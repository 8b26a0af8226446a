//! Local node identity.

use rand_core::OsRng;
use skein_crypto::{IdentityPublicKey, KeyPair, ProofOfWork};

/// Key pair and proof-of-work of the local node.
#[derive(Clone, Debug)]
pub struct Identity {
    keys: KeyPair,
    proof_of_work: ProofOfWork,
}

impl Identity {
    /// Combine an existing key pair with its proof-of-work.
    #[must_use]
    pub fn new(keys: KeyPair, proof_of_work: ProofOfWork) -> Self {
        Self {
            keys,
            proof_of_work,
        }
    }

    /// Generate a fresh identity whose proof-of-work meets `difficulty`.
    #[must_use]
    pub fn generate(difficulty: u8) -> Self {
        let keys = KeyPair::generate(&mut OsRng);
        let proof_of_work = ProofOfWork::generate(&keys.public_key(), difficulty);
        Self::new(keys, proof_of_work)
    }

    /// Public key of this node.
    #[must_use]
    pub fn public_key(&self) -> IdentityPublicKey {
        self.keys.public_key()
    }

    /// Proof-of-work stamp of this node.
    #[must_use]
    pub fn proof_of_work(&self) -> ProofOfWork {
        self.proof_of_work
    }

    /// Key pair of this node.
    #[must_use]
    pub fn key_pair(&self) -> &KeyPair {
        &self.keys
    }
}
