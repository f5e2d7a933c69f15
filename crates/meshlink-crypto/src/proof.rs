//! Handshake Proofs
//!
//! A direct path probe carries a proof that the sender owns the key it
//! claims and knows the nonce of the current negotiation. The proof is a
//! keyed BLAKE3 hash under a key derived from the pair's shared secret.

use serde::{Deserialize, Serialize};

use crate::constants::{NONCE_SIZE, PROOF_SIZE};
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{PublicKey, SharedSecret};

const PROOF_CONTEXT: &str = "meshlink 2024-06 direct path probe";
const KEEPALIVE_CONTEXT: &str = "meshlink 2024-06 session keepalive";

/// Random per-negotiation nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    /// Generate a new random nonce
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != NONCE_SIZE {
            return Err(CryptoError::InvalidNonceLength {
                expected: NONCE_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; NONCE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }
}

/// Proof attached to a punch packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeProof(pub [u8; PROOF_SIZE]);

impl HandshakeProof {
    /// Create a proof for `sender` over `nonce`
    pub fn create(shared: &SharedSecret, sender: &PublicKey, nonce: &Nonce) -> Self {
        let key = shared.derive_key(PROOF_CONTEXT);
        let mut hasher = blake3::Hasher::new_keyed(&key);
        hasher.update(sender.as_bytes());
        hasher.update(&nonce.0);
        Self(*hasher.finalize().as_bytes())
    }

    /// Check a received proof (constant time)
    pub fn verify(&self, shared: &SharedSecret, sender: &PublicKey, nonce: &Nonce) -> bool {
        let expected = Self::create(shared, sender, nonce);
        blake3::Hash::from(expected.0) == blake3::Hash::from(self.0)
    }

    /// Tag for keepalive `seq` sent by `sender`; `reply` tells a keepalive
    /// from its acknowledgment
    pub fn keepalive(shared: &SharedSecret, sender: &PublicKey, seq: u64, reply: bool) -> Self {
        let key = shared.derive_key(KEEPALIVE_CONTEXT);
        let mut hasher = blake3::Hasher::new_keyed(&key);
        hasher.update(sender.as_bytes());
        hasher.update(&seq.to_be_bytes());
        hasher.update(&[reply as u8]);
        Self(*hasher.finalize().as_bytes())
    }

    /// Check a keepalive tag (constant time)
    pub fn verify_keepalive(
        &self,
        shared: &SharedSecret,
        sender: &PublicKey,
        seq: u64,
        reply: bool,
    ) -> bool {
        let expected = Self::keepalive(shared, sender, seq, reply);
        blake3::Hash::from(expected.0) == blake3::Hash::from(self.0)
    }

    /// Verify, returning an error on mismatch
    pub fn check(&self, shared: &SharedSecret, sender: &PublicKey, nonce: &Nonce) -> CryptoResult<()> {
        if self.verify(shared, sender, nonce) {
            Ok(())
        } else {
            Err(CryptoError::ProofMismatch)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;

    #[test]
    fn test_proof_rejects_wrong_nonce() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let shared = alice.secret.diffie_hellman(&bob.public);

        let proof = HandshakeProof::create(&shared, &alice.public, &Nonce::random());
        assert!(proof.check(&shared, &alice.public, &Nonce::random()).is_err());
    }

    #[test]
    fn test_proof_rejects_third_party() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mallory = KeyPair::generate();
        let nonce = Nonce::random();

        // Mallory claims to be Alice but only has her own secret
        let forged_secret = mallory.secret.diffie_hellman(&bob.public);
        let forged = HandshakeProof::create(&forged_secret, &alice.public, &nonce);

        let bob_view = bob.secret.diffie_hellman(&alice.public);
        assert!(!forged.verify(&bob_view, &alice.public, &nonce));
    }

    #[test]
    fn test_keepalive_tag_binds_sequence_and_direction() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let shared = alice.secret.diffie_hellman(&bob.public);
        let bob_view = bob.secret.diffie_hellman(&alice.public);

        let tag = HandshakeProof::keepalive(&shared, &alice.public, 41, false);
        assert!(tag.verify_keepalive(&bob_view, &alice.public, 41, false));
        assert!(!tag.verify_keepalive(&bob_view, &alice.public, 42, false));
        assert!(!tag.verify_keepalive(&bob_view, &alice.public, 41, true));

        let punch_proof = HandshakeProof::create(&shared, &alice.public, &Nonce([0u8; 16]));
        assert_ne!(punch_proof, tag);
    }

    #[test]
    fn test_nonce_length() {
        assert!(Nonce::try_from_slice(&[0u8; 16]).is_ok());
        assert!(matches!(
            Nonce::try_from_slice(&[0u8; 4]),
            Err(CryptoError::InvalidNonceLength { expected: 16, actual: 4 })
        ));
    }
}
