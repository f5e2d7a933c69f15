//! MeshLink Cryptographic Primitives
//!
//! Key material used by the mesh:
//! - Peer identity keys (X25519)
//! - Shared secret derivation between two peers
//! - Handshake proofs for direct path probing (keyed BLAKE3)

pub mod keys;
pub mod proof;
pub mod error;

pub use keys::{KeyPair, PublicKey, SecretKey, SharedSecret};
pub use proof::{HandshakeProof, Nonce};
pub use error::{CryptoError, CryptoResult};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::keys::*;
    pub use crate::proof::*;
    pub use crate::error::*;
}

/// Protocol constants
pub mod constants {
    /// X25519 key size in bytes
    pub const X25519_KEY_SIZE: usize = 32;

    /// Size of a derived symmetric key
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// Negotiation nonce size
    pub const NONCE_SIZE: usize = 16;

    /// Handshake proof size (BLAKE3 output)
    pub const PROOF_SIZE: usize = 32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_handshake_flow() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let nonce = Nonce::random();

        // Alice proves she owns her key for this negotiation
        let shared = alice.secret.diffie_hellman(&bob.public);
        let proof = HandshakeProof::create(&shared, &alice.public, &nonce);

        // Bob verifies using his side of the exchange
        let bob_shared = bob.secret.diffie_hellman(&alice.public);
        assert!(proof.verify(&bob_shared, &alice.public, &nonce));
    }
}
