// Crypto boundary — decryption is an opaque external operation
//
// The pipeline never touches key material or primitives directly. A host
// supplies an implementation backed by its session/group/community keys.

#[cfg(test)]
use mockall::automock;

use crate::error::ReceiveError;

/// Key material context for one envelope's destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyContext {
    /// Sealed to the user's own account keys
    OneToOne,
    /// Encrypted with a closed group's shared key
    ClosedGroup { group_public_key: String },
    /// Posted to a community server under a blinded identity
    Community { server_public_key: String },
}

/// Successful decryption: authenticated sender plus inner plaintext
#[derive(Debug, Clone)]
pub struct Plaintext {
    /// Sender identity recovered and authenticated during decryption.
    /// In community contexts this is a blinded id.
    pub sender: String,
    pub content: Vec<u8>,
}

/// Opaque decryption provider. Assumed side-effect-free.
#[cfg_attr(test, automock)]
pub trait Crypto: Send + Sync {
    /// Decrypt and authenticate an envelope payload. Failure is permanent:
    /// an undecryptable message will not become readable on retry.
    fn decrypt(&self, ciphertext: &[u8], context: &KeyContext) -> Result<Plaintext, ReceiveError>;

    /// Whether `candidate_id` is the blinded form of `real_id` on the server
    /// identified by `server_public_key`. Used for self-send detection in
    /// community threads.
    fn blinded_equivalent(&self, real_id: &str, candidate_id: &str, server_public_key: &str)
        -> bool;
}
