//! Identity capability
//!
//! Signing and self-encryption are performed by an opaque capability that
//! holds the user's private key (a browser extension, a remote signer, a
//! local key). The core only consumes this interface.

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{SignedEvent, UnsignedEvent};

/// Errors reported by an identity capability
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// No signer is attached to the session
    #[error("Identity capability unavailable")]
    Unavailable,

    /// The user or signer refused the operation
    #[error("Identity operation rejected: {0}")]
    Rejected(String),

    /// Ciphertext could not be decrypted
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// Plaintext could not be encrypted
    #[error("Encryption failed: {0}")]
    Encrypt(String),

    /// Signing failed
    #[error("Signing failed: {0}")]
    Sign(String),
}

impl IdentityError {
    /// Whether the capability itself is missing, as opposed to a bad input
    pub fn is_unavailable(&self) -> bool {
        matches!(self, IdentityError::Unavailable | IdentityError::Rejected(_))
    }
}

/// Signing and self-encryption capability bound to one identity key
#[async_trait]
pub trait Identity: Send + Sync {
    /// Hex public key of this identity
    fn public_key(&self) -> String;

    /// Sign an event authored by this identity
    async fn sign(&self, event: UnsignedEvent) -> Result<SignedEvent, IdentityError>;

    /// Encrypt plaintext so only holders of this identity can read it
    async fn encrypt_to_self(&self, plaintext: &str) -> Result<String, IdentityError>;

    /// Decrypt ciphertext produced by [`Identity::encrypt_to_self`]
    async fn decrypt_from_self(&self, ciphertext: &str) -> Result<String, IdentityError>;
}
