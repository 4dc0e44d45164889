//! Cryptographic building blocks for device sync.
//!
//! This module provides:
//! - Asymmetric signing and encryption keypairs behind a scheme registry
//! - AES-256-CMAC key-possession proofs
//! - AES-256-GCM payload encryption
//! - The crypto controller owning all key material for one device
//! - Pluggable private key storage

pub mod controller;
pub mod keystore;
pub mod primitives;

pub use controller::CryptoController;
pub use keystore::{FileKeyStore, KeyStore, KeyStoreProvider, KeyStoreRegistry, MemoryKeyStore};
pub use primitives::{
    EncryptionKeyPair, EncryptionScheme, KeyParams, SecretKey, SeededRng, SignatureScheme,
    SigningKeyPair,
};

use thiserror::Error;

/// Errors that can occur in cryptographic operations.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Unsupported scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Key store has no entry for {0}")]
    KeyStoreMissing(String),

    #[error("Key store unavailable: {0}")]
    KeyStoreUnavailable(String),

    #[error("Key validation failed: {0}")]
    KeyValidationFailed(String),

    #[error("Unknown key index {0}")]
    UnknownKeyIndex(u32),

    #[error("Key index mismatch: expected {expected}, got {got}")]
    KeyIndexMismatch { expected: u32, got: u32 },

    #[error("Mac verification failed")]
    MacVerificationFailed,

    #[error("Decryption failed - data may have been tampered with")]
    DecryptionFailed,

    #[error("No device key material loaded")]
    NoKeyMaterial,

    #[error("{context}: {reason}")]
    Operation { context: &'static str, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CryptoError {
    /// Wrap a primitive failure with the operation it occurred in.
    pub fn operation(context: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Operation {
            context,
            reason: err.to_string(),
        }
    }
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
