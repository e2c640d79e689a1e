// Cryptography module: payload encryption, session key hand-off, compression
//
// The protocol logic only sees the `Cipher`, `KeyExchange` and `Compressor`
// traits so it can be exercised with fakes.

pub mod cipher;
pub mod compress;
pub mod exchange;

pub use cipher::{AesCbcCipher, Cipher};
pub use compress::{Compressor, GzipCompressor};
pub use exchange::{ExchangeKeypair, KeyExchange, RsaKeyExchange};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Decrypted payload is empty")]
    EmptyPlaintext,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Compression failed: {0}")]
    Compression(String),
}
