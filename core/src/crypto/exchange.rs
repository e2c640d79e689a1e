// Session key hand-off: RSA with PKCS#1 v1.5 padding
//
// New sessions encrypt their "key:iv" pair under the server's public key.
// Resumed sessions generate a throwaway keypair, send the public half, and
// receive their stored "key:iv" pair encrypted under it.

use super::CryptoError;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

/// Default modulus size for the key-sync keypair
pub const DEFAULT_RSA_BITS: usize = 2048;

/// Transient keypair used during key sync. Dropped as soon as the sync
/// response has been decrypted.
pub struct ExchangeKeypair {
    pub public_key_pem: String,
    private_key_pem: Zeroizing<String>,
}

impl ExchangeKeypair {
    pub fn new(public_key_pem: String, private_key_pem: String) -> Self {
        Self {
            public_key_pem,
            private_key_pem: Zeroizing::new(private_key_pem),
        }
    }

    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }
}

impl std::fmt::Debug for ExchangeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeKeypair")
            .field("public_key_pem", &self.public_key_pem)
            .finish_non_exhaustive()
    }
}

/// Asymmetric primitives used by the handshake
#[cfg_attr(test, mockall::automock)]
pub trait KeyExchange: Send + Sync {
    /// Encrypt `plaintext` under a PEM (or bare base64 SPKI) public key,
    /// returning base64 ciphertext
    fn encrypt_for(&self, public_key: &str, plaintext: &[u8]) -> Result<String, CryptoError>;

    fn generate_keypair(&self) -> Result<ExchangeKeypair, CryptoError>;

    /// Decrypt base64 `ciphertext` with the keypair's private half
    fn decrypt_with(&self, keypair: &ExchangeKeypair, ciphertext: &str) -> Result<Vec<u8>, CryptoError>;
}

/// RSA implementation of [`KeyExchange`]
#[derive(Debug, Clone, Copy)]
pub struct RsaKeyExchange {
    bits: usize,
}

impl RsaKeyExchange {
    pub fn new() -> Self {
        Self::with_bits(DEFAULT_RSA_BITS)
    }

    pub fn with_bits(bits: usize) -> Self {
        Self { bits }
    }
}

impl Default for RsaKeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Accept SPKI PEM, PKCS#1 PEM, or the bare base64 body the server sends
fn parse_public_key(public_key: &str) -> Result<RsaPublicKey, CryptoError> {
    let trimmed = public_key.trim();
    if trimmed.contains("BEGIN RSA PUBLIC KEY") {
        return RsaPublicKey::from_pkcs1_pem(trimmed)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()));
    }

    let pem = if trimmed.starts_with("-----BEGIN") {
        trimmed.to_string()
    } else {
        format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            trimmed
        )
    };
    RsaPublicKey::from_public_key_pem(&pem).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

impl KeyExchange for RsaKeyExchange {
    fn encrypt_for(&self, public_key: &str, plaintext: &[u8]) -> Result<String, CryptoError> {
        let public_key = parse_public_key(public_key)?;
        let ciphertext = public_key
            .encrypt(&mut rand::rngs::OsRng, Pkcs1v15Encrypt, plaintext)
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
        Ok(BASE64.encode(ciphertext))
    }

    fn generate_keypair(&self) -> Result<ExchangeKeypair, CryptoError> {
        let private_key = RsaPrivateKey::new(&mut rand::rngs::OsRng, self.bits)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let public_key_pem = RsaPublicKey::from(&private_key)
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let private_key_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

        Ok(ExchangeKeypair {
            public_key_pem,
            private_key_pem,
        })
    }

    fn decrypt_with(&self, keypair: &ExchangeKeypair, ciphertext: &str) -> Result<Vec<u8>, CryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(keypair.private_key_pem())
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let ciphertext = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| CryptoError::InvalidEncoding(format!("ciphertext: {}", e)))?;

        private_key
            .decrypt(Pkcs1v15Encrypt, &ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}
