// Symmetric payload encryption: AES-CBC with PKCS#7 padding
//
// Keys and IVs travel as base64 strings; ciphertext is base64 of the raw
// CBC output. The AES variant follows the decoded key length.

use super::CryptoError;
use crate::keystore::KeyMaterial;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use zeroize::Zeroize;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Symmetric cipher keyed by explicit key + IV
#[cfg_attr(test, mockall::automock)]
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext`, returning base64 ciphertext
    fn encrypt(&self, plaintext: &[u8], material: &KeyMaterial) -> Result<String, CryptoError>;

    /// Decrypt base64 `ciphertext`
    fn decrypt(&self, ciphertext: &str, material: &KeyMaterial) -> Result<Vec<u8>, CryptoError>;

    /// Fresh random key material for a new session
    fn generate_key(&self) -> KeyMaterial;
}

/// AES-CBC implementation of [`Cipher`]
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCbcCipher;

impl AesCbcCipher {
    pub fn new() -> Self {
        Self
    }
}

/// Decode key and IV, validating the IV length
fn decode_material(material: &KeyMaterial) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let key = BASE64
        .decode(material.key.trim())
        .map_err(|e| CryptoError::InvalidEncoding(format!("key: {}", e)))?;
    let iv = BASE64
        .decode(material.iv.trim())
        .map_err(|e| CryptoError::InvalidEncoding(format!("iv: {}", e)))?;
    if iv.len() != 16 {
        return Err(CryptoError::InvalidKeyLength(iv.len()));
    }
    Ok((key, iv))
}

impl Cipher for AesCbcCipher {
    fn encrypt(&self, plaintext: &[u8], material: &KeyMaterial) -> Result<String, CryptoError> {
        let (mut key, iv) = decode_material(material)?;
        let invalid = |_| CryptoError::InvalidKeyLength(key.len());

        let ciphertext = match key.len() {
            16 => Aes128CbcEnc::new_from_slices(&key, &iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            24 => Aes192CbcEnc::new_from_slices(&key, &iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            32 => Aes256CbcEnc::new_from_slices(&key, &iv)
                .map_err(invalid)?
                .encrypt_padded_vec_mut::<Pkcs7>(plaintext),
            other => return Err(CryptoError::InvalidKeyLength(other)),
        };
        key.zeroize();

        Ok(BASE64.encode(ciphertext))
    }

    fn decrypt(&self, ciphertext: &str, material: &KeyMaterial) -> Result<Vec<u8>, CryptoError> {
        let (mut key, iv) = decode_material(material)?;
        let ciphertext = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| CryptoError::InvalidEncoding(format!("ciphertext: {}", e)))?;
        let invalid = |_| CryptoError::InvalidKeyLength(key.len());

        let plaintext = match key.len() {
            16 => Aes128CbcDec::new_from_slices(&key, &iv)
                .map_err(invalid)?
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
            24 => Aes192CbcDec::new_from_slices(&key, &iv)
                .map_err(invalid)?
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
            32 => Aes256CbcDec::new_from_slices(&key, &iv)
                .map_err(invalid)?
                .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext),
            other => return Err(CryptoError::InvalidKeyLength(other)),
        };
        key.zeroize();

        plaintext.map_err(|_| CryptoError::DecryptionFailed)
    }

    fn generate_key(&self) -> KeyMaterial {
        let mut key = [0u8; 32];
        let mut iv = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut key);
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let material = KeyMaterial::new(BASE64.encode(key), BASE64.encode(iv));
        key.zeroize();
        material
    }
}
