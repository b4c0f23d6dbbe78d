//! AES-256-CBC for device config payloads.
//!
//! The config service encrypts the device document with a key derived from
//! the serial number (`SHA-256(sn + suffix)`) and sends the IV in the clear.
//! Ciphertext travels as standard base64; padding is PKCS#7.

use crate::error::CryptoError;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const BLOCK_SIZE: usize = 16;
pub const KEY_SIZE: usize = 32;

/// `SHA-256(device_id + suffix)`.
pub fn derive_key(device_id: &str, suffix: &str) -> [u8; KEY_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(device_id.as_bytes());
    hasher.update(suffix.as_bytes());
    hasher.finalize().into()
}

/// Append PKCS#7 padding. A full block is added when `data` is already aligned.
pub fn pad(data: &[u8]) -> Vec<u8> {
    let n = BLOCK_SIZE - data.len() % BLOCK_SIZE;
    let mut out = Vec::with_capacity(data.len() + n);
    out.extend_from_slice(data);
    out.resize(data.len() + n, n as u8);
    out
}

/// Strip PKCS#7 padding.
pub fn unpad(data: &[u8]) -> Result<&[u8], CryptoError> {
    let n = *data.last().ok_or(CryptoError::InvalidPadding)? as usize;
    if n == 0 || n > BLOCK_SIZE || n > data.len() {
        return Err(CryptoError::InvalidPadding);
    }
    let (body, padding) = data.split_at(data.len() - n);
    if padding.iter().any(|&b| b as usize != n) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(body)
}

pub fn encrypt_bytes(plaintext: &[u8], key: &[u8; KEY_SIZE], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidIv(iv.len()))?;
    Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(&pad(plaintext)))
}

pub fn decrypt_bytes(ciphertext: &[u8], key: &[u8; KEY_SIZE], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidLength(ciphertext.len()));
    }
    let cipher = Aes256CbcDec::new_from_slices(key, iv).map_err(|_| CryptoError::InvalidIv(iv.len()))?;
    let mut plain = cipher
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|_| CryptoError::InvalidLength(ciphertext.len()))?;
    let len = unpad(&plain)?.len();
    plain.truncate(len);
    Ok(plain)
}

/// Encrypt and base64-encode.
pub fn encrypt(plaintext: &str, key: &[u8; KEY_SIZE], iv: &str) -> Result<String, CryptoError> {
    let ct = encrypt_bytes(plaintext.as_bytes(), key, iv.as_bytes())?;
    Ok(STANDARD.encode(ct))
}

/// Base64-decode and decrypt. `iv` is used as raw bytes and must be 16 long.
pub fn decrypt(ciphertext_b64: &str, key: &[u8; KEY_SIZE], iv: &str) -> Result<String, CryptoError> {
    let ct = STANDARD
        .decode(ciphertext_b64.trim())
        .map_err(|e| CryptoError::Base64(e.to_string()))?;
    let plain = decrypt_bytes(&ct, key, iv.as_bytes())?;
    String::from_utf8(plain).map_err(|_| CryptoError::Utf8)
}
