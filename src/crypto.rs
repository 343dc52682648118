//! Frame and payload encryption.
//! AES-128-ECB with PKCS7 padding, AES-128-GCM with detached IV, and HMAC-SHA256.

use crate::error::{Result, SessionError};
use aes::Aes128;
use aes_gcm::{
    Aes128Gcm, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use cipher::block_padding::{NoPadding, Pkcs7};
use cipher::{BlockDecryptMut, BlockEncryptMut};
use ecb::{Decryptor, Encryptor};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const KEY_LEN: usize = 16;
pub const GCM_IV_LEN: usize = 12;
pub const GCM_TAG_LEN: usize = 16;
pub const HMAC_LEN: usize = 32;

/// SessionCipher provides AES-128 encryption and decryption in ECB and GCM modes.
pub struct SessionCipher {
    key: [u8; KEY_LEN],
    gcm: Aes128Gcm,
}

impl SessionCipher {
    /// Create a new cipher from a 16-byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let k: [u8; KEY_LEN] = key.try_into().map_err(|_| SessionError::EncryptionFailed)?;
        let gcm = Aes128Gcm::new(&k.into());
        Ok(Self { key: k, gcm })
    }

    /// ECB encryption. `padding` applies PKCS7; otherwise the input must be block aligned.
    pub fn encrypt_ecb(&self, data: &[u8], padding: bool) -> Result<Vec<u8>> {
        let encryptor = Encryptor::<Aes128>::new(&self.key.into());
        if padding {
            Ok(encryptor.encrypt_padded_vec_mut::<Pkcs7>(data))
        } else {
            if !data.len().is_multiple_of(16) {
                return Err(SessionError::EncryptionFailed);
            }
            Ok(encryptor.encrypt_padded_vec_mut::<NoPadding>(data))
        }
    }

    /// ECB decryption with PKCS7 unpadding.
    pub fn decrypt_ecb(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() || !data.len().is_multiple_of(16) {
            return Err(SessionError::DecryptionFailed);
        }
        Decryptor::<Aes128>::new(&self.key.into())
            .decrypt_padded_vec_mut::<Pkcs7>(data)
            .map_err(|_| SessionError::DecryptionFailed)
    }

    /// GCM encryption. Returns `IV + ciphertext + tag`.
    pub fn encrypt_gcm(&self, data: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if iv.len() < GCM_IV_LEN {
            return Err(SessionError::EncryptionFailed);
        }
        let nonce = Nonce::from_slice(&iv[..GCM_IV_LEN]);
        let mut ciphertext = self
            .gcm
            .encrypt(nonce, Payload { msg: data, aad })
            .map_err(|_| SessionError::EncryptionFailed)?;

        let mut result = Vec::with_capacity(GCM_IV_LEN + ciphertext.len());
        result.extend_from_slice(&iv[..GCM_IV_LEN]);
        result.append(&mut ciphertext);
        Ok(result)
    }

    /// GCM decryption of `ciphertext + tag`. A tag mismatch is an integrity failure.
    pub fn decrypt_gcm(&self, data: &[u8], iv: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if iv.len() < GCM_IV_LEN || data.len() < GCM_TAG_LEN {
            return Err(SessionError::DecryptionFailed);
        }
        let nonce = Nonce::from_slice(&iv[..GCM_IV_LEN]);
        self.gcm
            .decrypt(nonce, Payload { msg: data, aad })
            .map_err(|_| SessionError::ChecksumInvalid)
    }
}

/// HMAC-SHA256 over `data` keyed with `key`.
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; HMAC_LEN]> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).map_err(|_| SessionError::EncryptionFailed)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

/// Constant-time HMAC-SHA256 verification.
pub fn verify_hmac_sha256(key: &[u8], data: &[u8], expected: &[u8]) -> bool {
    match <HmacSha256 as Mac>::new_from_slice(key) {
        Ok(mut mac) => {
            mac.update(data);
            mac.verify_slice(expected).is_ok()
        }
        Err(_) => false,
    }
}

/// Fills a fresh random nonce.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut buf);
    buf
}
