//! AEAD (Authenticated Encryption with Associated Data) implementation
//!
//! Supports the methods the handshake negotiates:
//! - ChaCha20-Poly1305
//! - AES-128-GCM
//! - none (pass-through at the framing layer; no cipher is built)

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit},
    Aes128Gcm, Nonce,
};
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::{Error, Result};

use super::{NONCE_SIZE, TAG_SIZE};

/// AEAD method selection, parsed from configuration strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AeadMethod {
    Aes128Gcm,
    #[default]
    ChaCha20Poly1305,
    None,
}

impl AeadMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "aes-128-gcm" | "aes128gcm" => Some(AeadMethod::Aes128Gcm),
            "chacha20-poly1305" | "chacha20poly1305" => Some(AeadMethod::ChaCha20Poly1305),
            "none" => Some(AeadMethod::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AeadMethod::Aes128Gcm => "aes-128-gcm",
            AeadMethod::ChaCha20Poly1305 => "chacha20-poly1305",
            AeadMethod::None => "none",
        }
    }

    /// Key size in bytes. Zero for pass-through.
    pub fn key_size(&self) -> usize {
        match self {
            AeadMethod::Aes128Gcm => 16,
            AeadMethod::ChaCha20Poly1305 => 32,
            AeadMethod::None => 0,
        }
    }

    pub fn nonce_size(&self) -> usize {
        match self {
            AeadMethod::None => 0,
            _ => NONCE_SIZE,
        }
    }

    pub fn tag_size(&self) -> usize {
        match self {
            AeadMethod::None => 0,
            _ => TAG_SIZE,
        }
    }
}

enum CipherInner {
    Aes128Gcm(Aes128Gcm),
    ChaCha20Poly1305(ChaCha20Poly1305),
}

/// A sealed/opening cipher for one of the real AEAD methods.
pub struct AeadCipher {
    method: AeadMethod,
    inner: CipherInner,
}

impl AeadCipher {
    /// Build a cipher. `AeadMethod::None` has no cipher and is rejected;
    /// the framing layer bypasses sealing for it instead.
    pub fn new(method: AeadMethod, key: &[u8]) -> Result<Self> {
        if key.len() != method.key_size() {
            return Err(Error::Crypto(format!(
                "invalid key size for {}: expected {}, got {}",
                method.as_str(),
                method.key_size(),
                key.len()
            )));
        }

        let inner = match method {
            AeadMethod::Aes128Gcm => {
                let cipher = Aes128Gcm::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;
                CipherInner::Aes128Gcm(cipher)
            }
            AeadMethod::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|e| Error::Crypto(format!("failed to create cipher: {e}")))?;
                CipherInner::ChaCha20Poly1305(cipher)
            }
            AeadMethod::None => {
                return Err(Error::Crypto("method none has no cipher".into()));
            }
        };

        Ok(Self { method, inner })
    }

    pub fn method(&self) -> AeadMethod {
        self.method
    }

    /// Seal plaintext; output is ciphertext followed by the tag.
    pub fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "invalid nonce size: expected {NONCE_SIZE}, got {}",
                nonce.len()
            )));
        }
        let nonce = Nonce::from_slice(nonce);
        let result = match &self.inner {
            CipherInner::Aes128Gcm(cipher) => cipher.encrypt(nonce, plaintext),
            CipherInner::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, plaintext),
        };
        result.map_err(|_| Error::Crypto("encryption failed".into()))
    }

    /// Open ciphertext+tag. Any mismatch is an authentication failure.
    pub fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Crypto(format!(
                "invalid nonce size: expected {NONCE_SIZE}, got {}",
                nonce.len()
            )));
        }
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Crypto("ciphertext too short".into()));
        }
        let nonce = Nonce::from_slice(nonce);
        let result = match &self.inner {
            CipherInner::Aes128Gcm(cipher) => cipher.decrypt(nonce, ciphertext),
            CipherInner::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, ciphertext),
        };
        result.map_err(|_| Error::Crypto("decryption failed".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    #[test]
    fn test_method_parse() {
        assert_eq!(AeadMethod::parse("aes-128-gcm"), Some(AeadMethod::Aes128Gcm));
        assert_eq!(
            AeadMethod::parse("ChaCha20-Poly1305"),
            Some(AeadMethod::ChaCha20Poly1305)
        );
        assert_eq!(AeadMethod::parse("none"), Some(AeadMethod::None));
        assert_eq!(AeadMethod::parse("zero"), None);
    }

    #[test]
    fn test_seal_open_roundtrip() {
        for method in [AeadMethod::Aes128Gcm, AeadMethod::ChaCha20Poly1305] {
            let key = random_bytes(method.key_size());
            let cipher = AeadCipher::new(method, &key).unwrap();

            let nonce = random_bytes(NONCE_SIZE);
            let plaintext = b"Hello, World!";
            let sealed = cipher.seal(&nonce, plaintext).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + TAG_SIZE);

            let opened = cipher.open(&nonce, &sealed).unwrap();
            assert_eq!(opened.as_slice(), plaintext);
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let cipher1 =
            AeadCipher::new(AeadMethod::ChaCha20Poly1305, &random_bytes(32)).unwrap();
        let cipher2 =
            AeadCipher::new(AeadMethod::ChaCha20Poly1305, &random_bytes(32)).unwrap();

        let nonce = [0u8; NONCE_SIZE];
        let sealed = cipher1.seal(&nonce, b"payload").unwrap();
        assert!(cipher2.open(&nonce, &sealed).is_err());
    }

    #[test]
    fn test_single_bit_tamper_always_fails() {
        let key = random_bytes(16);
        let cipher = AeadCipher::new(AeadMethod::Aes128Gcm, &key).unwrap();
        let nonce = random_bytes(NONCE_SIZE);
        let sealed = cipher.seal(&nonce, b"tamper target").unwrap();

        for byte_idx in 0..sealed.len() {
            for bit in 0..8 {
                let mut mutated = sealed.clone();
                mutated[byte_idx] ^= 1 << bit;
                assert!(
                    cipher.open(&nonce, &mutated).is_err(),
                    "flip at byte {byte_idx} bit {bit} must not open"
                );
            }
        }
    }

    #[test]
    fn test_none_has_no_cipher() {
        assert!(AeadCipher::new(AeadMethod::None, &[]).is_err());
    }
}
