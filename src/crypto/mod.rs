//! Cryptography for the Sudoku transport
//!
//! - AEAD sealing (ChaCha20-Poly1305, AES-128-GCM)
//! - length-prefixed AEAD frame layer over the obfuscated stream
//! - key material handling (pre-shared strings and x25519 pairs)

pub mod aead;
pub mod frame;
mod keys;

pub use aead::{AeadCipher, AeadMethod};
pub use frame::{open_frame, seal_frame, FrameParse, FramedStream, MAX_FRAME_PAYLOAD};
pub use keys::{client_key_seed, derive_aead_key, gen_key_pair, handshake_tag};

/// Nonce size for AEAD ciphers (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Tag size for AEAD ciphers (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Generate cryptographically secure random bytes
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::RngCore;
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random nonce
pub fn random_nonce() -> [u8; NONCE_SIZE] {
    use rand::RngCore;
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let bytes1 = random_bytes(32);
        let bytes2 = random_bytes(32);
        assert_eq!(bytes1.len(), 32);
        assert_ne!(bytes1, bytes2);
    }
}
