//! Key material
//!
//! The shared secret is an opaque string: either a plain pre-shared key or
//! printable x25519 key material produced by [`gen_key_pair`]. In the
//! keypair scheme the server is configured with the public key and the
//! client with the private key; [`client_key_seed`] folds the private form
//! onto the public one so both ends derive identical tables and AEAD keys.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

use super::aead::AeadMethod;

const PRIVATE_PREFIX: &str = "sx25519:";
const PUBLIC_PREFIX: &str = "px25519:";

const AEAD_SALT: &[u8] = b"sudokium-aead-v1";

/// Generate a printable (private, public) key pair.
pub fn gen_key_pair() -> (String, String) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    (
        format!("{PRIVATE_PREFIX}{}", BASE64.encode(secret.to_bytes())),
        format!("{PUBLIC_PREFIX}{}", BASE64.encode(public.as_bytes())),
    )
}

/// Resolve the effective shared secret for the client side: a private key
/// string maps to its public form, anything else passes through unchanged.
pub fn client_key_seed(key: &str) -> Result<String> {
    let Some(encoded) = key.strip_prefix(PRIVATE_PREFIX) else {
        return Ok(key.to_string());
    };
    let bytes = BASE64
        .decode(encoded)
        .map_err(|_| Error::Config("malformed private key".into()))?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Config("private key must be 32 bytes".into()))?;
    let secret = StaticSecret::from(bytes);
    let public = PublicKey::from(&secret);
    Ok(format!("{PUBLIC_PREFIX}{}", BASE64.encode(public.as_bytes())))
}

/// Derive the AEAD key for a method from the shared secret.
pub fn derive_aead_key(secret: &str, method: AeadMethod) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha256>::new(Some(AEAD_SALT), secret.as_bytes());
    let mut okm = vec![0u8; method.key_size()];
    hk.expand(method.as_str().as_bytes(), &mut okm)
        .map_err(|_| Error::Crypto("HKDF expand failed".into()))?;
    Ok(okm)
}

/// First 8 bytes of SHA-256 over the secret; the handshake's identity tag.
pub fn handshake_tag(secret: &str) -> [u8; 8] {
    let digest = Sha256::digest(secret.as_bytes());
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&digest[..8]);
    tag
}
