//! Credential generation for workspace services.
//!
//! Both generators draw from `rand`'s thread-local generator, which is a
//! ChaCha-based CSPRNG reseeded from the operating system.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::prelude::*;

const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ\
                        abcdefghijklmnopqrstuvwxyz\
                        0123456789";

/// Bytes of entropy in an access token.
const TOKEN_BYTES: usize = 32;

/// Generate a random alphanumeric password.
pub fn generate(length: usize) -> String {
    let mut rng = rand::rng();
    (0..length)
        .map(|_| {
            let idx = rng.random_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

/// Generate a URL-safe access token (256 bits, unpadded base64).
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
