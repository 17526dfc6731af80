//! Single-use challenge nonces

use rand::RngCore;

/// Generate a fresh 32-byte nonce, lowercase hex encoded.
pub fn generate() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}
