use nostr::{Keys, SecretKey};

use crate::{Error, Result};

/// Generate a fresh client keypair.
pub fn generate_keypair() -> Keys {
    Keys::generate()
}

/// Import a 32-byte secret key from hex.
///
/// Accepts surrounding whitespace and a leading `0x`; anything other than
/// 64 lowercase hex chars after that is rejected.
pub fn keys_from_hex(input: &str) -> Result<Keys> {
    let trimmed = input.trim();
    let hex_str = trimmed.strip_prefix("0x").unwrap_or(trimmed);

    if hex_str.len() != 64 || !hex_str.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(Error::Key(
            "secret key must be 64 lowercase hex chars".to_string(),
        ));
    }

    let bytes = hex::decode(hex_str).map_err(|e| Error::Key(e.to_string()))?;
    let secret = SecretKey::from_slice(&bytes)?;
    Ok(Keys::new(secret))
}

pub fn secret_key_hex(keys: &Keys) -> String {
    hex::encode(keys.secret_key().to_secret_bytes())
}

pub fn public_key_hex(keys: &Keys) -> String {
    hex::encode(keys.public_key().to_bytes())
}
