use nostr::nips::nip04;
use nostr::nips::nip44::{self, Version};
use nostr::{PublicKey, SecretKey};

use crate::{EncryptionAlgorithm, Error, Result};

/// Everything needed to encrypt or decrypt one payload for one session.
#[derive(Debug, Clone)]
pub struct EncryptionContext {
    pub local_secret_hex: String,
    pub remote_pubkey_hex: String,
    pub algorithm: EncryptionAlgorithm,
}

impl EncryptionContext {
    pub fn new(
        local_secret_hex: impl Into<String>,
        remote_pubkey_hex: impl Into<String>,
        algorithm: EncryptionAlgorithm,
    ) -> Self {
        Self {
            local_secret_hex: local_secret_hex.into(),
            remote_pubkey_hex: remote_pubkey_hex.into(),
            algorithm,
        }
    }
}

/// Normalize a remote public key to its 64-char x-only hex form.
///
/// Trims, lowercases, strips `0x`, and collapses a 66-char compressed
/// point with an `02`/`03` prefix. Anything else is rejected.
pub fn normalize_remote_pubkey(input: &str) -> Result<String> {
    let mut value = input.trim().to_lowercase();
    if let Some(stripped) = value.strip_prefix("0x") {
        value = stripped.to_string();
    }
    if value.len() == 66 && (value.starts_with("02") || value.starts_with("03")) {
        value = value[2..].to_string();
    }
    if value.len() != 64 || !value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(Error::Encode(format!(
            "invalid remote public key: {}",
            input.trim()
        )));
    }
    Ok(value)
}

fn context_keys(ctx: &EncryptionContext) -> Result<(SecretKey, PublicKey)> {
    let secret_bytes =
        hex::decode(ctx.local_secret_hex.trim()).map_err(|e| Error::Encode(e.to_string()))?;
    let secret = SecretKey::from_slice(&secret_bytes).map_err(|e| Error::Encode(e.to_string()))?;

    let remote = normalize_remote_pubkey(&ctx.remote_pubkey_hex)?;
    let remote_bytes = hex::decode(&remote).map_err(|e| Error::Encode(e.to_string()))?;
    let public = PublicKey::from_slice(&remote_bytes).map_err(|e| Error::Encode(e.to_string()))?;

    Ok((secret, public))
}

pub fn encrypt(plaintext: &str, ctx: &EncryptionContext) -> Result<String> {
    let (secret, public) = context_keys(ctx)?;
    match ctx.algorithm {
        EncryptionAlgorithm::Nip44 => nip44::encrypt(&secret, &public, plaintext, Version::V2)
            .map_err(|e| Error::Encode(e.to_string())),
        EncryptionAlgorithm::Nip04 => {
            nip04::encrypt(&secret, &public, plaintext).map_err(|e| Error::Encode(e.to_string()))
        }
    }
}

pub fn decrypt(ciphertext: &str, ctx: &EncryptionContext) -> Result<String> {
    let (secret, public) = context_keys(ctx)?;
    match ctx.algorithm {
        EncryptionAlgorithm::Nip44 => {
            nip44::decrypt(&secret, &public, ciphertext).map_err(|e| Error::Decode(e.to_string()))
        }
        EncryptionAlgorithm::Nip04 => {
            nip04::decrypt(&secret, &public, ciphertext).map_err(|e| Error::Decode(e.to_string()))
        }
    }
}

/// The codec seam the boundary can swap or compose.
pub trait PayloadCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str, ctx: &EncryptionContext) -> Result<String>;
    fn decrypt(&self, ciphertext: &str, ctx: &EncryptionContext) -> Result<String>;
}

pub struct Nip44Cipher;

impl PayloadCipher for Nip44Cipher {
    fn encrypt(&self, plaintext: &str, ctx: &EncryptionContext) -> Result<String> {
        let ctx = EncryptionContext {
            algorithm: EncryptionAlgorithm::Nip44,
            ..ctx.clone()
        };
        encrypt(plaintext, &ctx)
    }

    fn decrypt(&self, ciphertext: &str, ctx: &EncryptionContext) -> Result<String> {
        let ctx = EncryptionContext {
            algorithm: EncryptionAlgorithm::Nip44,
            ..ctx.clone()
        };
        decrypt(ciphertext, &ctx)
    }
}

pub struct Nip04Cipher;

impl PayloadCipher for Nip04Cipher {
    fn encrypt(&self, plaintext: &str, ctx: &EncryptionContext) -> Result<String> {
        let ctx = EncryptionContext {
            algorithm: EncryptionAlgorithm::Nip04,
            ..ctx.clone()
        };
        encrypt(plaintext, &ctx)
    }

    fn decrypt(&self, ciphertext: &str, ctx: &EncryptionContext) -> Result<String> {
        let ctx = EncryptionContext {
            algorithm: EncryptionAlgorithm::Nip04,
            ..ctx.clone()
        };
        decrypt(ciphertext, &ctx)
    }
}

/// Tries `primary` first and consults `fallback` only on non-codec
/// failures; codec errors propagate immediately so a malformed payload is
/// never retried under a different algorithm.
pub struct FallbackCipher {
    primary: Box<dyn PayloadCipher>,
    fallback: Box<dyn PayloadCipher>,
}

impl FallbackCipher {
    pub fn new(primary: Box<dyn PayloadCipher>, fallback: Box<dyn PayloadCipher>) -> Self {
        Self { primary, fallback }
    }
}

impl PayloadCipher for FallbackCipher {
    fn encrypt(&self, plaintext: &str, ctx: &EncryptionContext) -> Result<String> {
        match self.primary.encrypt(plaintext, ctx) {
            Ok(out) => Ok(out),
            Err(err) if err.is_codec_error() => Err(err),
            Err(_) => self.fallback.encrypt(plaintext, ctx),
        }
    }

    fn decrypt(&self, ciphertext: &str, ctx: &EncryptionContext) -> Result<String> {
        match self.primary.decrypt(ciphertext, ctx) {
            Ok(out) => Ok(out),
            Err(err) if err.is_codec_error() => Err(err),
            Err(_) => self.fallback.decrypt(ciphertext, ctx),
        }
    }
}
