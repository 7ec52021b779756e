use std::collections::BTreeMap;

use crate::transport::{normalize_relay_url, normalize_relays};
use crate::{Error, Result, SessionMetadata, SessionType};

pub const NOSTRCONNECT_SCHEME: &str = "nostrconnect://";
pub const BUNKER_SCHEME: &str = "bunker://";

/// Parsed pairing URI.
///
/// `pubkey` is the scheme's primary key: the client public key for
/// `nostrconnect://`, the remote signer public key for `bunker://`.
#[derive(Debug, Clone)]
pub struct PairingToken {
    pub session_type: SessionType,
    pub pubkey: String,
    pub relays: Vec<String>,
    pub secret: Option<String>,
    pub permissions: Vec<String>,
    pub metadata: Option<SessionMetadata>,
    /// Raw query params as received, before any interpretation.
    pub raw_params: BTreeMap<String, Vec<String>>,
}

fn percent_decode(value: &str) -> String {
    // Tolerate already-decoded values.
    urlencoding::decode(value)
        .map(|v| v.into_owned())
        .unwrap_or_else(|_| value.to_string())
}

fn validate_pubkey(value: &str, label: &str) -> Result<String> {
    let value = value.trim().to_lowercase();
    if value.is_empty() {
        return Err(Error::Uri(format!("missing {label}")));
    }
    if value.len() != 64 || !value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return Err(Error::Uri(format!("invalid {label}: {value}")));
    }
    Ok(value)
}

pub fn parse_pairing_uri(uri: &str) -> Result<PairingToken> {
    let trimmed = uri.trim();
    let (session_type, rest, key_label) =
        if let Some(rest) = trimmed.strip_prefix(NOSTRCONNECT_SCHEME) {
            (SessionType::ClientInitiated, rest, "client pubkey")
        } else if let Some(rest) = trimmed.strip_prefix(BUNKER_SCHEME) {
            (SessionType::SignerInitiated, rest, "remote signer pubkey")
        } else {
            return Err(Error::Uri(format!(
                "unknown pairing scheme: {}",
                trimmed.chars().take(24).collect::<String>()
            )));
        };

    let (key_part, query) = rest.split_once('?').unwrap_or((rest, ""));
    let pubkey = validate_pubkey(&percent_decode(key_part), key_label)?;

    let mut relays = Vec::new();
    let mut secret = None;
    let mut permissions = Vec::new();
    let mut metadata = None;
    let mut raw_params: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = percent_decode(key);
        let value = percent_decode(value);
        raw_params.entry(key.clone()).or_default().push(value.clone());

        match key.as_str() {
            "relay" => relays.push(value),
            "secret" => {
                if !value.is_empty() {
                    secret = Some(value);
                }
            }
            "perms" => {
                permissions = value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            "metadata" => match serde_json::from_str::<SessionMetadata>(&value) {
                Ok(parsed) => metadata = Some(parsed),
                Err(e) => tracing::debug!("ignoring malformed pairing metadata: {e}"),
            },
            _ => {}
        }
    }

    Ok(PairingToken {
        session_type,
        pubkey,
        relays: normalize_relays(&relays),
        secret,
        permissions,
        metadata,
        raw_params,
    })
}

/// Build a client-initiated pairing URI.
///
/// Param order: repeated `relay`, then `secret`, `perms` (comma-joined),
/// `metadata` (JSON).
pub fn build_nostrconnect_uri(
    client_pubkey: &str,
    relays: &[String],
    secret: Option<&str>,
    permissions: &[String],
    metadata: Option<&SessionMetadata>,
) -> String {
    let mut params: Vec<String> = relays
        .iter()
        .filter_map(|r| normalize_relay_url(r))
        .map(|r| format!("relay={}", urlencoding::encode(&r)))
        .collect();

    if let Some(secret) = secret {
        params.push(format!("secret={}", urlencoding::encode(secret)));
    }
    if !permissions.is_empty() {
        params.push(format!(
            "perms={}",
            urlencoding::encode(&permissions.join(","))
        ));
    }
    if let Some(metadata) = metadata {
        if let Ok(json) = serde_json::to_string(metadata) {
            params.push(format!("metadata={}", urlencoding::encode(&json)));
        }
    }

    let mut uri = format!(
        "{}{}",
        NOSTRCONNECT_SCHEME,
        urlencoding::encode(client_pubkey)
    );
    if !params.is_empty() {
        uri.push('?');
        uri.push_str(&params.join("&"));
    }
    uri
}
