use serde::{Deserialize, Serialize};

/// Event kind carrying encrypted remote-signing requests and responses.
pub const NOSTR_CONNECT_KIND: u16 = 24133;

/// Permissions granted to every session, before any extras from the
/// pairing token.
pub const DEFAULT_PERMISSIONS: [&str; 6] = [
    "sign_event",
    "nip44_encrypt",
    "nip44_decrypt",
    "nip04_encrypt",
    "nip04_decrypt",
    "get_public_key",
];

pub type Unsubscribe = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    ClientInitiated,
    SignerInitiated,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientInitiated => "client-initiated",
            Self::SignerInitiated => "signer-initiated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pairing,
    Active,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionAlgorithm {
    Nip44,
    Nip04,
}

/// Display metadata carried by a pairing token. Unknown keys are dropped
/// during deserialization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One pairing with a remote signer.
///
/// `remote_signer_pubkey` may be empty until the counterparty is learned
/// from its first event; `user_pubkey` is learned via `get_public_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    #[serde(rename = "type")]
    pub session_type: SessionType,
    #[serde(default)]
    pub remote_signer_pubkey: String,
    #[serde(default)]
    pub user_pubkey: Option<String>,
    pub client_public_key: String,
    pub client_private_key: String,
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    pub status: SessionStatus,
    pub algorithm: EncryptionAlgorithm,
    #[serde(default)]
    pub pairing_secret: Option<String>,
    #[serde(default)]
    pub metadata: Option<SessionMetadata>,
    #[serde(default)]
    pub last_seen_at: Option<u64>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub pending_relays: Option<Vec<String>>,
    #[serde(default)]
    pub auth_challenge_url: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Session {
    pub fn session_id(session_type: SessionType, base_id: &str, created_ms: u64) -> String {
        format!("{}:{}:{}", session_type.as_str(), base_id, created_ms)
    }
}

/// The single persisted document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    #[serde(default)]
    pub sessions: Vec<Session>,
    #[serde(default)]
    pub active_session_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Connect,
    SignEvent,
    Ping,
    GetPublicKey,
    Nip04Encrypt,
    Nip04Decrypt,
    Nip44Encrypt,
    Nip44Decrypt,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::SignEvent => "sign_event",
            Self::Ping => "ping",
            Self::GetPublicKey => "get_public_key",
            Self::Nip04Encrypt => "nip04_encrypt",
            Self::Nip04Decrypt => "nip04_decrypt",
            Self::Nip44Encrypt => "nip44_encrypt",
            Self::Nip44Decrypt => "nip44_decrypt",
        }
    }
}

impl std::str::FromStr for Method {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connect" => Ok(Self::Connect),
            "sign_event" => Ok(Self::SignEvent),
            "ping" => Ok(Self::Ping),
            "get_public_key" => Ok(Self::GetPublicKey),
            "nip04_encrypt" => Ok(Self::Nip04Encrypt),
            "nip04_decrypt" => Ok(Self::Nip04Decrypt),
            "nip44_encrypt" => Ok(Self::Nip44Encrypt),
            "nip44_decrypt" => Ok(Self::Nip44Decrypt),
            other => Err(crate::Error::UnexpectedPayload(format!(
                "unknown method: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub id: String,
    pub method: Method,
    #[serde(default)]
    pub params: Vec<String>,
}

/// Decrypted response body. Unknown fields are rejected so that an inbound
/// request never passes as a response; the resulting unexpected-payload
/// error is what routes signer-initiated `connect` to the request decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResponsePayload {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    /// Challenge responses carry the literal result `auth_url` and the
    /// challenge URL in the error slot.
    pub fn auth_challenge_url(&self) -> Option<&str> {
        match (self.result.as_deref(), self.error.as_deref()) {
            (Some("auth_url"), Some(url)) => Some(url),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Sent,
    Resolved,
    Error,
    Expired,
    Challenge,
}

/// Bookkeeping record for one outstanding request.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: String,
    pub method: Method,
    pub session_id: String,
    pub created_at: u64,
    pub last_sent_at: Option<u64>,
    pub state: RequestState,
    pub payload: RequestPayload,
    pub error: Option<String>,
    pub response: Option<ResponsePayload>,
}

/// Default permissions plus any extras, first occurrence wins.
pub fn normalize_permissions(extra: &[String]) -> Vec<String> {
    let mut out: Vec<String> = DEFAULT_PERMISSIONS.iter().map(|p| p.to_string()).collect();
    for perm in extra {
        let perm = perm.trim();
        if !perm.is_empty() && !out.iter().any(|p| p == perm) {
            out.push(perm.to_string());
        }
    }
    out
}
