use std::sync::{Arc, Mutex};

use rand::RngCore;

use crate::keys::{generate_keypair, public_key_hex, secret_key_hex};
use crate::pairing::{build_nostrconnect_uri, parse_pairing_uri};
use crate::payload::build_request;
use crate::request_queue::{RequestQueue, RequestQueueConfig};
use crate::session_manager::SessionManager;
use crate::storage::SnapshotStorage;
use crate::transport::{normalize_relays, RelayTransport};
use crate::util::now_millis;
use crate::{
    normalize_permissions, EncryptionAlgorithm, Error, Method, ResponsePayload, Result, Session,
    SessionMetadata, SessionStatus, SessionType,
};

#[derive(Debug, Clone, Default)]
pub struct PairOptions {
    pub algorithm: Option<EncryptionAlgorithm>,
}

#[derive(Debug, Clone, Default)]
pub struct InvitationOptions {
    pub relays: Vec<String>,
    pub secret: Option<String>,
    /// Extra permissions on top of the default set.
    pub permissions: Vec<String>,
    pub metadata: Option<SessionMetadata>,
    pub algorithm: Option<EncryptionAlgorithm>,
}

#[derive(Debug, Clone)]
pub struct Invitation {
    pub session: Session,
    pub uri: String,
}

/// Facade the host application talks to.
///
/// Owns the session manager and lazily spins up one request queue per
/// lifetime; `destroy` tears the queue down and a later call recreates it.
pub struct NostrConnect {
    sessions: Arc<SessionManager>,
    transport: Arc<dyn RelayTransport>,
    config: RequestQueueConfig,
    queue: Mutex<Option<Arc<RequestQueue>>>,
}

impl NostrConnect {
    pub fn new(storage: Arc<dyn SnapshotStorage>, transport: Arc<dyn RelayTransport>) -> Self {
        Self::with_config(storage, transport, RequestQueueConfig::default())
    }

    pub fn with_config(
        storage: Arc<dyn SnapshotStorage>,
        transport: Arc<dyn RelayTransport>,
        config: RequestQueueConfig,
    ) -> Self {
        Self {
            sessions: Arc::new(SessionManager::new(storage)),
            transport,
            config,
            queue: Mutex::new(None),
        }
    }

    pub fn session_manager(&self) -> Arc<SessionManager> {
        self.sessions.clone()
    }

    pub async fn init(&self) -> Result<()> {
        self.sessions.hydrate()?;
        self.ensure_queue();
        Ok(())
    }

    pub async fn destroy(&self) {
        let queue = self.queue.lock().unwrap().take();
        if let Some(queue) = queue {
            queue.shutdown().await;
        }
    }

    /// Pair from a `bunker://` or `nostrconnect://` token.
    ///
    /// A `connect` is only issued when the token names the remote signer
    /// (the `bunker://` scheme); a client-initiated token produces a
    /// passive pairing session that waits for the signer to reach out.
    pub async fn pair_with_uri(&self, uri: &str, options: PairOptions) -> Result<Session> {
        let token = parse_pairing_uri(uri)?;
        let keys = generate_keypair();
        let created = now_millis();
        let client_public_key = public_key_hex(&keys);

        let (remote_signer_pubkey, user_pubkey, base_id) = match token.session_type {
            SessionType::SignerInitiated => (
                token.pubkey.clone(),
                Some(token.pubkey.clone()),
                token.pubkey.clone(),
            ),
            SessionType::ClientInitiated => (String::new(), None, client_public_key.clone()),
        };

        let session = self.sessions.upsert_session(Session {
            id: Session::session_id(token.session_type, &base_id, created),
            session_type: token.session_type,
            remote_signer_pubkey: remote_signer_pubkey.clone(),
            user_pubkey,
            client_public_key,
            client_private_key: secret_key_hex(&keys),
            relays: token.relays.clone(),
            permissions: normalize_permissions(&token.permissions),
            status: SessionStatus::Pairing,
            algorithm: options.algorithm.unwrap_or(EncryptionAlgorithm::Nip44),
            pairing_secret: token.secret.clone(),
            metadata: token.metadata.clone(),
            last_seen_at: None,
            last_error: None,
            pending_relays: None,
            auth_challenge_url: None,
            created_at: created,
            updated_at: created,
        })?;

        let queue = self.ensure_queue();

        if !remote_signer_pubkey.is_empty() {
            let params = connect_params(
                &remote_signer_pubkey,
                token.secret.as_deref(),
                &token.permissions,
            );
            queue
                .send(&session.id, build_request(None, Method::Connect, params))
                .await?;

            let current = self
                .sessions
                .get_session(&session.id)
                .ok_or_else(|| Error::SessionNotFound(session.id.clone()))?;
            if current.user_pubkey.is_none()
                && current.permissions.iter().any(|p| p == "get_public_key")
            {
                if let Err(e) = queue.request_user_pubkey(&session.id).await {
                    tracing::warn!("could not fetch user pubkey for {}: {e}", session.id);
                }
            }
        }

        self.sessions
            .get_session(&session.id)
            .ok_or_else(|| Error::SessionNotFound(session.id))
    }

    /// Build a client-initiated token and the pairing session behind it.
    /// The signer answers with its own `connect`; nothing is published here.
    pub async fn create_invitation(&self, options: InvitationOptions) -> Result<Invitation> {
        let keys = generate_keypair();
        let relays = normalize_relays(&options.relays);
        let secret = options
            .secret
            .filter(|s| !s.is_empty())
            .unwrap_or_else(random_pairing_secret);
        let permissions = normalize_permissions(&options.permissions);
        let client_public_key = public_key_hex(&keys);
        let created = now_millis();

        let uri = build_nostrconnect_uri(
            &client_public_key,
            &relays,
            Some(&secret),
            &permissions,
            options.metadata.as_ref(),
        );

        let session = self.sessions.upsert_session(Session {
            id: Session::session_id(SessionType::ClientInitiated, &client_public_key, created),
            session_type: SessionType::ClientInitiated,
            remote_signer_pubkey: String::new(),
            user_pubkey: None,
            client_public_key,
            client_private_key: secret_key_hex(&keys),
            relays,
            permissions,
            status: SessionStatus::Pairing,
            algorithm: options.algorithm.unwrap_or(EncryptionAlgorithm::Nip44),
            pairing_secret: Some(secret),
            metadata: options.metadata,
            last_seen_at: None,
            last_error: None,
            pending_relays: None,
            auth_challenge_url: None,
            created_at: created,
            updated_at: created,
        })?;

        self.ensure_queue();
        Ok(Invitation { session, uri })
    }

    pub async fn send_request(
        &self,
        session_id: &str,
        method: Method,
        params: Vec<String>,
        id: Option<String>,
    ) -> Result<ResponsePayload> {
        if self.sessions.get_session(session_id).is_none() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        self.ensure_queue()
            .send(session_id, build_request(id, method, params))
            .await
    }

    /// Re-issue `connect` for a stored session.
    pub async fn connect_session(&self, session_id: &str) -> Result<ResponsePayload> {
        let session = self
            .sessions
            .get_session(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.remote_signer_pubkey.is_empty() {
            return Err(Error::SignerUnknown);
        }
        let params = connect_params(
            &session.remote_signer_pubkey,
            session.pairing_secret.as_deref(),
            &session.permissions,
        );
        self.ensure_queue()
            .send(session_id, build_request(None, Method::Connect, params))
            .await
    }

    pub async fn fetch_user_public_key(&self, session_id: &str) -> Result<String> {
        if self.sessions.get_session(session_id).is_none() {
            return Err(Error::SessionNotFound(session_id.to_string()));
        }
        self.ensure_queue().request_user_pubkey(session_id).await
    }

    fn ensure_queue(&self) -> Arc<RequestQueue> {
        let mut slot = self.queue.lock().unwrap();
        if let Some(queue) = slot.as_ref() {
            return queue.clone();
        }
        let queue = RequestQueue::new(
            self.sessions.clone(),
            self.transport.clone(),
            self.config.clone(),
        );
        queue.init();
        *slot = Some(queue.clone());
        queue
    }
}

/// `[remote, secret, perms]`, with the secret materialized as `""` when
/// absent but permissions follow, so positions keep their meaning.
fn connect_params(remote: &str, secret: Option<&str>, permissions: &[String]) -> Vec<String> {
    let mut params = vec![remote.to_string()];
    match secret {
        Some(secret) => params.push(secret.to_string()),
        None if !permissions.is_empty() => params.push(String::new()),
        None => {}
    }
    if !permissions.is_empty() {
        params.push(permissions.join(","));
    }
    params
}

fn random_pairing_secret() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_params_positions() {
        assert_eq!(connect_params("pk", Some("s"), &[]), vec!["pk", "s"]);
        assert_eq!(connect_params("pk", None, &[]), vec!["pk"]);
        assert_eq!(
            connect_params("pk", None, &["sign_event".to_string()]),
            vec!["pk", "", "sign_event"]
        );
        assert_eq!(
            connect_params(
                "pk",
                Some("s"),
                &["sign_event".to_string(), "ping".to_string()]
            ),
            vec!["pk", "s", "sign_event,ping"]
        );
    }

    #[test]
    fn random_pairing_secret_is_16_bytes_hex() {
        let secret = random_pairing_secret();
        assert_eq!(secret.len(), 32);
        assert!(secret.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')));
        assert_ne!(secret, random_pairing_secret());
    }
}
