use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr::{Event, EventBuilder, Filter, Kind, PublicKey, Tag, Timestamp};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::encryption::EncryptionContext;
use crate::keys::keys_from_hex;
use crate::payload::{
    build_request, decode_request, decode_response, encode_request, encode_response,
};
use crate::session_manager::SessionManager;
use crate::transport::{normalize_relays, EventHandler, RelayTransport};
use crate::util::{now_millis, now_seconds};
use crate::{
    Error, Method, PendingRequest, RequestPayload, RequestState, ResponsePayload, Result, Session,
    SessionSnapshot, SessionStatus, Unsubscribe, NOSTR_CONNECT_KIND,
};

const SUBSCRIPTION_LOOKBACK_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RequestQueueConfig {
    pub request_timeout: Duration,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
        }
    }
}

struct InFlight {
    responder: oneshot::Sender<Result<ResponsePayload>>,
    timer: JoinHandle<()>,
}

/// Tracks outstanding requests, publishes them, and routes incoming
/// kind-24133 events back to callers and session state.
///
/// Construct with [`RequestQueue::new`] and call [`RequestQueue::init`]
/// once; the queue then maintains a single relay subscription covering
/// every session's client pubkey.
pub struct RequestQueue {
    sessions: Arc<SessionManager>,
    transport: Arc<dyn RelayTransport>,
    config: RequestQueueConfig,
    pending: Mutex<HashMap<String, PendingRequest>>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    subscription: tokio::sync::Mutex<Option<Unsubscribe>>,
    known_clients: Mutex<Vec<String>>,
    change_listener: Mutex<Option<Unsubscribe>>,
}

impl RequestQueue {
    pub fn new(
        sessions: Arc<SessionManager>,
        transport: Arc<dyn RelayTransport>,
        config: RequestQueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions,
            transport,
            config,
            pending: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            subscription: tokio::sync::Mutex::new(None),
            known_clients: Mutex::new(Vec::new()),
            change_listener: Mutex::new(None),
        })
    }

    /// Start watching the session set. The manager emits the current
    /// snapshot on subscription, which triggers the initial subscription
    /// build when sessions already exist.
    pub fn init(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let unsubscribe = self.sessions.on_change(Box::new(move |snapshot| {
            if let Some(queue) = weak.upgrade() {
                queue.schedule_rebuild_if_changed(snapshot);
            }
        }));
        *self.change_listener.lock().unwrap() = Some(unsubscribe);
    }

    /// Encrypt, sign, publish, and await the correlated response.
    pub async fn send(
        self: &Arc<Self>,
        session_id: &str,
        payload: RequestPayload,
    ) -> Result<ResponsePayload> {
        let session = self
            .sessions
            .get_session(session_id)
            .ok_or_else(|| Error::SessionNotFound(session_id.to_string()))?;
        if session.remote_signer_pubkey.is_empty() {
            return Err(Error::SignerUnknown);
        }

        let request_id = payload.id.clone();
        self.pending.lock().unwrap().insert(
            request_id.clone(),
            PendingRequest {
                id: request_id.clone(),
                method: payload.method,
                session_id: session.id.clone(),
                created_at: now_millis(),
                last_sent_at: None,
                state: RequestState::Pending,
                payload: payload.clone(),
                error: None,
                response: None,
            },
        );

        let (responder, receiver) = oneshot::channel();
        let timer = self.spawn_timer(request_id.clone());
        self.in_flight
            .lock()
            .unwrap()
            .insert(request_id.clone(), InFlight { responder, timer });

        if let Err(err) = self.dispatch(&session, &payload).await {
            self.abandon_request(&request_id);
            let message = err.to_string();
            let _ = self.sessions.update_session(&session.id, |s| {
                s.last_error = Some(message.clone());
                if message.contains("relay-not-connected") {
                    s.status = SessionStatus::Pairing;
                }
            });
            return Err(err);
        }

        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(record) = pending.get_mut(&request_id) {
                record.state = RequestState::Sent;
                record.last_sent_at = Some(now_millis());
            }
        }
        let _ = self
            .sessions
            .update_session(&session.id, |s| s.pending_relays = None);

        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Send `get_public_key` and persist the answer on the session.
    pub async fn request_user_pubkey(self: &Arc<Self>, session_id: &str) -> Result<String> {
        let payload = build_request(None, Method::GetPublicKey, Vec::new());
        let response = self.send(session_id, payload).await?;
        let pubkey = response
            .result
            .filter(|r| !r.is_empty())
            .ok_or_else(|| {
                Error::UnexpectedPayload("get_public_key returned no result".to_string())
            })?;
        self.sessions
            .update_session(session_id, |s| s.user_pubkey = Some(pubkey.clone()))?;
        Ok(pubkey)
    }

    /// Route one incoming wire event to the response or request branch.
    pub async fn handle_event(self: &Arc<Self>, event: Event) {
        if event.kind.as_u16() != NOSTR_CONNECT_KIND {
            return;
        }
        let Some(client_pubkey) = p_tag_value(&event) else {
            return;
        };
        let Some(session) = self.sessions.get_session_by_client_pubkey(&client_pubkey) else {
            return;
        };

        let sender = hex::encode(event.pubkey.to_bytes());
        let ctx = EncryptionContext::new(
            session.client_private_key.clone(),
            sender.clone(),
            session.algorithm,
        );

        match decode_response(&event.content, &ctx) {
            Ok(response) => self.handle_response(&session, &sender, response).await,
            // A codec failure may mean the payload was a request; only the
            // signer-initiated connect arrives that way.
            Err(err) if err.is_codec_error() => match decode_request(&event.content, &ctx) {
                Ok(request) => self.handle_request(&session, &sender, request).await,
                Err(request_err) => tracing::debug!(
                    "dropping undecodable event for session {}: {request_err}",
                    session.id
                ),
            },
            Err(err) => {
                tracing::warn!("failed to decode event for session {}: {err}", session.id)
            }
        }
    }

    /// Tear down the subscription and every in-flight record without
    /// settling callers; abandoned awaiters observe a closed channel.
    pub async fn shutdown(&self) {
        if let Some(unsubscribe) = self.change_listener.lock().unwrap().take() {
            unsubscribe();
        }
        if let Some(unsubscribe) = self.subscription.lock().await.take() {
            unsubscribe();
        }
        let records: Vec<InFlight> = self
            .in_flight
            .lock()
            .unwrap()
            .drain()
            .map(|(_, record)| record)
            .collect();
        for record in records {
            record.timer.abort();
        }
        self.pending.lock().unwrap().clear();
        self.known_clients.lock().unwrap().clear();
    }

    pub fn pending_requests(&self) -> Vec<PendingRequest> {
        self.pending.lock().unwrap().values().cloned().collect()
    }

    /// Close the previous subscription and open one covering all sessions,
    /// or none when no sessions remain.
    pub async fn rebuild_subscription(self: &Arc<Self>) {
        let snapshot = self.sessions.snapshot();
        let mut guard = self.subscription.lock().await;
        if let Some(unsubscribe) = guard.take() {
            unsubscribe();
        }
        if snapshot.sessions.is_empty() {
            return;
        }

        let mut pubkeys = Vec::new();
        for session in &snapshot.sessions {
            match hex::decode(&session.client_public_key)
                .ok()
                .and_then(|bytes| PublicKey::from_slice(&bytes).ok())
            {
                Some(pubkey) => pubkeys.push(pubkey),
                None => tracing::warn!(
                    "session {} has an unusable client pubkey, skipping",
                    session.id
                ),
            }
        }
        if pubkeys.is_empty() {
            return;
        }

        let since_secs = (self.min_relevant_millis(&snapshot) / 1000)
            .saturating_sub(SUBSCRIPTION_LOOKBACK_SECS);
        let filter = Filter::new()
            .kind(Kind::from(NOSTR_CONNECT_KIND))
            .pubkeys(pubkeys)
            .since(Timestamp::from(since_secs));

        let all_relays: Vec<String> = snapshot
            .sessions
            .iter()
            .flat_map(|s| s.relays.iter().cloned())
            .collect();
        let relays = normalize_relays(&all_relays);

        let weak = Arc::downgrade(self);
        let handler: EventHandler = Box::new(move |event| {
            let Some(queue) = weak.upgrade() else { return };
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { queue.handle_event(event).await });
            }
        });

        *guard = Some(self.transport.subscribe(filter, &relays, handler).await);
    }

    fn min_relevant_millis(&self, snapshot: &SessionSnapshot) -> u64 {
        let mut min_ms = u64::MAX;
        for session in &snapshot.sessions {
            let relevant = session
                .last_seen_at
                .filter(|v| *v > 0)
                .unwrap_or(if session.updated_at > 0 {
                    session.updated_at
                } else {
                    session.created_at
                });
            min_ms = min_ms.min(relevant);
        }
        for record in self.pending.lock().unwrap().values() {
            min_ms = min_ms.min(record.created_at);
            if let Some(sent) = record.last_sent_at {
                min_ms = min_ms.min(sent);
            }
        }
        if min_ms == u64::MAX {
            0
        } else {
            min_ms
        }
    }

    fn schedule_rebuild_if_changed(self: &Arc<Self>, snapshot: &SessionSnapshot) {
        let mut fingerprint: Vec<String> = snapshot
            .sessions
            .iter()
            .map(|s| s.client_public_key.clone())
            .collect();
        fingerprint.sort();
        {
            let mut known = self.known_clients.lock().unwrap();
            if *known == fingerprint {
                return;
            }
            *known = fingerprint;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let queue = self.clone();
            handle.spawn(async move { queue.rebuild_subscription().await });
        }
    }

    async fn dispatch(&self, session: &Session, payload: &RequestPayload) -> Result<()> {
        let _ = self
            .sessions
            .update_session(&session.id, |s| s.pending_relays = Some(s.relays.clone()));

        let ctx = EncryptionContext::new(
            session.client_private_key.clone(),
            session.remote_signer_pubkey.clone(),
            session.algorithm,
        );
        let content = encode_request(payload, &ctx)?;
        let event = build_signed_event(
            &session.client_private_key,
            &session.remote_signer_pubkey,
            content,
        )?;
        self.transport.publish(&event, &session.relays).await
    }

    async fn handle_response(
        self: &Arc<Self>,
        session: &Session,
        sender: &str,
        response: ResponsePayload,
    ) {
        let request_id = response.id.clone();
        let pending_method = self
            .pending
            .lock()
            .unwrap()
            .get(&request_id)
            .map(|p| p.method);

        // Auth challenge: surface the URL, restart the clock, keep waiting.
        if let Some(url) = response.auth_challenge_url() {
            let url = url.to_string();
            let now = now_millis();
            let _ = self.sessions.update_session(&session.id, |s| {
                s.status = SessionStatus::Pairing;
                s.auth_challenge_url = Some(url.clone());
                s.last_error = None;
                s.pending_relays = None;
                s.last_seen_at = Some(now);
            });
            if pending_method.is_some() {
                self.restart_timer(&request_id);
                if let Some(record) = self.pending.lock().unwrap().get_mut(&request_id) {
                    record.state = RequestState::Challenge;
                }
            }
            return;
        }

        let mut effective_error = response.error.clone().filter(|e| !e.is_empty());
        let mut secret_failure = false;
        let mut clear_secret = false;

        if let Some(secret) = session.pairing_secret.as_deref() {
            if let Some(result) = response.result.as_deref().filter(|r| !r.is_empty()) {
                if result == secret || result == "ack" {
                    clear_secret = true;
                } else if pending_method == Some(Method::Connect) {
                    secret_failure = true;
                } else {
                    // Any other answered request proves the channel; the
                    // secret is spent.
                    clear_secret = true;
                }
            }
        }

        if !secret_failure {
            if let Some(error) = effective_error.as_deref() {
                let lower = error.to_lowercase();
                let connect_context = pending_method == Some(Method::Connect)
                    || (pending_method.is_none() && session.status == SessionStatus::Active);
                if connect_context && lower.contains("already") && lower.contains("connect") {
                    effective_error = None;
                }
            }
        }

        let status = if secret_failure {
            SessionStatus::Revoked
        } else if effective_error.is_some() {
            SessionStatus::Pairing
        } else {
            SessionStatus::Active
        };
        let recorded_error = if secret_failure {
            Some("Remote signer failed secret validation".to_string())
        } else {
            effective_error.clone()
        };

        let now = now_millis();
        let sender_owned = sender.to_string();
        let _ = self.sessions.update_session(&session.id, |s| {
            s.status = status;
            s.last_seen_at = Some(now);
            s.auth_challenge_url = None;
            s.pending_relays = None;
            s.last_error = recorded_error.clone();
            if clear_secret {
                s.pairing_secret = None;
            }
            if s.remote_signer_pubkey.is_empty() {
                s.remote_signer_pubkey = sender_owned.clone();
            }
        });

        // Unsolicited responses still update the session above; only a live
        // in-flight record settles a caller.
        let Some(record) = self.in_flight.lock().unwrap().remove(&request_id) else {
            return;
        };
        record.timer.abort();

        let settle_error = if secret_failure {
            Some("Remote signer failed secret validation".to_string())
        } else {
            effective_error
        };

        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(entry) = pending.get_mut(&request_id) {
                entry.state = if settle_error.is_none() {
                    RequestState::Resolved
                } else {
                    RequestState::Error
                };
                entry.error = settle_error.clone();
                entry.response = Some(response.clone());
            }
            pending.remove(&request_id);
        }

        let outcome = match settle_error {
            None => Ok(ResponsePayload {
                id: request_id,
                result: response.result,
                error: None,
            }),
            Some(error) => Err(Error::Signer(error)),
        };
        let _ = record.responder.send(outcome);
    }

    async fn handle_request(
        self: &Arc<Self>,
        session: &Session,
        sender: &str,
        request: RequestPayload,
    ) {
        let ctx = EncryptionContext::new(
            session.client_private_key.clone(),
            sender.to_string(),
            session.algorithm,
        );

        if request.method != Method::Connect {
            self.send_reply(
                session,
                &ctx,
                sender,
                ResponsePayload {
                    id: request.id,
                    result: None,
                    error: Some("unsupported_method".to_string()),
                },
            )
            .await;
            return;
        }

        if let (Some(secret), Some(provided)) =
            (session.pairing_secret.as_deref(), request.params.get(1))
        {
            if provided != secret {
                let _ = self.sessions.update_session(&session.id, |s| {
                    s.status = SessionStatus::Revoked;
                    s.last_error = Some("Signer failed secret validation".to_string());
                });
                self.send_reply(
                    session,
                    &ctx,
                    sender,
                    ResponsePayload {
                        id: request.id,
                        result: None,
                        error: Some("invalid_secret".to_string()),
                    },
                )
                .await;
                return;
            }
        }

        let ack = session
            .pairing_secret
            .clone()
            .unwrap_or_else(|| "ack".to_string());
        let now = now_millis();
        let sender_owned = sender.to_string();
        let _ = self.sessions.update_session(&session.id, |s| {
            s.status = SessionStatus::Active;
            s.pairing_secret = None;
            s.last_error = None;
            s.last_seen_at = Some(now);
            if s.remote_signer_pubkey.is_empty() {
                s.remote_signer_pubkey = sender_owned.clone();
            }
        });
        let _ = self.sessions.set_active_session(&session.id);

        self.send_reply(
            session,
            &ctx,
            sender,
            ResponsePayload {
                id: request.id,
                result: Some(ack),
                error: None,
            },
        )
        .await;

        if let Some(current) = self.sessions.get_session(&session.id) {
            if current.user_pubkey.is_none()
                && current.permissions.iter().any(|p| p == "get_public_key")
                && !current.remote_signer_pubkey.is_empty()
            {
                let queue = self.clone();
                let session_id = session.id.clone();
                tokio::spawn(async move {
                    if let Err(e) = queue.request_user_pubkey(&session_id).await {
                        tracing::debug!("auto get_public_key failed for {session_id}: {e}");
                    }
                });
            }
        }
    }

    async fn send_reply(
        &self,
        session: &Session,
        ctx: &EncryptionContext,
        counterparty: &str,
        response: ResponsePayload,
    ) {
        let content = match encode_response(&response, ctx) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("failed to encode reply for session {}: {e}", session.id);
                return;
            }
        };
        let event = match build_signed_event(&session.client_private_key, counterparty, content) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("failed to sign reply for session {}: {e}", session.id);
                return;
            }
        };
        if let Err(e) = self.transport.publish(&event, &session.relays).await {
            tracing::warn!("failed to publish reply for session {}: {e}", session.id);
        }
    }

    fn spawn_timer(self: &Arc<Self>, request_id: String) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.config.request_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(queue) = weak.upgrade() {
                queue.expire(&request_id);
            }
        })
    }

    fn restart_timer(self: &Arc<Self>, request_id: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(record) = in_flight.get_mut(request_id) {
            record.timer.abort();
            record.timer = self.spawn_timer(request_id.to_string());
        }
    }

    fn expire(&self, request_id: &str) {
        let Some(record) = self.in_flight.lock().unwrap().remove(request_id) else {
            return;
        };
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(entry) = pending.get_mut(request_id) {
                entry.state = RequestState::Expired;
            }
            pending.remove(request_id);
        }
        let _ = record.responder.send(Err(Error::Timeout));
    }

    /// Publish-failure cleanup: the timer is cancelled and both records
    /// dropped without settling through the channel.
    fn abandon_request(&self, request_id: &str) {
        if let Some(record) = self.in_flight.lock().unwrap().remove(request_id) {
            record.timer.abort();
        }
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(entry) = pending.get_mut(request_id) {
                entry.state = RequestState::Error;
            }
            pending.remove(request_id);
        }
    }
}

pub(crate) fn p_tag_value(event: &Event) -> Option<String> {
    event.tags.iter().find_map(|tag| {
        let values = tag.as_slice();
        if values.first().map(String::as_str) == Some("p") {
            values.get(1).cloned()
        } else {
            None
        }
    })
}

pub(crate) fn build_signed_event(
    secret_key_hex: &str,
    counterparty_pubkey: &str,
    content: String,
) -> Result<Event> {
    let keys = keys_from_hex(secret_key_hex)?;
    let tag = Tag::parse(["p", counterparty_pubkey])
        .map_err(|e| Error::InvalidEvent(e.to_string()))?;
    let unsigned = EventBuilder::new(Kind::from(NOSTR_CONNECT_KIND), content)
        .tags([tag])
        .custom_created_at(Timestamp::from(now_seconds()))
        .build(keys.public_key());
    unsigned
        .sign_with_keys(&keys)
        .map_err(|e| Error::InvalidEvent(e.to_string()))
}
