#![allow(dead_code)] // each test binary uses a different slice of this module

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr::{Event, EventBuilder, Filter, Keys, Kind, Tag, Timestamp};
use nostr_connect_client::{
    decode_request, decode_response, encode_request, encode_response, keys, EncryptionAlgorithm,
    EncryptionContext, Error, EventHandler, Method, RelayTransport, RequestPayload,
    ResponsePayload, Result, Session, SessionStatus, SessionType, Unsubscribe,
    NOSTR_CONNECT_KIND,
};

type SharedHandler = Arc<dyn Fn(Event) + Send + Sync>;
type Responder = Box<dyn Fn(&Event) -> Vec<Event> + Send + Sync>;

#[derive(Default)]
struct MockState {
    published: Vec<(Event, Vec<String>)>,
    handlers: Vec<(u64, SharedHandler)>,
    broadcast: Vec<Event>,
    filters: Vec<Filter>,
    publish_error: Option<String>,
    next_handler_id: u64,
}

/// In-process stand-in for the relay pool: records publishes, lets tests
/// inject events, and replays past events to late subscribers the way a
/// relay replays a `since` window.
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    responders: Mutex<Vec<Responder>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Arc::new(Mutex::new(MockState::default())),
            responders: Mutex::new(Vec::new()),
        })
    }

    pub fn published(&self) -> Vec<(Event, Vec<String>)> {
        self.state.lock().unwrap().published.clone()
    }

    pub fn published_events(&self) -> Vec<Event> {
        self.state
            .lock()
            .unwrap()
            .published
            .iter()
            .map(|(event, _)| event.clone())
            .collect()
    }

    pub fn filters(&self) -> Vec<Filter> {
        self.state.lock().unwrap().filters.clone()
    }

    pub fn active_handler_count(&self) -> usize {
        self.state.lock().unwrap().handlers.len()
    }

    pub fn set_publish_error(&self, message: Option<&str>) {
        self.state.lock().unwrap().publish_error = message.map(str::to_string);
    }

    pub fn add_responder(&self, responder: impl Fn(&Event) -> Vec<Event> + Send + Sync + 'static) {
        self.responders.lock().unwrap().push(Box::new(responder));
    }

    /// Push an event at the queue as if a relay delivered it.
    pub fn deliver(&self, event: Event) {
        let handlers: Vec<SharedHandler> = {
            let mut state = self.state.lock().unwrap();
            state.broadcast.push(event.clone());
            state.handlers.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in handlers {
            handler(event.clone());
        }
    }
}

#[async_trait]
impl RelayTransport for MockTransport {
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<()> {
        if relays.is_empty() {
            return Err(Error::NoRelays);
        }
        if let Some(message) = self.state.lock().unwrap().publish_error.clone() {
            return Err(Error::Transport(message));
        }
        self.state
            .lock()
            .unwrap()
            .published
            .push((event.clone(), relays.to_vec()));

        let responses: Vec<Event> = {
            let responders = self.responders.lock().unwrap();
            responders.iter().flat_map(|r| r(event)).collect()
        };
        for response in responses {
            self.deliver(response);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        filter: Filter,
        _relays: &[String],
        handler: EventHandler,
    ) -> Unsubscribe {
        let handler: SharedHandler = Arc::from(handler);
        let (id, backlog) = {
            let mut state = self.state.lock().unwrap();
            state.next_handler_id += 1;
            let id = state.next_handler_id;
            state.filters.push(filter);
            state.handlers.push((id, handler.clone()));
            (id, state.broadcast.clone())
        };
        for event in backlog {
            handler(event);
        }

        let state = self.state.clone();
        Box::new(move || {
            state.lock().unwrap().handlers.retain(|(hid, _)| *hid != id);
        })
    }
}

/// Minimal remote-signer double: decrypts what the client publishes and
/// crafts kind-24133 answers with its own keys.
#[derive(Clone)]
pub struct FakeSigner {
    pub keys: Keys,
    pub user_keys: Keys,
    pub algorithm: EncryptionAlgorithm,
}

impl FakeSigner {
    pub fn new() -> Self {
        Self {
            keys: Keys::generate(),
            user_keys: Keys::generate(),
            algorithm: EncryptionAlgorithm::Nip44,
        }
    }

    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.keys.public_key().to_bytes())
    }

    pub fn user_pubkey_hex(&self) -> String {
        hex::encode(self.user_keys.public_key().to_bytes())
    }

    fn context_for(&self, counterparty_hex: &str) -> EncryptionContext {
        EncryptionContext::new(
            hex::encode(self.keys.secret_key().to_secret_bytes()),
            counterparty_hex.to_string(),
            self.algorithm,
        )
    }

    pub fn try_decrypt_request(&self, event: &Event) -> Result<RequestPayload> {
        let ctx = self.context_for(&hex::encode(event.pubkey.to_bytes()));
        decode_request(&event.content, &ctx)
    }

    pub fn decrypt_request(&self, event: &Event) -> RequestPayload {
        self.try_decrypt_request(event).expect("decryptable request")
    }

    pub fn try_decrypt_response(&self, event: &Event) -> Result<ResponsePayload> {
        let ctx = self.context_for(&hex::encode(event.pubkey.to_bytes()));
        decode_response(&event.content, &ctx)
    }

    pub fn decrypt_response(&self, event: &Event) -> ResponsePayload {
        self.try_decrypt_response(event)
            .expect("decryptable response")
    }

    /// Answer a previously published client request.
    pub fn response_event(&self, to: &Event, response: &ResponsePayload) -> Event {
        let counterparty = hex::encode(to.pubkey.to_bytes());
        let ctx = self.context_for(&counterparty);
        let content = encode_response(response, &ctx).expect("encodable response");
        self.signed_event(&counterparty, content)
    }

    /// Signer-initiated request aimed at a client pubkey.
    pub fn request_event(&self, client_pubkey_hex: &str, request: &RequestPayload) -> Event {
        let ctx = self.context_for(client_pubkey_hex);
        let content = encode_request(request, &ctx).expect("encodable request");
        self.signed_event(client_pubkey_hex, content)
    }

    fn signed_event(&self, counterparty_hex: &str, content: String) -> Event {
        let tag = Tag::parse(["p", counterparty_hex]).expect("valid p tag");
        EventBuilder::new(Kind::from(NOSTR_CONNECT_KIND), content)
            .tags([tag])
            .custom_created_at(Timestamp::from(now_seconds()))
            .build(self.keys.public_key())
            .sign_with_keys(&self.keys)
            .expect("signable event")
    }
}

/// Responder that acks `connect`, serves `get_public_key`, and answers
/// `ping`; everything else goes unanswered.
pub fn auto_responder(signer: FakeSigner) -> impl Fn(&Event) -> Vec<Event> + Send + Sync {
    move |event| {
        let Ok(request) = signer.try_decrypt_request(event) else {
            return Vec::new();
        };
        let response = match request.method {
            Method::Connect => ResponsePayload {
                id: request.id,
                result: Some("ack".to_string()),
                error: None,
            },
            Method::GetPublicKey => ResponsePayload {
                id: request.id,
                result: Some(signer.user_pubkey_hex()),
                error: None,
            },
            Method::Ping => ResponsePayload {
                id: request.id,
                result: Some("pong".to_string()),
                error: None,
            },
            _ => return Vec::new(),
        };
        vec![signer.response_event(event, &response)]
    }
}

/// Paired session pointing at the given signer, as it looks after a
/// completed bunker handshake.
pub fn session_for_signer(signer: &FakeSigner, status: SessionStatus) -> Session {
    let client = keys::generate_keypair();
    let created = now_millis();
    Session {
        id: Session::session_id(SessionType::SignerInitiated, &signer.pubkey_hex(), created),
        session_type: SessionType::SignerInitiated,
        remote_signer_pubkey: signer.pubkey_hex(),
        user_pubkey: None,
        client_public_key: keys::public_key_hex(&client),
        client_private_key: keys::secret_key_hex(&client),
        relays: vec!["wss://relay.test".to_string()],
        permissions: Vec::new(),
        status,
        algorithm: EncryptionAlgorithm::Nip44,
        pairing_secret: None,
        metadata: None,
        last_seen_at: None,
        last_error: None,
        pending_relays: None,
        auth_challenge_url: None,
        created_at: created,
        updated_at: created,
    }
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 5s");
}

pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn now_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
