//! Client-side NIP-46 (Nostr Connect) core.
//!
//! The local application holds no user key; it pairs with a remote signer
//! and exchanges encrypted requests and responses over kind-24133 relay
//! events. This crate covers the full client lifecycle: pairing tokens,
//! persisted sessions with change notification, the encrypted payload
//! codec, and a request queue with timeouts, auth challenges, and
//! signer-initiated handshakes. Relay I/O goes through the
//! [`RelayTransport`] seam so hosts can bring their own pool.

pub mod encryption;
pub mod error;
pub mod keys;
pub mod pairing;
pub mod payload;
pub mod request_queue;
pub mod service;
pub mod session_manager;
pub mod storage;
pub mod transport;
pub mod types;
mod util;

pub use encryption::{
    normalize_remote_pubkey, EncryptionContext, FallbackCipher, Nip04Cipher, Nip44Cipher,
    PayloadCipher,
};
pub use error::{Error, Result};
pub use pairing::{
    build_nostrconnect_uri, parse_pairing_uri, PairingToken, BUNKER_SCHEME, NOSTRCONNECT_SCHEME,
};
pub use payload::{
    build_request, decode_request, decode_response, encode_request, encode_response,
    generate_request_id,
};
pub use request_queue::{RequestQueue, RequestQueueConfig};
pub use service::{Invitation, InvitationOptions, NostrConnect, PairOptions};
pub use session_manager::{ChangeListener, SessionManager};
pub use storage::{
    FileSnapshotStorage, MemorySnapshotStorage, SnapshotStorage, SNAPSHOT_STORAGE_KEY,
};
pub use transport::{
    normalize_relay_url, normalize_relays, EventHandler, RelayPoolTransport, RelayTransport,
};
pub use types::{
    normalize_permissions, EncryptionAlgorithm, Method, PendingRequest, RequestPayload,
    RequestState, ResponsePayload, Session, SessionMetadata, SessionSnapshot, SessionStatus,
    SessionType, Unsubscribe, DEFAULT_PERMISSIONS, NOSTR_CONNECT_KIND,
};
