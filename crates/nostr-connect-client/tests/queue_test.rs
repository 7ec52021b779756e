mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{session_for_signer, wait_until, FakeSigner, MockTransport};
use nostr_connect_client::{
    build_request, Error, MemorySnapshotStorage, Method, RequestQueue, RequestQueueConfig,
    RequestState, ResponsePayload, SessionManager, SessionStatus,
};

fn queue_with(
    transport: Arc<MockTransport>,
    timeout: Duration,
) -> (Arc<SessionManager>, Arc<RequestQueue>) {
    let manager = Arc::new(SessionManager::new(Arc::new(MemorySnapshotStorage::new())));
    let queue = RequestQueue::new(
        manager.clone(),
        transport,
        RequestQueueConfig {
            request_timeout: timeout,
        },
    );
    queue.init();
    (manager, queue)
}

#[tokio::test(start_paused = true)]
async fn request_expires_when_no_response_arrives() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport, Duration::from_millis(100));

    let session = manager
        .upsert_session(session_for_signer(&signer, SessionStatus::Active))
        .unwrap();

    let err = queue
        .send(
            &session.id,
            build_request(Some("r1".to_string()), Method::Ping, Vec::new()),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout));
    assert!(queue.pending_requests().is_empty());
}

#[tokio::test]
async fn send_requires_a_known_remote_signer() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport, Duration::from_secs(60));

    let mut session = session_for_signer(&signer, SessionStatus::Pairing);
    session.remote_signer_pubkey = String::new();
    let session = manager.upsert_session(session).unwrap();

    let err = queue
        .send(&session.id, build_request(None, Method::Ping, Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SignerUnknown));

    let err = queue
        .send("missing", build_request(None, Method::Ping, Vec::new()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));
}

#[tokio::test]
async fn publish_failure_records_error_and_downgrades_session() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport.clone(), Duration::from_secs(60));

    let session = manager
        .upsert_session(session_for_signer(&signer, SessionStatus::Active))
        .unwrap();
    transport.set_publish_error(Some("relay-not-connected"));

    let err = queue
        .send(&session.id, build_request(None, Method::Ping, Vec::new()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("relay-not-connected"));

    let session = manager.get_session(&session.id).unwrap();
    assert_eq!(session.status, SessionStatus::Pairing);
    assert!(session
        .last_error
        .as_deref()
        .unwrap()
        .contains("relay-not-connected"));
    // Still marked as headed for these relays when the publish fell over.
    assert_eq!(session.pending_relays, Some(session.relays.clone()));
    assert!(queue.pending_requests().is_empty());
}

#[tokio::test]
async fn auth_challenge_parks_the_caller_until_the_real_response() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport.clone(), Duration::from_secs(60));

    let session = manager
        .upsert_session(session_for_signer(&signer, SessionStatus::Active))
        .unwrap();

    let send_task = {
        let queue = queue.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            queue
                .send(
                    &session_id,
                    build_request(
                        Some("R1".to_string()),
                        Method::SignEvent,
                        vec!["{\"kind\":1}".to_string()],
                    ),
                )
                .await
        })
    };

    wait_until(|| !transport.published_events().is_empty()).await;
    let request_event = transport.published_events().remove(0);

    transport.deliver(signer.response_event(
        &request_event,
        &ResponsePayload {
            id: "R1".to_string(),
            result: Some("auth_url".to_string()),
            error: Some("https://signer/approve/X".to_string()),
        },
    ));

    wait_until(|| {
        manager
            .get_session(&session.id)
            .map(|s| s.auth_challenge_url.is_some())
            .unwrap_or(false)
    })
    .await;

    let challenged = manager.get_session(&session.id).unwrap();
    assert_eq!(challenged.status, SessionStatus::Pairing);
    assert_eq!(
        challenged.auth_challenge_url.as_deref(),
        Some("https://signer/approve/X")
    );
    assert!(challenged.last_error.is_none());

    // Caller still waiting, pending record parked in challenge state.
    assert!(!send_task.is_finished());
    let pending = queue.pending_requests();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].state, RequestState::Challenge);

    transport.deliver(signer.response_event(
        &request_event,
        &ResponsePayload {
            id: "R1".to_string(),
            result: Some("{\"signed\":true}".to_string()),
            error: None,
        },
    ));

    let response = send_task.await.unwrap().unwrap();
    assert_eq!(response.result.as_deref(), Some("{\"signed\":true}"));
    assert!(response.error.is_none());

    let settled = manager.get_session(&session.id).unwrap();
    assert_eq!(settled.status, SessionStatus::Active);
    assert!(settled.auth_challenge_url.is_none());
    assert!(settled.last_error.is_none());
    assert!(queue.pending_requests().is_empty());
}

#[tokio::test]
async fn signer_error_rejects_caller_and_downgrades_session() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport.clone(), Duration::from_secs(60));

    let session = manager
        .upsert_session(session_for_signer(&signer, SessionStatus::Active))
        .unwrap();

    let send_task = {
        let queue = queue.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            queue
                .send(
                    &session_id,
                    build_request(Some("R2".to_string()), Method::SignEvent, Vec::new()),
                )
                .await
        })
    };

    wait_until(|| !transport.published_events().is_empty()).await;
    let request_event = transport.published_events().remove(0);
    transport.deliver(signer.response_event(
        &request_event,
        &ResponsePayload {
            id: "R2".to_string(),
            result: None,
            error: Some("user rejected".to_string()),
        },
    ));

    let err = send_task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Signer(_)));
    assert!(err.to_string().contains("user rejected"));

    let session = manager.get_session(&session.id).unwrap();
    assert_eq!(session.status, SessionStatus::Pairing);
    assert_eq!(session.last_error.as_deref(), Some("user rejected"));
}

#[tokio::test]
async fn already_connected_error_is_treated_as_success_for_connect() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport.clone(), Duration::from_secs(60));

    let session = manager
        .upsert_session(session_for_signer(&signer, SessionStatus::Pairing))
        .unwrap();

    let send_task = {
        let queue = queue.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            queue
                .send(
                    &session_id,
                    build_request(
                        Some("C1".to_string()),
                        Method::Connect,
                        vec![session_id.clone()],
                    ),
                )
                .await
        })
    };

    wait_until(|| !transport.published_events().is_empty()).await;
    let request_event = transport.published_events().remove(0);
    transport.deliver(signer.response_event(
        &request_event,
        &ResponsePayload {
            id: "C1".to_string(),
            result: None,
            error: Some("Already connected.".to_string()),
        },
    ));

    let response = send_task.await.unwrap().unwrap();
    assert!(response.error.is_none());

    let session = manager.get_session(&session.id).unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.last_error.is_none());
}

#[tokio::test]
async fn non_connect_error_with_already_connect_words_still_fails() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport.clone(), Duration::from_secs(60));

    // Session not active, pending method is not connect: no tolerance.
    let session = manager
        .upsert_session(session_for_signer(&signer, SessionStatus::Pairing))
        .unwrap();

    let send_task = {
        let queue = queue.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            queue
                .send(
                    &session_id,
                    build_request(Some("P1".to_string()), Method::Ping, Vec::new()),
                )
                .await
        })
    };

    wait_until(|| !transport.published_events().is_empty()).await;
    let request_event = transport.published_events().remove(0);
    transport.deliver(signer.response_event(
        &request_event,
        &ResponsePayload {
            id: "P1".to_string(),
            result: None,
            error: Some("already connected".to_string()),
        },
    ));

    let err = send_task.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Signer(_)));
}

#[tokio::test]
async fn unsolicited_response_updates_session_without_a_caller() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport.clone(), Duration::from_secs(60));

    let session = manager
        .upsert_session(session_for_signer(&signer, SessionStatus::Pairing))
        .unwrap();
    wait_until(|| transport.active_handler_count() >= 1).await;

    // A status update from the signer that correlates with no pending id.
    let response_event = signer.response_event(
        &fake_client_event(&session.client_private_key, &signer.pubkey_hex()),
        &ResponsePayload {
            id: "nobody-waiting".to_string(),
            result: Some("ack".to_string()),
            error: None,
        },
    );
    transport.deliver(response_event);

    wait_until(|| {
        manager
            .get_session(&session.id)
            .map(|s| s.status == SessionStatus::Active)
            .unwrap_or(false)
    })
    .await;
    let session = manager.get_session(&session.id).unwrap();
    assert!(session.last_seen_at.is_some());
    assert!(queue.pending_requests().is_empty());
}

#[tokio::test]
async fn subscription_follows_the_session_set() {
    let transport = MockTransport::new();
    let signer = FakeSigner::new();
    let (manager, queue) = queue_with(transport.clone(), Duration::from_secs(60));

    assert_eq!(transport.active_handler_count(), 0);

    let session = manager
        .upsert_session(session_for_signer(&signer, SessionStatus::Active))
        .unwrap();
    wait_until(|| transport.active_handler_count() == 1).await;

    manager.remove_session(&session.id).unwrap();
    wait_until(|| transport.active_handler_count() == 0).await;

    let _ = queue;
}

/// Stand-in for "the client's own event" so FakeSigner::response_event can
/// address the client pubkey; only the pubkey field matters.
fn fake_client_event(client_secret_hex: &str, signer_pubkey_hex: &str) -> nostr::Event {
    use nostr::{EventBuilder, Kind, Tag, Timestamp};
    let keys = nostr_connect_client::keys::keys_from_hex(client_secret_hex).unwrap();
    EventBuilder::new(Kind::from(nostr_connect_client::NOSTR_CONNECT_KIND), "")
        .tags([Tag::parse(["p", signer_pubkey_hex]).unwrap()])
        .custom_created_at(Timestamp::from(common::now_seconds()))
        .build(keys.public_key())
        .sign_with_keys(&keys)
        .unwrap()
}
