use async_trait::async_trait;
use nostr::{Event, Filter};
use nostr_sdk::{Client, RelayPoolNotification};

use crate::{Error, Result, Unsubscribe};

pub type EventHandler = Box<dyn Fn(Event) + Send + Sync>;

/// Trim and strip the trailing slash; empty input is discarded.
pub fn normalize_relay_url(url: &str) -> Option<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalize and de-duplicate, preserving first-seen order.
pub fn normalize_relays(relays: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for relay in relays {
        if let Some(normalized) = normalize_relay_url(relay) {
            if !out.contains(&normalized) {
                out.push(normalized);
            }
        }
    }
    out
}

/// Minimal relay seam the core consumes.
///
/// `publish` resolves once any target relay acknowledged the event and
/// fails with the aggregated error when all of them rejected it; an empty
/// relay list fails with [`Error::NoRelays`] before touching the network.
/// `subscribe` delivers matching events to `handler` until the returned
/// unsubscribe callable runs; with no relays it warns and returns a no-op.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<()>;
    async fn subscribe(&self, filter: Filter, relays: &[String], handler: EventHandler)
        -> Unsubscribe;
}

/// [`RelayTransport`] backed by a `nostr-sdk` relay pool.
pub struct RelayPoolTransport {
    client: Client,
}

impl RelayPoolTransport {
    pub fn new() -> Self {
        Self {
            client: Client::default(),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }

    async fn ensure_relays(&self, relays: &[String]) {
        for relay in relays {
            if let Err(e) = self.client.add_relay(relay.as_str()).await {
                tracing::warn!("failed to add relay {relay}: {e}");
            }
        }
        self.client.connect().await;
    }
}

impl Default for RelayPoolTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayTransport for RelayPoolTransport {
    async fn publish(&self, event: &Event, relays: &[String]) -> Result<()> {
        let relays = normalize_relays(relays);
        if relays.is_empty() {
            return Err(Error::NoRelays);
        }
        self.ensure_relays(&relays).await;

        match self.client.send_event_to(relays, event.clone()).await {
            Ok(output) if !output.success.is_empty() => Ok(()),
            Ok(output) => Err(Error::Transport(format!(
                "publish rejected by all relays: {:?}",
                output.failed
            ))),
            Err(e) => Err(Error::Transport(e.to_string())),
        }
    }

    async fn subscribe(
        &self,
        filter: Filter,
        relays: &[String],
        handler: EventHandler,
    ) -> Unsubscribe {
        let relays = normalize_relays(relays);
        if relays.is_empty() {
            tracing::warn!("subscribe called with no relays");
            return Box::new(|| {});
        }
        self.ensure_relays(&relays).await;

        let output = match self.client.subscribe_to(relays, filter, None).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!("subscribe failed: {e}");
                return Box::new(|| {});
            }
        };
        let sub_id = output.val;

        let mut notifications = self.client.notifications();
        let task_sub_id = sub_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Ok(notification) = notifications.recv().await {
                if let RelayPoolNotification::Event {
                    subscription_id,
                    event,
                    ..
                } = notification
                {
                    if subscription_id == task_sub_id {
                        handler(*event);
                    }
                }
            }
        });

        let client = self.client.clone();
        Box::new(move || {
            forwarder.abort();
            tokio::spawn(async move {
                client.unsubscribe(sub_id).await;
            });
        })
    }
}
