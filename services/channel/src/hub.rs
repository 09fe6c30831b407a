//! The channel hub: topic membership, per-client mailboxes, and the
//! lazily-started bridge that forwards bus traffic into joined clients.
//!
//! Mirrors a registry-of-registries shape used elsewhere for stream
//! broadcasts (a double-checked read-then-write lock around a
//! get-or-create), generalised from one `Uuid -> broadcast::Sender` map to
//! the hub's two maps (`topic -> clients`, `client -> mailbox`).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tangram_admission::Admission;
use tangram_bus::Bus;
use tangram_config::ChannelConfig;
use tangram_protocol::Envelope;
use tokio::sync::{Mutex, Notify, RwLock};

/// A bounded per-client outbound queue. On overflow the oldest frame is
/// dropped and the mailbox is marked stale; the session loop checks
/// staleness and closes rather than silently falling further behind.
pub struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    capacity: usize,
    stale: AtomicBool,
}

impl Mailbox {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Mailbox {
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            notify: Notify::new(),
            capacity,
            stale: AtomicBool::new(false),
        })
    }

    pub async fn push(&self, envelope: Envelope) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.capacity {
            queue.pop_front();
            self.stale.store(true, Ordering::SeqCst);
        }
        queue.push_back(envelope);
        drop(queue);
        self.notify.notify_one();
    }

    pub async fn recv(&self) -> Envelope {
        loop {
            {
                let mut queue = self.queue.lock().await;
                if let Some(envelope) = queue.pop_front() {
                    return envelope;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }
}

const DEFAULT_MAILBOX_CAPACITY: usize = 256;

/// Maintains `topic -> set<client_id>` and `client_id -> mailbox`, plus
/// which topics already have a bus-to-hub bridge task running.
#[derive(Default)]
pub struct Hub {
    members: RwLock<HashMap<String, HashSet<String>>>,
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
    bridged_topics: RwLock<HashSet<String>>,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Hub::default())
    }

    pub async fn register_client(&self, client_id: &str) -> Arc<Mailbox> {
        let mailbox = Mailbox::new(DEFAULT_MAILBOX_CAPACITY);
        self.mailboxes
            .write()
            .await
            .insert(client_id.to_owned(), mailbox.clone());
        mailbox
    }

    /// Removes `client_id` from every topic it belongs to and drops its
    /// mailbox. Called once, on session teardown.
    pub async fn drop_client(&self, client_id: &str) {
        self.mailboxes.write().await.remove(client_id);
        let mut members = self.members.write().await;
        for clients in members.values_mut() {
            clients.remove(client_id);
        }
        members.retain(|_, clients| !clients.is_empty());
    }

    pub async fn join(&self, client_id: &str, topic: &str) {
        self.members
            .write()
            .await
            .entry(topic.to_owned())
            .or_default()
            .insert(client_id.to_owned());
    }

    pub async fn leave(&self, client_id: &str, topic: &str) {
        if let Some(clients) = self.members.write().await.get_mut(topic) {
            clients.remove(client_id);
        }
    }

    pub async fn members(&self, topic: &str) -> Vec<String> {
        self.members
            .read()
            .await
            .get(topic)
            .map(|clients| clients.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Enqueues `envelope` onto every current member's mailbox. A client
    /// removed just before this call is skipped; one added concurrently
    /// may or may not see this particular frame but will see the next.
    pub async fn deliver(&self, topic: &str, envelope: Envelope) {
        let client_ids = self.members(topic).await;
        let mailboxes = self.mailboxes.read().await;
        for client_id in client_ids {
            if let Some(mailbox) = mailboxes.get(&client_id) {
                mailbox.push(envelope.clone()).await;
            }
        }
    }

    /// Starts, at most once per topic, a background task that subscribes
    /// to `topic` on the bus and re-delivers anything published there to
    /// every joined client. Bus payloads that are not already an envelope
    /// (e.g. a live-state-pipeline `CoordinateUpdate`) are wrapped as a
    /// `new-data` event on that topic.
    pub async fn ensure_bridge<B: Bus + Clone>(self: &Arc<Self>, bus: B, topic: &str) {
        {
            let bridged = self.bridged_topics.read().await;
            if bridged.contains(topic) {
                return;
            }
        }
        let mut bridged = self.bridged_topics.write().await;
        if bridged.contains(topic) {
            return;
        }
        bridged.insert(topic.to_owned());
        drop(bridged);

        let hub = Arc::clone(self);
        let topic_owned = topic.to_owned();
        tokio::spawn(async move {
            let mut subscription = match bus.subscribe(&[topic_owned.clone()]).await {
                Ok(sub) => sub,
                Err(error) => {
                    tracing::warn!(topic = %topic_owned, %error, "failed to bridge bus topic into hub");
                    return;
                }
            };
            while let Some(message) = subscription.recv().await {
                let envelope = match serde_json::from_str::<Envelope>(&message.payload) {
                    Ok(envelope) => envelope,
                    Err(_) => Envelope {
                        join_ref: None,
                        msg_ref: None,
                        topic: topic_owned.clone(),
                        event: "new-data".to_owned(),
                        payload: serde_json::from_str(&message.payload)
                            .unwrap_or(serde_json::Value::Null),
                    },
                };
                hub.deliver(&topic_owned, envelope).await;
            }
        });
    }
}

/// Shared application state, generic over the bus implementation so unit
/// and integration tests can run against `tangram_bus::InMemoryBus`
/// instead of a live Redis instance.
#[derive(Clone)]
pub struct AppState<B: Bus + Clone> {
    pub hub: Arc<Hub>,
    pub bus: B,
    pub admission: Arc<Admission>,
    pub config: Arc<ChannelConfig>,
}

impl<B: Bus + Clone> AppState<B> {
    pub fn new(bus: B, admission: Admission, config: ChannelConfig) -> Self {
        AppState {
            hub: Hub::new(),
            bus,
            admission: Arc::new(admission),
            config: Arc::new(config),
        }
    }
}
