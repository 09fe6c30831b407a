//! The pub/sub bus abstraction: pattern-subscribe, publish, a geospatial set,
//! and string KV with TTL.
//!
//! Production code talks to Redis through [`RedisBus`]. [`InMemoryBus`]
//! implements the same [`Bus`] trait over a set of in-process broadcast
//! channels, so the channel multiplexer and live-state pipeline can be
//! exercised in tests without a running Redis instance.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex, broadcast, mpsc};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("bus is disconnected")]
    Disconnected,
}

/// One message received from a pattern subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// One row of a geospatial search result.
#[derive(Debug, Clone, PartialEq)]
pub struct GeoMember {
    pub member: String,
    pub longitude: f64,
    pub latitude: f64,
}

/// A handle to an active pattern subscription. Dropping it unsubscribes.
pub struct Subscription {
    rx: mpsc::Receiver<BusMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

/// Narrow interface every bus implementation (Redis-backed or in-memory)
/// satisfies. Generic code is written against this trait, never against a
/// concrete client, so the live-state pipeline and channel hub can run in
/// tests over [`InMemoryBus`].
pub trait Bus: Send + Sync + 'static {
    fn publish(
        &self,
        channel: &str,
        payload: &str,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    fn subscribe(
        &self,
        patterns: &[String],
    ) -> impl Future<Output = Result<Subscription, BusError>> + Send;

    fn geo_add(
        &self,
        key: &str,
        member: &str,
        longitude: f64,
        latitude: f64,
        ttl: Duration,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    fn geo_search(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_km: f64,
    ) -> impl Future<Output = Result<Vec<GeoMember>, BusError>> + Send;

    fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> impl Future<Output = Result<(), BusError>> + Send;

    fn get_string(&self, key: &str) -> impl Future<Output = Result<Option<String>, BusError>> + Send;
}

// ---------------------------------------------------------------------------
// Redis-backed implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct RedisBus {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(RedisBus { client, manager })
    }

    /// Number of subscribers currently listening on `channel`, via
    /// `PUBSUB NUMSUB`. Used by the history admin CLI to decide whether the
    /// history engine is online before sending it a control command.
    pub async fn subscriber_count(&self, channel: &str) -> Result<usize, BusError> {
        let mut conn = self.manager.clone();
        let reply: Vec<(String, usize)> = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(channel)
            .query_async(&mut conn)
            .await?;
        Ok(reply.first().map(|(_, count)| *count).unwrap_or(0))
    }
}

impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<Subscription, BusError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await?;
        }
        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_owned();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                if tx.send(BusMessage { channel, payload }).await.is_err() {
                    break;
                }
            }
        });
        Ok(Subscription { rx })
    }

    async fn geo_add(
        &self,
        key: &str,
        member: &str,
        longitude: f64,
        latitude: f64,
        ttl: Duration,
    ) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        redis::cmd("GEOADD")
            .arg(key)
            .arg(longitude)
            .arg(latitude)
            .arg(member)
            .query_async::<()>(&mut conn)
            .await?;
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn geo_search(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_km: f64,
    ) -> Result<Vec<GeoMember>, BusError> {
        let mut conn = self.manager.clone();
        let rows: Vec<(String, (f64, f64))> = redis::cmd("GEOSEARCH")
            .arg(key)
            .arg("FROMLONLAT")
            .arg(longitude)
            .arg(latitude)
            .arg("BYRADIUS")
            .arg(radius_km)
            .arg("km")
            .arg("WITHCOORD")
            .query_async(&mut conn)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(member, (lon, lat))| GeoMember {
                member,
                longitude: lon,
                latitude: lat,
            })
            .collect())
    }

    async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let mut conn = self.manager.clone();
        match ttl {
            Some(ttl) => {
                conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()).await?;
            }
            None => {
                conn.set::<_, _, ()>(key, value).await?;
            }
        }
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.manager.clone();
        Ok(conn.get(key).await?)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation, for tests
// ---------------------------------------------------------------------------

struct GeoEntry {
    longitude: f64,
    latitude: f64,
    expires_at: Instant,
}

#[derive(Default)]
struct InMemoryState {
    strings: BTreeMap<String, (String, Option<Instant>)>,
    geosets: BTreeMap<String, BTreeMap<String, GeoEntry>>,
}

/// An in-process `Bus` backed by a broadcast channel per published message,
/// matching any pattern via glob-style `*` suffix matching. Good enough to
/// exercise join/publish/receive flows without an external dependency.
#[derive(Clone)]
pub struct InMemoryBus {
    tx: broadcast::Sender<BusMessage>,
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(4096);
        InMemoryBus {
            tx,
            state: Arc::new(Mutex::new(InMemoryState::default())),
        }
    }

    fn pattern_matches(pattern: &str, channel: &str) -> bool {
        match pattern.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => pattern == channel,
        }
    }
}

impl Bus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        // No-op if there are no subscribers; matches Redis PUBLISH semantics.
        let _ = self.tx.send(BusMessage {
            channel: channel.to_owned(),
            payload: payload.to_owned(),
        });
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> Result<Subscription, BusError> {
        let mut rx = self.tx.subscribe();
        let patterns = patterns.to_vec();
        let (out_tx, out_rx) = mpsc::channel(1024);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if patterns.iter().any(|p| Self::pattern_matches(p, &msg.channel))
                            && out_tx.send(msg).await.is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(Subscription { rx: out_rx })
    }

    async fn geo_add(
        &self,
        key: &str,
        member: &str,
        longitude: f64,
        latitude: f64,
        ttl: Duration,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        let set = state.geosets.entry(key.to_owned()).or_default();
        set.insert(
            member.to_owned(),
            GeoEntry {
                longitude,
                latitude,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn geo_search(
        &self,
        key: &str,
        longitude: f64,
        latitude: f64,
        radius_km: f64,
    ) -> Result<Vec<GeoMember>, BusError> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let Some(set) = state.geosets.get_mut(key) else {
            return Ok(Vec::new());
        };
        set.retain(|_, e| e.expires_at > now);
        Ok(set
            .iter()
            .filter(|(_, e)| haversine_km(latitude, longitude, e.latitude, e.longitude) <= radius_km)
            .map(|(member, e)| GeoMember {
                member: member.clone(),
                longitude: e.longitude,
                latitude: e.latitude,
            })
            .collect())
    }

    async fn set_string(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), BusError> {
        let mut state = self.state.lock().await;
        state.strings.insert(
            key.to_owned(),
            (value.to_owned(), ttl.map(|t| Instant::now() + t)),
        );
        Ok(())
    }

    async fn get_string(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut state = self.state.lock().await;
        match state.strings.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Instant::now() => {
                state.strings.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }
}

/// Great-circle distance in kilometres; used by [`InMemoryBus::geo_search`]
/// to approximate Redis's `GEOSEARCH`.
fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1, lon1, lat2, lon2) = (
        lat1.to_radians(),
        lon1.to_radians(),
        lat2.to_radians(),
        lon2.to_radians(),
    );
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_subscribe_on_matching_pattern() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(&["coordinate".to_owned()]).await.unwrap();
        bus.publish("coordinate", r#"{"icao24":"a0b1c2"}"#).await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "coordinate");
        assert!(msg.payload.contains("a0b1c2"));
    }

    #[tokio::test]
    async fn subscribe_wildcard_suffix_matches_prefix() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe(&["jet1090-full*".to_owned()]).await.unwrap();
        bus.publish("jet1090-full-1", "x").await.unwrap();
        bus.publish("other", "y").await.unwrap();
        let msg = sub.recv().await.unwrap();
        assert_eq!(msg.channel, "jet1090-full-1");
    }

    #[tokio::test]
    async fn geo_search_finds_member_within_radius() {
        let bus = InMemoryBus::new();
        bus.geo_add("planes", "a0b1c2", 1.47, 43.5, Duration::from_secs(60))
            .await
            .unwrap();
        let hits = bus.geo_search("planes", 1.47, 43.5, 1.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].member, "a0b1c2");
    }

    #[tokio::test]
    async fn geo_search_excludes_members_outside_radius() {
        let bus = InMemoryBus::new();
        bus.geo_add("planes", "far-away", 50.0, 10.0, Duration::from_secs(60))
            .await
            .unwrap();
        let hits = bus.geo_search("planes", 1.47, 43.5, 1.0).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn set_string_with_ttl_expires() {
        let bus = InMemoryBus::new();
        bus.set_string("aircraft:current:a0b1c2", "{}", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bus.get_string("aircraft:current:a0b1c2").await.unwrap(), None);
    }
}
