//! The in-memory state vector store: one record per tracked object, with
//! TTL-based eviction and the derived "last history write" timestamp used
//! to throttle history writes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

/// One tracked object's latest known attributes.
///
/// Invariants: `last_seen >= first_seen`; if `latitude` is `Some`,
/// `longitude` is also `Some`. Callers (the live-state pipeline) are
/// responsible for upholding these when constructing and merging updates —
/// the store itself does not reject a vector that violates them, matching
/// its role as a plain cache rather than a validator.
#[derive(Debug, Clone, PartialEq)]
pub struct StateVector {
    pub icao24: String,
    pub registration: Option<String>,
    pub typecode: Option<String>,
    pub callsign: Option<String>,
    pub first_seen: f64,
    pub last_seen: f64,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub track: Option<f64>,
}

impl StateVector {
    pub fn new(icao24: impl Into<String>, now: f64) -> Self {
        StateVector {
            icao24: icao24.into(),
            registration: None,
            typecode: None,
            callsign: None,
            first_seen: now,
            last_seen: now,
            latitude: None,
            longitude: None,
            altitude: None,
            track: None,
        }
    }

    pub fn has_position(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }
}

struct Entry {
    sv: StateVector,
    last_write: Option<f64>,
    expires_at: Instant,
}

/// The shared state-vector cache. Passed explicitly (as an `Arc`) to every
/// task that needs it — never reached through a global.
pub struct StateStore {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl StateStore {
    pub fn new(default_ttl: Duration) -> Arc<Self> {
        Arc::new(StateStore {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        })
    }

    /// Fetch a copy of the current state vector, if present and unexpired.
    pub async fn get(&self, icao24: &str) -> Option<StateVector> {
        let entries = self.entries.read().await;
        let entry = entries.get(icao24)?;
        if entry.expires_at <= Instant::now() {
            return None;
        }
        Some(entry.sv.clone())
    }

    /// Insert or replace the state vector for `sv.icao24`, resetting its TTL.
    pub async fn put(&self, sv: StateVector) {
        let mut entries = self.entries.write().await;
        let expires_at = Instant::now() + self.default_ttl;
        entries
            .entry(sv.icao24.clone())
            .and_modify(|e| {
                e.sv = sv.clone();
                e.expires_at = expires_at;
            })
            .or_insert(Entry {
                sv,
                last_write: None,
                expires_at,
            });
    }

    pub async fn get_last_write(&self, icao24: &str) -> Option<f64> {
        self.entries.read().await.get(icao24).and_then(|e| e.last_write)
    }

    pub async fn set_last_write(&self, icao24: &str, timestamp: f64) {
        if let Some(entry) = self.entries.write().await.get_mut(icao24) {
            entry.last_write = Some(timestamp);
        }
    }

    /// Evict entries whose TTL has elapsed. Returns the number evicted.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Spawns a background task that periodically sweeps expired entries.
/// Mirrors the repo's convention of modelling a recurring maintenance job
/// as its own task rather than folding it into the request path.
pub fn spawn_expiry_sweeper(store: Arc<StateStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let evicted = store.evict_expired().await;
            if evicted > 0 {
                tracing::debug!(evicted, "swept expired state vectors");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = StateStore::new(Duration::from_secs(600));
        let mut sv = StateVector::new("a0b1c2", 1_700_000_000.0);
        sv.latitude = Some(43.5);
        sv.longitude = Some(1.47);
        store.put(sv.clone()).await;
        let fetched = store.get("a0b1c2").await.unwrap();
        assert_eq!(fetched, sv);
    }

    #[tokio::test]
    async fn get_on_absent_id_returns_none() {
        let store = StateStore::new(Duration::from_secs(600));
        assert!(store.get("unknown").await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_is_not_returned() {
        let store = StateStore::new(Duration::from_millis(5));
        store.put(StateVector::new("a0b1c2", 0.0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.get("a0b1c2").await.is_none());
    }

    #[tokio::test]
    async fn last_write_tracking() {
        let store = StateStore::new(Duration::from_secs(600));
        store.put(StateVector::new("a0b1c2", 0.0)).await;
        assert_eq!(store.get_last_write("a0b1c2").await, None);
        store.set_last_write("a0b1c2", 1_700_000_000.0).await;
        assert_eq!(store.get_last_write("a0b1c2").await, Some(1_700_000_000.0));
    }

    #[tokio::test]
    async fn evict_expired_removes_only_stale_entries() {
        let store = StateStore::new(Duration::from_millis(5));
        store.put(StateVector::new("stale", 0.0)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        store.put(StateVector::new("fresh", 1.0)).await;
        let evicted = store.evict_expired().await;
        assert_eq!(evicted, 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("fresh").await.is_some());
    }
}
