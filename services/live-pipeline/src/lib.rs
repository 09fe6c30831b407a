//! The live-state pipeline: subscribes to the raw surveillance feed,
//! maintains the in-memory state-vector cache, and fans out coordinate and
//! altitude updates plus gated rows for the history engine.
//!
//! Generalises a reader-to-client fan-out — one task reading a transport
//! and forwarding typed messages to a worker that persists and
//! re-broadcasts them — from a pool of raw TCP readers to a single bus
//! subscription over the raw feed pattern.

pub mod aircraft_info;
pub mod rate_limit;

use std::sync::Arc;
use std::time::Duration;

use tangram_bus::Bus;
use tangram_history::HistoryRow;
use tangram_protocol::{AltitudeUpdate, CoordinateUpdate, RawRecord};
use tangram_state::{StateStore, StateVector};
use tracing::{debug, warn};

pub use aircraft_info::{AircraftInfo, AircraftInfoLookup, NoopAircraftInfoLookup};

/// Tuning knobs for one pipeline instance. Defaults match the upstream
/// Python config dataclasses this was ported from.
pub struct LivePipelineConfig {
    pub raw_feed_pattern: String,
    pub history_table: String,
    pub state_ttl: Duration,
    pub history_write_interval: Duration,
    pub geo_ttl: Duration,
}

impl Default for LivePipelineConfig {
    fn default() -> Self {
        LivePipelineConfig {
            raw_feed_pattern: "jet1090-full*".to_owned(),
            history_table: "jet1090".to_owned(),
            state_ttl: Duration::from_secs(600),
            history_write_interval: Duration::from_secs(60),
            geo_ttl: Duration::from_secs(60),
        }
    }
}

/// Runs the pipeline until the bus subscription ends (the bus is dropped or
/// disconnected). Intended to be raced against a shutdown signal by the
/// caller.
pub async fn run<B: Bus + Clone>(
    bus: B,
    store: Arc<StateStore>,
    lookup: Arc<dyn AircraftInfoLookup>,
    config: LivePipelineConfig,
) {
    let mut subscription = match bus.subscribe(&[config.raw_feed_pattern.clone()]).await {
        Ok(sub) => sub,
        Err(error) => {
            tracing::error!(%error, "failed to subscribe to raw feed");
            return;
        }
    };

    while let Some(message) = subscription.recv().await {
        let record: RawRecord = match serde_json::from_str(&message.payload) {
            Ok(record) => record,
            Err(error) => {
                debug!(%error, channel = %message.channel, "dropping malformed raw record");
                continue;
            }
        };
        process_record(&bus, &store, lookup.as_ref(), &config, record).await;
    }
}

async fn process_record<B: Bus>(
    bus: &B,
    store: &StateStore,
    lookup: &dyn AircraftInfoLookup,
    config: &LivePipelineConfig,
    record: RawRecord,
) {
    let identifier = record.icao24.clone();

    let mut sv = match store.get(&identifier).await {
        Some(sv) => sv,
        None => {
            let mut sv = StateVector::new(identifier.clone(), record.timestamp);
            if let Some(info) = lookup.lookup(&identifier) {
                sv.registration = info.registration;
                sv.typecode = info.typecode;
            }
            sv
        }
    };

    if record.timestamp < sv.last_seen {
        debug!(identifier = %identifier, "dropping record older than last_seen");
        return;
    }

    sv.last_seen = record.timestamp;
    if record.callsign.is_some() {
        sv.callsign = record.callsign.clone();
    }
    if record.latitude.is_some() {
        sv.latitude = record.latitude;
    }
    if record.longitude.is_some() {
        sv.longitude = record.longitude;
    }
    if record.altitude.is_some() {
        sv.altitude = record.altitude;
    }
    if record.track.is_some() {
        sv.track = record.track;
    }

    store.put(sv.clone()).await;

    if let Some(altitude) = record.altitude {
        publish_json(
            bus,
            "altitude",
            &AltitudeUpdate {
                icao24: identifier.clone(),
                timestamp: record.timestamp,
                altitude,
            },
        )
        .await;
    }

    if let (Some(latitude), Some(longitude)) = (record.latitude, record.longitude) {
        publish_json(
            bus,
            "coordinate",
            &CoordinateUpdate {
                icao24: identifier.clone(),
                timestamp: record.timestamp,
                latitude,
                longitude,
            },
        )
        .await;
        if let Err(error) = bus
            .geo_add("planes", &identifier, longitude, latitude, config.geo_ttl)
            .await
        {
            warn!(%error, identifier = %identifier, "failed to refresh geospatial index");
        }
    }

    if sv.has_position() {
        let last_write = store.get_last_write(&identifier).await.unwrap_or(0.0);
        if record.timestamp - last_write >= config.history_write_interval.as_secs_f64() {
            let row = HistoryRow {
                identifier: identifier.clone(),
                timestamp_ms: (record.timestamp * 1000.0) as i64,
                latitude: sv.latitude.expect("has_position guarantees latitude"),
                longitude: sv.longitude.expect("has_position guarantees longitude"),
                altitude: sv.altitude,
                callsign: sv.callsign.clone(),
                track: sv.track,
            };
            let topic = format!("history:rows:{}", config.history_table);
            publish_json(bus, &topic, &row).await;
            store.set_last_write(&identifier, record.timestamp).await;
        }
    }
}

async fn publish_json<B: Bus, T: serde::Serialize>(bus: &B, topic: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(payload) => {
            if let Err(error) = bus.publish(topic, &payload).await {
                warn!(%error, topic, "failed to publish update");
            }
        }
        Err(error) => warn!(%error, topic, "failed to serialize update"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tangram_bus::InMemoryBus;

    fn record(icao24: &str, ts: f64) -> RawRecord {
        RawRecord {
            icao24: icao24.to_owned(),
            timestamp: ts,
            registration: None,
            typecode: None,
            callsign: None,
            latitude: None,
            longitude: None,
            altitude: None,
            track: None,
        }
    }

    #[tokio::test]
    async fn position_update_publishes_coordinate_and_refreshes_geoset() {
        let bus = InMemoryBus::new();
        let store = StateStore::new(Duration::from_secs(600));
        let mut coord_sub = bus.subscribe(&["coordinate".to_owned()]).await.unwrap();

        let config = LivePipelineConfig::default();
        let mut rec = record("a0b1c2", 1_700_000_000.0);
        rec.latitude = Some(43.5);
        rec.longitude = Some(1.47);

        process_record(&bus, &store, &NoopAircraftInfoLookup, &config, rec).await;

        let published = coord_sub.recv().await.unwrap();
        assert!(published.payload.contains("a0b1c2"));

        let hits = bus.geo_search("planes", 1.47, 43.5, 1.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].member, "a0b1c2");
    }

    #[tokio::test]
    async fn altitude_only_record_does_not_publish_coordinate() {
        let bus = InMemoryBus::new();
        let store = StateStore::new(Duration::from_secs(600));
        let mut coord_sub = bus.subscribe(&["coordinate".to_owned()]).await.unwrap();

        let config = LivePipelineConfig::default();
        let mut rec = record("a0b1c2", 1_700_000_000.0);
        rec.altitude = Some(32000.0);

        process_record(&bus, &store, &NoopAircraftInfoLookup, &config, rec).await;

        assert!(tokio::time::timeout(Duration::from_millis(20), coord_sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn record_older_than_last_seen_is_dropped() {
        let bus = InMemoryBus::new();
        let store = StateStore::new(Duration::from_secs(600));
        let config = LivePipelineConfig::default();

        let mut first = record("a0b1c2", 1_700_000_100.0);
        first.latitude = Some(43.5);
        first.longitude = Some(1.47);
        process_record(&bus, &store, &NoopAircraftInfoLookup, &config, first).await;

        let mut stale = record("a0b1c2", 1_700_000_000.0);
        stale.latitude = Some(10.0);
        stale.longitude = Some(10.0);
        process_record(&bus, &store, &NoopAircraftInfoLookup, &config, stale).await;

        let sv = store.get("a0b1c2").await.unwrap();
        assert_eq!(sv.last_seen, 1_700_000_100.0);
        assert_eq!(sv.latitude, Some(43.5));
    }

    #[tokio::test]
    async fn position_with_elapsed_write_interval_enqueues_history_row() {
        let bus = InMemoryBus::new();
        let store = StateStore::new(Duration::from_secs(600));
        let config = LivePipelineConfig::default();
        let mut history_sub = bus.subscribe(&["history:rows:jet1090".to_owned()]).await.unwrap();

        let mut rec = record("a0b1c2", 1_700_000_000.0);
        rec.latitude = Some(43.5);
        rec.longitude = Some(1.47);
        process_record(&bus, &store, &NoopAircraftInfoLookup, &config, rec).await;

        let row = history_sub.recv().await.unwrap();
        assert!(row.payload.contains("a0b1c2"));
        assert_eq!(store.get_last_write("a0b1c2").await, Some(1_700_000_000.0));
    }

    #[tokio::test]
    async fn second_position_within_write_interval_does_not_re_enqueue() {
        let bus = InMemoryBus::new();
        let store = StateStore::new(Duration::from_secs(600));
        let config = LivePipelineConfig::default();
        let mut history_sub = bus.subscribe(&["history:rows:jet1090".to_owned()]).await.unwrap();

        let mut first = record("a0b1c2", 1_700_000_000.0);
        first.latitude = Some(43.5);
        first.longitude = Some(1.47);
        process_record(&bus, &store, &NoopAircraftInfoLookup, &config, first).await;
        history_sub.recv().await.unwrap();

        let mut second = record("a0b1c2", 1_700_000_010.0);
        second.latitude = Some(43.6);
        second.longitude = Some(1.48);
        process_record(&bus, &store, &NoopAircraftInfoLookup, &config, second).await;

        assert!(tokio::time::timeout(Duration::from_millis(20), history_sub.recv())
            .await
            .is_err());
    }
}
