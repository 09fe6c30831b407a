//! Optional downstream relay: re-publishes coordinate updates at most once
//! per identifier per interval, for consumers that don't need feed-rate
//! updates. Kept as a separate spawned task rather than folded into the
//! main pipeline loop, the same way the repo keeps each recurring job
//! (see `tangram_state::spawn_expiry_sweeper`) as its own task.

use std::collections::HashMap;
use std::time::Duration;

use tangram_bus::Bus;
use tangram_protocol::CoordinateUpdate;
use tokio::task::JoinHandle;
use tracing::warn;

pub const DEFAULT_LIMITING_INTERVAL: Duration = Duration::from_secs(5);

pub fn spawn_rate_limited_relay<B: Bus + Clone>(
    bus: B,
    source_topic: String,
    sink_topic: String,
    limiting_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut subscription = match bus.subscribe(&[source_topic.clone()]).await {
            Ok(sub) => sub,
            Err(error) => {
                warn!(%error, topic = %source_topic, "rate-limited relay failed to subscribe");
                return;
            }
        };
        let mut last_published: HashMap<String, f64> = HashMap::new();
        while let Some(message) = subscription.recv().await {
            let Ok(update) = serde_json::from_str::<CoordinateUpdate>(&message.payload) else {
                continue;
            };
            let due = last_published
                .get(&update.icao24)
                .is_none_or(|last| update.timestamp - *last >= limiting_interval.as_secs_f64());
            if !due {
                continue;
            }
            last_published.insert(update.icao24.clone(), update.timestamp);
            if let Ok(payload) = serde_json::to_string(&update) {
                let _ = bus.publish(&sink_topic, &payload).await;
            }
        }
    })
}
