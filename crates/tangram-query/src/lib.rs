//! Read-side query façade: trajectory-by-id-and-time-window, free-text
//! search with flight segmentation, and near-point lookup.
//!
//! Trajectory and search both run against a [`tangram_history::Table`]'s
//! active Parquet files through DataFusion; near-point lookup delegates
//! straight to the geospatial index on the [`tangram_bus::Bus`].

use arrow::array::Array;
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use tangram_bus::{Bus, BusError, GeoMember};
use tangram_history::{HistoryError, HistoryRow, Table};

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error("datafusion error: {0}")]
    DataFusion(#[from] datafusion::error::DataFusionError),
}

/// One aggregated segment of continuous flight, emitted by [`search`].
#[derive(Debug, Clone, PartialEq)]
pub struct FlightSegment {
    pub identifier: String,
    pub callsign: Option<String>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub row_count: usize,
    pub mean_lat: f64,
    pub mean_lon: f64,
    pub duration_s: f64,
}

/// A new segment starts whenever consecutive points are at least this far
/// apart, or the (forward-filled) callsign changes.
const SEGMENT_GAP_MS: i64 = 30 * 60 * 1000;
const MIN_SEGMENT_ROWS: usize = 5;

async fn session_over(table: &Table) -> Result<SessionContext, QueryError> {
    let ctx = SessionContext::new();
    let glob = format!("{}/*.parquet", table.table_dir().display());
    ctx.register_parquet("t", &glob, ParquetReadOptions::default()).await?;
    Ok(ctx)
}

/// Scans `table` for rows with the given `identifier` inside
/// `[start_ms, end_ms]` (inclusive), ascending by timestamp.
pub async fn trajectory(
    table: &Table,
    identifier: &str,
    start_ms: i64,
    end_ms: i64,
) -> Result<Vec<HistoryRow>, QueryError> {
    if table.current_state()?.active_files.is_empty() {
        return Ok(Vec::new());
    }
    let ctx = session_over(table).await?;
    let escaped = identifier.replace('\'', "''");
    let sql = format!(
        "SELECT identifier, timestamp_ms, latitude, longitude, altitude, callsign, track \
         FROM t WHERE identifier = '{escaped}' AND timestamp_ms BETWEEN {start_ms} AND {end_ms} \
         ORDER BY timestamp_ms ASC"
    );
    let batches = ctx.sql(&sql).await?.collect().await?;
    Ok(batches.iter().flat_map(batch_to_rows).collect())
}

/// Lowercases `query`, finds identifiers whose callsign or hex identifier
/// substring-matches it, then splits each candidate's points into flight
/// segments and aggregates them. Segments with fewer than 5 rows are
/// dropped; the rest are ordered by `start_ts` descending.
pub async fn search(table: &Table, query: &str) -> Result<Vec<FlightSegment>, QueryError> {
    if table.current_state()?.active_files.is_empty() {
        return Ok(Vec::new());
    }
    let needle = query.to_lowercase().replace('\'', "''");
    let ctx = session_over(table).await?;
    let candidates_sql = format!(
        "SELECT DISTINCT identifier FROM t \
         WHERE lower(identifier) LIKE '%{needle}%' OR lower(callsign) LIKE '%{needle}%'"
    );
    let candidate_batches = ctx.sql(&candidates_sql).await?.collect().await?;
    let mut identifiers = Vec::new();
    for batch in &candidate_batches {
        let col = batch
            .column_by_name("identifier")
            .and_then(|c| c.as_any().downcast_ref::<arrow::array::StringArray>())
            .ok_or_else(|| datafusion::error::DataFusionError::Internal("missing identifier column".into()))?;
        for i in 0..col.len() {
            if !col.is_null(i) {
                identifiers.push(col.value(i).to_owned());
            }
        }
    }

    let mut segments = Vec::new();
    for identifier in identifiers {
        let escaped = identifier.replace('\'', "''");
        let rows_sql = format!(
            "SELECT identifier, timestamp_ms, latitude, longitude, altitude, callsign, track \
             FROM t WHERE identifier = '{escaped}' ORDER BY timestamp_ms ASC"
        );
        let batches = ctx.sql(&rows_sql).await?.collect().await?;
        let rows: Vec<HistoryRow> = batches.iter().flat_map(batch_to_rows).collect();
        segments.extend(segment_rows(rows));
    }
    segments.retain(|s| s.row_count >= MIN_SEGMENT_ROWS);
    segments.sort_by(|a, b| b.start_ts.cmp(&a.start_ts));
    Ok(segments)
}

/// Forward-fills callsign within an id, then splits into segments wherever
/// the timestamp gap is at least [`SEGMENT_GAP_MS`] or the callsign
/// changes, and aggregates each segment.
fn segment_rows(mut rows: Vec<HistoryRow>) -> Vec<FlightSegment> {
    if rows.is_empty() {
        return Vec::new();
    }
    let mut last_callsign: Option<String> = None;
    for row in &mut rows {
        if row.callsign.is_some() {
            last_callsign.clone_from(&row.callsign);
        } else {
            row.callsign.clone_from(&last_callsign);
        }
    }

    let mut segments = Vec::new();
    let mut current: Vec<&HistoryRow> = vec![&rows[0]];
    for pair in rows.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let gap = next.timestamp_ms - prev.timestamp_ms;
        let callsign_changed = next.callsign != prev.callsign;
        if gap >= SEGMENT_GAP_MS || callsign_changed {
            segments.push(aggregate_segment(&current));
            current = vec![next];
        } else {
            current.push(next);
        }
    }
    segments.push(aggregate_segment(&current));
    segments
}

fn aggregate_segment(rows: &[&HistoryRow]) -> FlightSegment {
    let row_count = rows.len();
    let start_ts = rows.first().map(|r| r.timestamp_ms).unwrap_or_default();
    let end_ts = rows.last().map(|r| r.timestamp_ms).unwrap_or_default();
    let mean_lat = rows.iter().map(|r| r.latitude).sum::<f64>() / row_count as f64;
    let mean_lon = rows.iter().map(|r| r.longitude).sum::<f64>() / row_count as f64;
    FlightSegment {
        identifier: rows[0].identifier.clone(),
        callsign: rows[0].callsign.clone(),
        start_ts,
        end_ts,
        row_count,
        mean_lat,
        mean_lon,
        duration_s: (end_ts - start_ts) as f64 / 1000.0,
    }
}

fn batch_to_rows(batch: &arrow::record_batch::RecordBatch) -> Vec<HistoryRow> {
    use arrow::array::{Float64Array, Int64Array, StringArray};

    let identifier = batch.column(0).as_any().downcast_ref::<StringArray>();
    let timestamp_ms = batch.column(1).as_any().downcast_ref::<Int64Array>();
    let latitude = batch.column(2).as_any().downcast_ref::<Float64Array>();
    let longitude = batch.column(3).as_any().downcast_ref::<Float64Array>();
    let altitude = batch.column(4).as_any().downcast_ref::<Float64Array>();
    let callsign = batch.column(5).as_any().downcast_ref::<StringArray>();
    let track = batch.column(6).as_any().downcast_ref::<Float64Array>();

    let (Some(identifier), Some(timestamp_ms), Some(latitude), Some(longitude), Some(altitude), Some(callsign), Some(track)) =
        (identifier, timestamp_ms, latitude, longitude, altitude, callsign, track)
    else {
        return Vec::new();
    };

    (0..batch.num_rows())
        .map(|i| HistoryRow {
            identifier: identifier.value(i).to_owned(),
            timestamp_ms: timestamp_ms.value(i),
            latitude: latitude.value(i),
            longitude: longitude.value(i),
            altitude: (!altitude.is_null(i)).then(|| altitude.value(i)),
            callsign: (!callsign.is_null(i)).then(|| callsign.value(i).to_owned()),
            track: (!track.is_null(i)).then(|| track.value(i)),
        })
        .collect()
}

/// Finds members of `key`'s geoset within `radius_km` of `(longitude,
/// latitude)`. A thin, typed wrapper so callers import `tangram_query`
/// rather than reaching into `tangram_bus` directly for this one call.
pub async fn near_point<B: Bus>(
    bus: &B,
    key: &str,
    longitude: f64,
    latitude: f64,
    radius_km: f64,
) -> Result<Vec<GeoMember>, BusError> {
    bus.geo_search(key, longitude, latitude, radius_km).await
}
