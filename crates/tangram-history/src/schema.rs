//! The history row type and its Arrow schema.

use std::sync::Arc;

use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

/// One row of trajectory history. Crosses the wire from the live-state
/// pipeline to the history engine as JSON on a `history:rows:<table>` bus
/// topic, so it carries `serde` derives in addition to its Arrow mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub identifier: String,
    pub timestamp_ms: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<f64>,
    pub callsign: Option<String>,
    pub track: Option<f64>,
}

/// The Arrow schema every data file in a history table shares.
pub fn history_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("identifier", DataType::Utf8, false),
        Field::new("timestamp_ms", DataType::Int64, false),
        Field::new("latitude", DataType::Float64, false),
        Field::new("longitude", DataType::Float64, false),
        Field::new("altitude", DataType::Float64, true),
        Field::new("callsign", DataType::Utf8, true),
        Field::new("track", DataType::Float64, true),
    ]))
}

/// Builds a single `RecordBatch` from a buffer of rows, in order.
pub fn rows_to_batch(rows: &[HistoryRow]) -> Result<RecordBatch, arrow::error::ArrowError> {
    let schema = history_schema();
    let identifier: StringArray = rows.iter().map(|r| Some(r.identifier.as_str())).collect();
    let timestamp_ms: Int64Array = rows.iter().map(|r| Some(r.timestamp_ms)).collect();
    let latitude: Float64Array = rows.iter().map(|r| Some(r.latitude)).collect();
    let longitude: Float64Array = rows.iter().map(|r| Some(r.longitude)).collect();
    let altitude: Float64Array = rows.iter().map(|r| r.altitude).collect();
    let callsign: StringArray = rows.iter().map(|r| r.callsign.as_deref()).collect();
    let track: Float64Array = rows.iter().map(|r| r.track).collect();

    RecordBatch::try_new(
        schema,
        vec![
            Arc::new(identifier),
            Arc::new(timestamp_ms),
            Arc::new(latitude),
            Arc::new(longitude),
            Arc::new(altitude),
            Arc::new(callsign),
            Arc::new(track),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_to_batch_preserves_row_count_and_nulls() {
        let rows = vec![
            HistoryRow {
                identifier: "a0b1c2".to_owned(),
                timestamp_ms: 1_700_000_000_000,
                latitude: 43.5,
                longitude: 1.47,
                altitude: Some(32000.0),
                callsign: None,
                track: None,
            },
            HistoryRow {
                identifier: "a0b1c2".to_owned(),
                timestamp_ms: 1_700_000_030_000,
                latitude: 43.6,
                longitude: 1.48,
                altitude: None,
                callsign: Some("AFR123".to_owned()),
                track: Some(90.0),
            },
        ];
        let batch = rows_to_batch(&rows).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.schema(), history_schema());
    }
}
