use chrono::{DateTime, TimeZone as _, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::serde::timestamp;

use crate::{shipment::ShipmentId, Coordinate, ExampleData};

/// Where a sample entered this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    /// Produced locally by a positioning capability.
    Device,
    /// Live update received over a transport channel.
    Channel,
    /// Part of the snapshot sent when a channel opens.
    Snapshot,
    /// Written through the HTTP fallback endpoint.
    Http,
}

/// One timestamped reading for a shipment. Samples are never mutated, a
/// newer sample supersedes an older one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub shipment_id: ShipmentId,
    pub lat: f64,
    pub lng: f64,
    #[serde(with = "timestamp")]
    #[schemars(with = "i64")]
    pub timestamp: DateTime<Utc>,
    pub source: SampleSource,
}

impl PositionSample {
    /// Builds a sample, stamping it with `arrived_at` when the producer did
    /// not supply a timestamp. Returns `None` for invalid coordinates.
    pub fn new(
        shipment_id: ShipmentId,
        position: Coordinate,
        timestamp: Option<DateTime<Utc>>,
        arrived_at: DateTime<Utc>,
        source: SampleSource,
    ) -> Option<Self> {
        if !position.is_valid() {
            return None;
        }
        Some(Self {
            shipment_id,
            lat: position.lat,
            lng: position.lng,
            timestamp: timestamp.unwrap_or(arrived_at),
            source,
        })
    }

    pub fn position(&self) -> Coordinate {
        Coordinate::new(self.lat, self.lng)
    }

    pub fn is_older_than(&self, other: &PositionSample) -> bool {
        self.timestamp < other.timestamp
    }
}

impl ExampleData for PositionSample {
    fn example_data() -> Self {
        Self {
            shipment_id: "SHP-1042".into(),
            lat: 14.5995,
            lng: 120.9842,
            timestamp: Utc
                .timestamp_millis_opt(1_700_000_000_000)
                .single()
                .unwrap_or_default(),
            source: SampleSource::Channel,
        }
    }
}
