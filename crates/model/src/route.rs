use chrono::{DateTime, Utc};
use itertools::Itertools;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::serde::timestamp;

use crate::{shipment::ShipmentId, Coordinate};

/// A routed path for one shipment, ordered from where the vehicle was when
/// the path was fetched towards the destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoutePath {
    pub shipment_id: ShipmentId,
    pub waypoints: Vec<Coordinate>,
    /// Position used as the origin of the fetch. Drift away from this point
    /// decides when the path is refetched.
    pub reference_start: Coordinate,
    pub destination: Coordinate,
    #[serde(with = "timestamp")]
    #[schemars(with = "i64")]
    pub fetched_at: DateTime<Utc>,
    /// Set when the routing service failed and the path is a straight line.
    pub fallback: bool,
}

impl RoutePath {
    pub fn straight_line(
        shipment_id: ShipmentId,
        origin: Coordinate,
        destination: Coordinate,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            shipment_id,
            waypoints: vec![origin, destination],
            reference_start: origin,
            destination,
            fetched_at,
            fallback: true,
        }
    }

    /// Total length in meters.
    pub fn length(&self) -> f64 {
        segment_length(&self.waypoints)
    }

    /// Length in meters from waypoint `index` to the end of the path.
    pub fn length_from(&self, index: usize) -> f64 {
        self.waypoints
            .get(index..)
            .map(segment_length)
            .unwrap_or(0.0)
    }
}

fn segment_length(points: &[Coordinate]) -> f64 {
    points
        .iter()
        .tuple_windows()
        .map(|(a, b)| a.distance_to(b))
        .sum()
}
