use std::collections::HashMap;

use model::{position::PositionSample, route::RoutePath, shipment::ShipmentId, Coordinate};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Eta {
    pub seconds: f64,
    pub speed_mps: f64,
    pub remaining_m: f64,
}

impl Eta {
    /// `None` unless the result is a positive, finite duration.
    pub fn from_parts(remaining_m: f64, speed_mps: f64) -> Option<Self> {
        if !speed_mps.is_finite() || speed_mps <= 0.0 {
            return None;
        }
        let seconds = remaining_m / speed_mps;
        (seconds.is_finite() && seconds > 0.0).then_some(Self {
            seconds,
            speed_mps,
            remaining_m,
        })
    }

    pub fn rounded_minutes(&self) -> i64 {
        (self.seconds / 60.0).round() as i64
    }
}

/// Distance left along `path` for a vehicle at `position`.
///
/// The walk starts at the first waypoint within `match_radius_m` of the
/// vehicle. When no waypoint is that close the whole path counts as
/// remaining; paths are refetched from the vehicle's position once it
/// drifts away, so the path start is never far behind the vehicle.
pub fn remaining_distance(path: &RoutePath, position: &Coordinate, match_radius_m: f64) -> f64 {
    path.waypoints
        .iter()
        .position(|waypoint| waypoint.distance_to(position) <= match_radius_m)
        .map(|index| path.length_from(index))
        .unwrap_or_else(|| path.length())
}

#[derive(Debug)]
struct EtaTrack {
    previous: PositionSample,
    last: Option<Eta>,
}

/// Derives speed from consecutive samples of a shipment and turns the
/// remaining path distance into an ETA.
#[derive(Debug)]
pub struct EtaEstimator {
    match_radius_m: f64,
    tracks: HashMap<ShipmentId, EtaTrack>,
}

impl EtaEstimator {
    pub fn new(match_radius_m: f64) -> Self {
        Self {
            match_radius_m,
            tracks: HashMap::new(),
        }
    }

    /// Feeds the next sample. Returns a fresh ETA, or `None` when this
    /// sample cannot produce one; the last ETA then stays in effect.
    pub fn update(&mut self, sample: &PositionSample, path: Option<&RoutePath>) -> Option<Eta> {
        let Some(track) = self.tracks.get_mut(&sample.shipment_id) else {
            self.tracks.insert(
                sample.shipment_id.clone(),
                EtaTrack {
                    previous: sample.clone(),
                    last: None,
                },
            );
            return None;
        };

        let dt = (sample.timestamp - track.previous.timestamp).num_milliseconds() as f64 / 1000.0;
        if dt <= 0.0 {
            log::trace!("skipping ETA for {}: dt = {dt}", sample.shipment_id);
            return None;
        }
        let speed = track.previous.position().distance_to(&sample.position()) / dt;
        track.previous = sample.clone();

        let remaining = remaining_distance(path?, &sample.position(), self.match_radius_m);
        let eta = Eta::from_parts(remaining, speed)?;
        track.last = Some(eta);
        Some(eta)
    }

    pub fn last(&self, shipment_id: &ShipmentId) -> Option<Eta> {
        self.tracks.get(shipment_id).and_then(|track| track.last)
    }

    pub fn forget(&mut self, shipment_id: &ShipmentId) {
        self.tracks.remove(shipment_id);
    }
}
