use chrono::{DateTime, Utc};
use model::{position::PositionSample, Coordinate};
use serde::Serialize;
use utility::serde::timestamp;

/// A change of the displayed vehicle marker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkerUpdate {
    pub position: Coordinate,
    /// Heading from the previously displayed position; `None` for the
    /// first position of a session.
    pub bearing: Option<f64>,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

/// Jitter filter for the displayed marker. Samples closer than the
/// threshold to the displayed position do not move it.
#[derive(Debug, Clone)]
pub struct MarkerTracker {
    jitter_threshold_m: f64,
    displayed: Option<Coordinate>,
}

impl MarkerTracker {
    pub fn new(jitter_threshold_m: f64) -> Self {
        Self {
            jitter_threshold_m,
            displayed: None,
        }
    }

    pub fn displayed(&self) -> Option<Coordinate> {
        self.displayed
    }

    pub fn advance(&mut self, sample: &PositionSample) -> Option<MarkerUpdate> {
        let position = sample.position();
        let bearing = match self.displayed {
            None => None,
            Some(displayed) if displayed.distance_to(&position) < self.jitter_threshold_m => {
                return None;
            }
            Some(displayed) => Some(displayed.bearing_to(&position)),
        };
        self.displayed = Some(position);
        Some(MarkerUpdate {
            position,
            bearing,
            timestamp: sample.timestamp,
        })
    }

    pub fn reset(&mut self) {
        self.displayed = None;
    }
}
