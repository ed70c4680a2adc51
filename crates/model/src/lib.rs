use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::geo;

pub mod position;
pub mod route;
pub mod shipment;

pub trait ExampleData {
    fn example_data() -> Self;
}

/// A point on the earth's surface, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Coordinate {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Both components finite and not the `(0, 0)` placeholder that
    /// positioning APIs report before they have a fix.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite() && !(self.lat == 0.0 && self.lng == 0.0)
    }

    /// Distance in meters.
    pub fn distance_to(&self, other: &Coordinate) -> f64 {
        geo::haversine_distance(self.lat, self.lng, other.lat, other.lng)
    }

    /// Bearing in degrees within `[0, 360)`.
    pub fn bearing_to(&self, other: &Coordinate) -> f64 {
        geo::bearing(self.lat, self.lng, other.lat, other.lng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_island_and_non_finite_coordinates_are_invalid() {
        assert!(!Coordinate::new(0.0, 0.0).is_valid());
        assert!(!Coordinate::new(f64::NAN, 121.0).is_valid());
        assert!(!Coordinate::new(14.0, f64::INFINITY).is_valid());
        assert!(Coordinate::new(0.0, 121.0).is_valid());
        assert!(Coordinate::new(14.6, 121.0).is_valid());
    }
}
