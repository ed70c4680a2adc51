use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use utility::id::{HasId, Id};

use crate::{Coordinate, ExampleData};

/// A booked freight movement. Only its identity and endpoints matter to
/// tracking; everything else belongs to the booking system.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Shipment;

impl HasId for Shipment {
    type IdType = String;
}

pub type ShipmentId = Id<Shipment>;

/// A consumer watching shipments, e.g. one dispatcher's map view.
#[derive(Debug, Clone)]
pub struct Observer;

impl HasId for Observer {
    type IdType = u64;
}

pub type ObserverId = Id<Observer>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ShipmentEndpoints {
    /// Pickup location.
    pub origin: Coordinate,
    /// Drop-off location.
    pub destination: Coordinate,
}

impl ExampleData for ShipmentEndpoints {
    fn example_data() -> Self {
        Self {
            origin: Coordinate::new(14.5995, 120.9842),
            destination: Coordinate::new(14.6760, 121.0437),
        }
    }
}

/// Links an observer to the single shipment it currently watches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub observer_id: ObserverId,
    pub shipment_id: ShipmentId,
}
