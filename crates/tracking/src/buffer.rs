use std::collections::HashMap;

use model::{position::PositionSample, shipment::ShipmentId};
use tokio::sync::Mutex;

/// Holds the most recent update of every shipment nobody is watching. One
/// slot per shipment: a newer update replaces the held one.
#[derive(Debug, Default)]
pub struct UpdateBuffer {
    slots: Mutex<HashMap<ShipmentId, PositionSample>>,
}

impl UpdateBuffer {
    /// Returns the update that was replaced, if any.
    pub async fn push(&self, sample: PositionSample) -> Option<PositionSample> {
        self.slots
            .lock()
            .await
            .insert(sample.shipment_id.clone(), sample)
    }

    pub async fn drain(&self, shipment_id: &ShipmentId) -> Option<PositionSample> {
        self.slots.lock().await.remove(shipment_id)
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.slots.lock().await.is_empty()
    }
}
