use std::collections::HashMap;

use async_trait::async_trait;
use model::shipment::{ShipmentEndpoints, ShipmentId};
use tokio::sync::RwLock;

/// Booking-side lookup of a shipment's pickup and drop-off points.
#[async_trait]
pub trait ShipmentDirectory: Send + Sync {
    async fn endpoints(&self, shipment_id: &ShipmentId) -> Option<ShipmentEndpoints>;
}

#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    shipments: RwLock<HashMap<ShipmentId, ShipmentEndpoints>>,
}

impl InMemoryDirectory {
    /// Returns the endpoints previously registered for the shipment.
    pub async fn register(
        &self,
        shipment_id: ShipmentId,
        endpoints: ShipmentEndpoints,
    ) -> Option<ShipmentEndpoints> {
        self.shipments.write().await.insert(shipment_id, endpoints)
    }

    pub async fn remove(&self, shipment_id: &ShipmentId) -> Option<ShipmentEndpoints> {
        self.shipments.write().await.remove(shipment_id)
    }
}

#[async_trait]
impl ShipmentDirectory for InMemoryDirectory {
    async fn endpoints(&self, shipment_id: &ShipmentId) -> Option<ShipmentEndpoints> {
        self.shipments.read().await.get(shipment_id).copied()
    }
}
