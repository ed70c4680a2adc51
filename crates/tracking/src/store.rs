use std::collections::HashMap;

use model::{position::PositionSample, shipment::ShipmentId};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorePolicy {
    /// Every sample replaces the stored one.
    #[default]
    LastWriterWins,
    /// Samples strictly older than the stored one are ignored.
    IgnoreOlder,
}

/// Latest known position per shipment.
#[derive(Debug, Default)]
pub struct PositionStore {
    entries: RwLock<HashMap<ShipmentId, PositionSample>>,
    policy: StorePolicy,
}

impl PositionStore {
    pub fn new(policy: StorePolicy) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Stores `sample` as the latest position of its shipment. Returns
    /// whether the sample was applied.
    pub async fn set(&self, sample: PositionSample) -> bool {
        let mut entries = self.entries.write().await;
        if self.policy == StorePolicy::IgnoreOlder {
            if let Some(stored) = entries.get(&sample.shipment_id) {
                if sample.is_older_than(stored) {
                    return false;
                }
            }
        }
        entries.insert(sample.shipment_id.clone(), sample);
        true
    }

    pub async fn get(&self, shipment_id: &ShipmentId) -> Option<PositionSample> {
        self.entries.read().await.get(shipment_id).cloned()
    }

    pub async fn snapshot_all(&self) -> HashMap<ShipmentId, PositionSample> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use model::{position::SampleSource, Coordinate};

    use super::*;

    fn sample(shipment: &str, lat: f64, millis: i64) -> PositionSample {
        let at: DateTime<Utc> = Utc.timestamp_millis_opt(millis).unwrap();
        PositionSample::new(
            shipment.into(),
            Coordinate::new(lat, 121.0),
            Some(at),
            at,
            SampleSource::Channel,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn last_writer_wins_regardless_of_timestamps() {
        let store = PositionStore::default();
        let samples = [
            sample("S", 14.1, 3_000),
            sample("S", 14.2, 1_000),
            sample("S", 14.3, 2_000),
        ];
        for s in samples.iter().cloned() {
            assert!(store.set(s).await);
        }
        assert_eq!(store.get(&"S".into()).await, Some(samples[2].clone()));
    }

    #[tokio::test]
    async fn ignore_older_policy_keeps_the_newest() {
        let store = PositionStore::new(StorePolicy::IgnoreOlder);
        assert!(store.set(sample("S", 14.1, 2_000)).await);
        assert!(!store.set(sample("S", 14.2, 1_000)).await);
        assert!(store.set(sample("S", 14.3, 2_000)).await);
        assert_eq!(store.get(&"S".into()).await.map(|s| s.lat), Some(14.3));
    }

    #[tokio::test]
    async fn snapshot_holds_one_entry_per_shipment() {
        let store = PositionStore::default();
        store.set(sample("A", 14.1, 1)).await;
        store.set(sample("B", 14.2, 1)).await;
        store.set(sample("A", 14.3, 2)).await;

        let snapshot = store.snapshot_all().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[&ShipmentId::from("A")].lat, 14.3);
        assert_eq!(store.get(&"C".into()).await, None);
    }
}
