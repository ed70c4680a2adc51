use std::{collections::HashMap, error::Error, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use model::{route::RoutePath, shipment::ShipmentId, Coordinate};
use tokio::{sync::RwLock, time::timeout};

/// The external routing collaborator.
#[async_trait]
pub trait RouteService: Send + Sync {
    /// Returns the routed waypoints from `origin` to `destination`, in
    /// `(lat, lng)` order.
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Vec<Coordinate>, Box<dyn Error + Send + Sync>>;
}

/// Routing for deployments without a routing service: always the direct line.
#[derive(Debug, Clone, Default)]
pub struct StraightLine;

#[async_trait]
impl RouteService for StraightLine {
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Vec<Coordinate>, Box<dyn Error + Send + Sync>> {
        Ok(vec![origin, destination])
    }
}

/// Routed paths per shipment.
///
/// A path stays cached while the vehicle is within the redraw threshold of
/// the position the path was fetched from. Routing failures never surface:
/// they degrade to a straight line between origin and destination. A routing
/// call that outlives the fetch timeout counts as a failure.
pub struct RoutePathCache {
    service: Arc<dyn RouteService>,
    paths: RwLock<HashMap<ShipmentId, RoutePath>>,
    redraw_threshold_m: f64,
    fetch_timeout: Duration,
}

impl RoutePathCache {
    pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(service: Arc<dyn RouteService>, redraw_threshold_m: f64) -> Self {
        Self {
            service,
            paths: RwLock::new(HashMap::new()),
            redraw_threshold_m,
            fetch_timeout: Self::DEFAULT_FETCH_TIMEOUT,
        }
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub async fn get(&self, shipment_id: &ShipmentId) -> Option<RoutePath> {
        self.paths.read().await.get(shipment_id).cloned()
    }

    /// Whether `path` is stale for a vehicle at `position` heading to
    /// `destination`.
    pub fn needs_refresh(
        &self,
        path: &RoutePath,
        position: &Coordinate,
        destination: &Coordinate,
    ) -> bool {
        path.destination != *destination
            || path.reference_start.distance_to(position) > self.redraw_threshold_m
    }

    pub async fn get_or_fetch(
        &self,
        shipment_id: &ShipmentId,
        origin: Coordinate,
        destination: Coordinate,
    ) -> RoutePath {
        if let Some(path) = self.get(shipment_id).await {
            if !self.needs_refresh(&path, &origin, &destination) {
                return path;
            }
        }
        self.refresh(shipment_id, origin, destination).await
    }

    /// Fetches a new path regardless of what is cached.
    pub async fn refresh(
        &self,
        shipment_id: &ShipmentId,
        origin: Coordinate,
        destination: Coordinate,
    ) -> RoutePath {
        let path = self.fetch(shipment_id, origin, destination).await;
        self.paths
            .write()
            .await
            .insert(shipment_id.clone(), path.clone());
        path
    }

    pub async fn invalidate(&self, shipment_id: &ShipmentId) {
        self.paths.write().await.remove(shipment_id);
    }

    async fn fetch(
        &self,
        shipment_id: &ShipmentId,
        origin: Coordinate,
        destination: Coordinate,
    ) -> RoutePath {
        let fetched_at = Utc::now();
        let answer = timeout(self.fetch_timeout, self.service.route(origin, destination)).await;
        match answer {
            Ok(Ok(waypoints)) => {
                let waypoints: Vec<Coordinate> = waypoints
                    .into_iter()
                    .filter(Coordinate::is_valid)
                    .collect();
                if waypoints.len() < 2 {
                    log::warn!(
                        "route for {shipment_id} has no usable geometry, using a straight line"
                    );
                    return RoutePath::straight_line(
                        shipment_id.clone(),
                        origin,
                        destination,
                        fetched_at,
                    );
                }
                log::debug!("fetched route for {shipment_id} ({} points)", waypoints.len());
                RoutePath {
                    shipment_id: shipment_id.clone(),
                    waypoints,
                    reference_start: origin,
                    destination,
                    fetched_at,
                    fallback: false,
                }
            }
            Ok(Err(why)) => {
                log::warn!("routing for {shipment_id} failed, using a straight line: {why}");
                RoutePath::straight_line(shipment_id.clone(), origin, destination, fetched_at)
            }
            Err(_) => {
                log::warn!(
                    "routing for {shipment_id} timed out after {:?}, using a straight line",
                    self.fetch_timeout
                );
                RoutePath::straight_line(shipment_id.clone(), origin, destination, fetched_at)
            }
        }
    }
}
