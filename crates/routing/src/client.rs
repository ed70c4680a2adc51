use std::{error::Error, time::Duration};

use async_trait::async_trait;
use model::Coordinate;
use serde::Deserialize;
use tracking::route::RouteService;

use crate::{check_status, RoutingError};

#[derive(Debug, Deserialize)]
struct FeatureCollection {
    #[serde(default)]
    features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    #[serde(default)]
    coordinates: Vec<Vec<f64>>,
}

/// Client of the routing service. Answers are GeoJSON feature collections
/// whose first feature carries the path as `[lng, lat]` pairs.
#[derive(Debug, Clone)]
pub struct HttpRouteService {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRouteService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Sets the per-request timeout. A request that runs longer fails with
    /// [`RoutingError::RequestError`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetches the routed path in `(lat, lng)` order.
    pub async fn fetch(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Vec<Coordinate>, RoutingError> {
        let url = format!(
            "{}/route?originLat={}&originLng={}&destLat={}&destLng={}",
            self.base_url, origin.lat, origin.lng, destination.lat, destination.lng
        );
        log::debug!("requesting route {url}");

        let response = self.client.get(&url).timeout(self.timeout).send().await?;
        let response = check_status(response, url).await?;
        let collection: FeatureCollection = serde_json::from_str(&response.text().await?)?;

        let waypoints = collection
            .features
            .into_iter()
            .next()
            .and_then(|feature| feature.geometry)
            .map(|geometry| geometry.coordinates)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|pair| match pair[..] {
                [lng, lat, ..] => Some(Coordinate::new(lat, lng)),
                _ => None,
            })
            .collect::<Vec<_>>();

        if waypoints.is_empty() {
            return Err(RoutingError::EmptyGeometry);
        }
        Ok(waypoints)
    }
}

#[async_trait]
impl RouteService for HttpRouteService {
    async fn route(
        &self,
        origin: Coordinate,
        destination: Coordinate,
    ) -> Result<Vec<Coordinate>, Box<dyn Error + Send + Sync>> {
        Ok(self.fetch(origin, destination).await?)
    }
}
