use model::position::PositionSample;
use serde::Serialize;

use crate::{check_status, RoutingError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody<'a> {
    shipment_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    driver_id: Option<&'a str>,
    lat: f64,
    lng: f64,
    timestamp: i64,
}

/// Best-effort durable write of a driver's position, next to the live
/// channel.
#[derive(Debug, Clone)]
pub struct LocationUploader {
    url: String,
    driver_id: Option<String>,
    client: reqwest::Client,
}

impl LocationUploader {
    /// `base_url` is the API root; samples go to `{base_url}/location`.
    pub fn new(base_url: impl AsRef<str>, driver_id: Option<String>) -> Self {
        Self {
            url: format!("{}/location", base_url.as_ref().trim_end_matches('/')),
            driver_id,
            client: reqwest::Client::new(),
        }
    }

    pub async fn upload(&self, sample: &PositionSample) -> Result<(), RoutingError> {
        let body = LocationBody {
            shipment_id: sample.shipment_id.raw(),
            driver_id: self.driver_id.as_deref(),
            lat: sample.lat,
            lng: sample.lng,
            timestamp: sample.timestamp.timestamp_millis(),
        };
        let response = self.client.post(&self.url).json(&body).send().await?;
        check_status(response, self.url.clone()).await?;
        Ok(())
    }
}
