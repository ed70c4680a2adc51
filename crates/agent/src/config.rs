use std::{env, error, fmt, path::PathBuf};

use model::{
    shipment::{ShipmentEndpoints, ShipmentId},
    Coordinate,
};
use tracking::TrackingConfig;
use utility::id::Id;

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    Missing(&'static str),
    Invalid { key: &'static str, value: String },
}

impl error::Error for ConfigError {}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Missing(key) => write!(f, "expected {key} in env"),
            ConfigError::Invalid { key, value } => write!(f, "invalid value `{value}` for {key}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub shipment_id: ShipmentId,
    pub driver_id: Option<String>,
    /// WebSocket endpoint of the hub.
    pub hub_ws_url: String,
    /// API root of the hub, used for HTTP writes.
    pub hub_api_url: String,
    pub routing_url: Option<String>,
    /// Recorded track replayed by the driver.
    pub track: Option<PathBuf>,
    /// Pickup and drop-off for the monitor's route and ETA.
    pub endpoints: Option<ShipmentEndpoints>,
    pub tracking: TrackingConfig,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let shipment_id = env::var("SHIPMENT_ID").map_err(|_| ConfigError::Missing("SHIPMENT_ID"))?;
        let endpoints = match (
            optional_coordinate("SHIPMENT_ORIGIN")?,
            optional_coordinate("SHIPMENT_DESTINATION")?,
        ) {
            (Some(origin), Some(destination)) => Some(ShipmentEndpoints {
                origin,
                destination,
            }),
            _ => None,
        };

        Ok(Self {
            shipment_id: Id::new(shipment_id),
            driver_id: non_empty("DRIVER_ID"),
            hub_ws_url: non_empty("HUB_WS_URL")
                .unwrap_or_else(|| "ws://127.0.0.1:8080/api/v1/ws".to_owned()),
            hub_api_url: non_empty("HUB_API_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8080/api/v1".to_owned()),
            routing_url: non_empty("ROUTING_URL"),
            track: non_empty("TRACK_FILE").map(PathBuf::from),
            endpoints,
            tracking: TrackingConfig::from_env(),
        })
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn optional_coordinate(key: &'static str) -> Result<Option<Coordinate>, ConfigError> {
    non_empty(key)
        .map(|value| {
            parse_coordinate(&value).ok_or(ConfigError::Invalid { key, value })
        })
        .transpose()
}

/// Parses `"lat,lng"`.
pub fn parse_coordinate(value: &str) -> Option<Coordinate> {
    let (lat, lng) = value.split_once(',')?;
    let coordinate = Coordinate::new(lat.trim().parse().ok()?, lng.trim().parse().ok()?);
    coordinate.is_valid().then_some(coordinate)
}
