//! JSON envelopes exchanged over the tracking channel.
//!
//! Producers disagree on key names (`lat`/`latitude`, `shipmentId`/
//! `driverId`), so every inbound envelope is normalized into a single
//! [`PositionSample`] before it reaches the store.

use std::{collections::HashMap, error, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use model::{
    position::{PositionSample, SampleSource},
    shipment::ShipmentId,
    Coordinate,
};
use serde::{Deserialize, Serialize};
use utility::{
    id::Id,
    serde::{string_or_number, timestamp},
};

#[derive(Debug, Clone)]
pub enum WireError {
    JsonError(Arc<serde_json::Error>),
    MissingShipment,
    MissingField(&'static str),
    InvalidCoordinates { lat: f64, lng: f64 },
}

impl error::Error for WireError {}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            WireError::JsonError(e) => write!(f, "JSON error: {}", e),
            WireError::MissingShipment => write!(f, "message names no shipment"),
            WireError::MissingField(field) => write!(f, "missing field `{field}`"),
            WireError::InvalidCoordinates { lat, lng } => {
                write!(f, "invalid coordinates ({lat}, {lng})")
            }
        }
    }
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::JsonError(Arc::new(e))
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Latest known positions, sent once when a channel opens.
    Snapshot(Vec<PositionSample>),
    /// A single live position.
    Update(PositionSample),
    /// A sample pushed by a driver's device.
    DriverSample {
        sample: PositionSample,
        driver_id: Option<String>,
    },
}

impl InboundMessage {
    /// Decodes one frame. `arrived_at` stamps samples that carry no
    /// timestamp of their own.
    pub fn decode(text: &str, arrived_at: DateTime<Utc>) -> Result<Self, WireError> {
        match serde_json::from_str::<Envelope>(text)? {
            Envelope::Init { data } => {
                let mut samples = Vec::with_capacity(data.len());
                for (shipment_id, entry) in data {
                    let decoded = serde_json::from_value::<SnapshotEntry>(entry)
                        .map_err(WireError::from)
                        .and_then(|entry| {
                            entry.into_sample(Id::new(shipment_id.clone()), arrived_at)
                        });
                    match decoded {
                        Ok(sample) => samples.push(sample),
                        Err(why) => log::warn!("skipping snapshot entry {shipment_id}: {why}"),
                    }
                }
                Ok(Self::Snapshot(samples))
            }
            Envelope::GpsUpdate(update) | Envelope::DriverLocation(update) => {
                Ok(Self::Update(update.into_sample(SampleSource::Channel, arrived_at)?))
            }
            Envelope::DriverGps(update) => {
                let driver_id = update.driver_id.clone();
                Ok(Self::DriverSample {
                    sample: update.into_sample(SampleSource::Channel, arrived_at)?,
                    driver_id,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum Envelope {
    #[serde(rename = "init")]
    Init {
        data: HashMap<String, serde_json::Value>,
    },
    #[serde(rename = "gps_update")]
    GpsUpdate(LiveUpdate),
    #[serde(rename = "driver_location")]
    DriverLocation(LiveUpdate),
    #[serde(rename = "driver_gps")]
    DriverGps(LiveUpdate),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LiveUpdate {
    #[serde(deserialize_with = "string_or_number::deserialize_option", default)]
    shipment_id: Option<String>,
    #[serde(deserialize_with = "string_or_number::deserialize_option", default)]
    driver_id: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    lat: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    lng: Option<f64>,
    #[serde(deserialize_with = "timestamp::deserialize_option", default)]
    timestamp: Option<DateTime<Utc>>,
}

impl LiveUpdate {
    fn into_sample(
        self,
        source: SampleSource,
        arrived_at: DateTime<Utc>,
    ) -> Result<PositionSample, WireError> {
        let shipment_id = self
            .shipment_id
            .or(self.driver_id)
            .ok_or(WireError::MissingShipment)?;
        let lat = self
            .latitude
            .or(self.lat)
            .ok_or(WireError::MissingField("latitude"))?;
        let lng = self
            .longitude
            .or(self.lng)
            .ok_or(WireError::MissingField("longitude"))?;
        PositionSample::new(
            Id::new(shipment_id),
            Coordinate::new(lat, lng),
            self.timestamp,
            arrived_at,
            source,
        )
        .ok_or(WireError::InvalidCoordinates { lat, lng })
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    #[serde(alias = "lat")]
    latitude: f64,
    #[serde(alias = "lng")]
    longitude: f64,
    #[serde(deserialize_with = "timestamp::deserialize_option", default)]
    timestamp: Option<DateTime<Utc>>,
}

impl SnapshotEntry {
    fn into_sample(
        self,
        shipment_id: ShipmentId,
        arrived_at: DateTime<Utc>,
    ) -> Result<PositionSample, WireError> {
        PositionSample::new(
            shipment_id,
            Coordinate::new(self.latitude, self.longitude),
            self.timestamp,
            arrived_at,
            SampleSource::Snapshot,
        )
        .ok_or(WireError::InvalidCoordinates {
            lat: self.latitude,
            lng: self.longitude,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotPosition {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(with = "timestamp")]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "driver_gps", rename_all = "camelCase")]
    DriverGps {
        shipment_id: ShipmentId,
        #[serde(skip_serializing_if = "Option::is_none")]
        driver_id: Option<String>,
        lat: f64,
        lng: f64,
        #[serde(with = "timestamp")]
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "init")]
    Init {
        data: HashMap<String, SnapshotPosition>,
    },
    #[serde(rename = "gps_update", rename_all = "camelCase")]
    GpsUpdate {
        shipment_id: ShipmentId,
        latitude: f64,
        longitude: f64,
        #[serde(with = "timestamp")]
        timestamp: DateTime<Utc>,
    },
}

impl OutboundMessage {
    pub fn driver_gps(sample: &PositionSample, driver_id: Option<String>) -> Self {
        Self::DriverGps {
            shipment_id: sample.shipment_id.clone(),
            driver_id,
            lat: sample.lat,
            lng: sample.lng,
            timestamp: sample.timestamp,
        }
    }

    pub fn gps_update(sample: &PositionSample) -> Self {
        Self::GpsUpdate {
            shipment_id: sample.shipment_id.clone(),
            latitude: sample.lat,
            longitude: sample.lng,
            timestamp: sample.timestamp,
        }
    }

    pub fn init<I>(samples: I) -> Self
    where
        I: IntoIterator<Item = PositionSample>,
    {
        Self::Init {
            data: samples
                .into_iter()
                .map(|sample| {
                    (
                        sample.shipment_id.raw(),
                        SnapshotPosition {
                            latitude: sample.lat,
                            longitude: sample.lng,
                            timestamp: sample.timestamp,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn encode(&self) -> Result<String, WireError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn both_live_update_variants_decode_to_the_same_sample() {
        let arrived_at = at(0);
        let short = json!({
            "type": "driver_location", "driverId": 17,
            "lat": 14.6, "lng": 121.0, "timestamp": 1_000
        });
        let long = json!({
            "type": "gps_update", "shipmentId": "17",
            "latitude": 14.6, "longitude": 121.0, "timestamp": 1_000
        });

        let short = InboundMessage::decode(&short.to_string(), arrived_at).unwrap();
        let long = InboundMessage::decode(&long.to_string(), arrived_at).unwrap();
        assert_eq!(short, long);
        match short {
            InboundMessage::Update(sample) => {
                assert_eq!(sample.shipment_id.raw(), "17");
                assert_eq!(sample.timestamp, at(1_000));
                assert_eq!(sample.source, SampleSource::Channel);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn shipment_id_wins_over_driver_id() {
        let text = json!({
            "type": "gps_update", "shipmentId": "SHP-1", "driverId": "DRV-9",
            "lat": 14.6, "lng": 121.0
        });
        match InboundMessage::decode(&text.to_string(), at(5)).unwrap() {
            InboundMessage::Update(sample) => {
                assert_eq!(sample.shipment_id.raw(), "SHP-1");
                assert_eq!(sample.timestamp, at(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn snapshot_skips_invalid_entries() {
        let text = json!({
            "type": "init",
            "data": {
                "SHP-1": { "latitude": 14.6, "longitude": 121.0, "timestamp": 10 },
                "SHP-2": { "latitude": 0.0, "longitude": 0.0, "timestamp": 10 },
                "SHP-3": { "lat": 14.7, "lng": 121.1 }
            }
        });
        match InboundMessage::decode(&text.to_string(), at(20)).unwrap() {
            InboundMessage::Snapshot(mut samples) => {
                samples.sort_by(|a, b| a.shipment_id.cmp(&b.shipment_id));
                assert_eq!(samples.len(), 2);
                assert_eq!(samples[0].shipment_id.raw(), "SHP-1");
                assert_eq!(samples[1].timestamp, at(20));
                assert!(samples.iter().all(|s| s.source == SampleSource::Snapshot));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn snapshot_survives_entries_that_do_not_parse() {
        let text = json!({
            "type": "init",
            "data": {
                "SHP-1": { "latitude": 14.6, "longitude": 121.0, "timestamp": 10 },
                "SHP-2": { "latitude": null, "longitude": null },
                "SHP-3": { "latitude": "north", "longitude": 121.0 },
                "SHP-4": "garbage"
            }
        });
        match InboundMessage::decode(&text.to_string(), at(20)).unwrap() {
            InboundMessage::Snapshot(samples) => {
                assert_eq!(samples.len(), 1);
                assert_eq!(samples[0].shipment_id.raw(), "SHP-1");
                assert_eq!(samples[0].timestamp, at(10));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_errors() {
        let now = at(0);
        assert!(InboundMessage::decode("not json", now).is_err());
        assert!(InboundMessage::decode(r#"{"type":"chat","text":"hi"}"#, now).is_err());
        assert!(matches!(
            InboundMessage::decode(r#"{"type":"gps_update","lat":1.0,"lng":2.0}"#, now),
            Err(WireError::MissingShipment)
        ));
        assert!(matches!(
            InboundMessage::decode(r#"{"type":"gps_update","shipmentId":"A","lng":2.0}"#, now),
            Err(WireError::MissingField("latitude"))
        ));
        assert!(matches!(
            InboundMessage::decode(
                r#"{"type":"gps_update","shipmentId":"A","lat":0,"lng":0}"#,
                now
            ),
            Err(WireError::InvalidCoordinates { .. })
        ));
    }

    #[test]
    fn driver_gps_carries_the_driver() {
        let sample = PositionSample::new(
            "SHP-1".into(),
            Coordinate::new(14.6, 121.0),
            Some(at(1_700_000_000_000)),
            at(0),
            SampleSource::Device,
        )
        .unwrap();
        let text = OutboundMessage::driver_gps(&sample, Some("DRV-9".to_owned()))
            .encode()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "driver_gps", "shipmentId": "SHP-1", "driverId": "DRV-9",
                "lat": 14.6, "lng": 121.0, "timestamp": 1_700_000_000_000i64
            })
        );

        match InboundMessage::decode(&text, at(0)).unwrap() {
            InboundMessage::DriverSample {
                sample: decoded,
                driver_id,
            } => {
                assert_eq!(decoded.position(), sample.position());
                assert_eq!(driver_id.as_deref(), Some("DRV-9"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn init_snapshot_is_keyed_by_shipment() {
        let sample = PositionSample::new(
            "SHP-4".into(),
            Coordinate::new(14.6, 121.0),
            Some(at(42)),
            at(0),
            SampleSource::Channel,
        )
        .unwrap();
        let text = OutboundMessage::init(vec![sample]).encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "init");
        assert_eq!(value["data"]["SHP-4"]["latitude"], 14.6);
        assert_eq!(value["data"]["SHP-4"]["timestamp"], 42);
    }
}
