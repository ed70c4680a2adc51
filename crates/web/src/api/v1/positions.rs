use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, on},
    Json, Router,
};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use model::{
    position::{PositionSample, SampleSource},
    Coordinate,
};
use serde::Deserialize;
use tracking::wire::OutboundMessage;
use utility::{
    id::Id,
    serde::{string_or_number, timestamp},
};

use crate::{
    common::{route_not_found, RouteErrorResponse, VecResponse, METHOD_FILTER_ALL},
    RouteResult, WebState,
};

pub(crate) fn routes(state: WebState) -> Router {
    Router::new()
        .route("/", get(get_positions))
        .with_state(state)
        .fallback_service(on(METHOD_FILTER_ALL, route_not_found))
}

async fn get_positions(
    State(WebState { tracking, .. }): State<WebState>,
) -> Json<VecResponse<PositionSample>> {
    let positions = tracking
        .snapshot()
        .await
        .into_values()
        .sorted_by(|a, b| a.shipment_id.cmp(&b.shipment_id))
        .collect();
    VecResponse::new(positions).json()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct LocationRequest {
    #[serde(deserialize_with = "string_or_number::deserialize_option", default)]
    shipment_id: Option<String>,
    #[serde(deserialize_with = "string_or_number::deserialize_option", default)]
    driver_id: Option<String>,
    lat: f64,
    lng: f64,
    #[serde(deserialize_with = "timestamp::deserialize_option", default)]
    timestamp: Option<DateTime<Utc>>,
}

/// HTTP fallback for devices without a live channel. Accepted samples are
/// relayed to connected sockets like any channel update.
pub(crate) async fn post_location(
    State(WebState { tracking, relay, .. }): State<WebState>,
    Json(request): Json<LocationRequest>,
) -> RouteResult<impl IntoResponse> {
    let shipment_id = request
        .shipment_id
        .or(request.driver_id)
        .ok_or_else(|| {
            RouteErrorResponse::new(StatusCode::BAD_REQUEST)
                .with_message("Either shipmentId or driverId is required.")
        })?;
    let sample = PositionSample::new(
        Id::new(shipment_id),
        Coordinate::new(request.lat, request.lng),
        request.timestamp,
        Utc::now(),
        SampleSource::Http,
    )
    .ok_or_else(|| {
        RouteErrorResponse::unprocessable("Invalid coordinates.")
            .with_detailed_information(format!("({}, {})", request.lat, request.lng))
    })?;

    tracking.ingest(sample.clone()).await?;
    if let Ok(frame) = OutboundMessage::gps_update(&sample).encode() {
        // no connected sockets is fine
        let _ = relay.send(frame);
    }

    Ok((StatusCode::ACCEPTED, Json(sample)))
}
