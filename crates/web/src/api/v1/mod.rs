use axum::{
    routing::{get, on, post},
    Router,
};
use model::{position::PositionSample, shipment::ShipmentEndpoints};

use crate::{
    common::{route_not_found, schema, METHOD_FILTER_ALL},
    WebState,
};

mod positions;
mod shipments;
mod ws;

macro_rules! resource {
    ($($arg:tt)*) => {
        crate::api::resource!("/v1{}", format_args!($($arg)*))
    };
}
pub(crate) use resource;

pub(crate) fn routes(state: WebState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/location", post(positions::post_location))
        .route("/schema/position", get(schema::<PositionSample>))
        .route("/schema/endpoints", get(schema::<ShipmentEndpoints>))
        .nest_service("/positions", positions::routes(state.clone()))
        .nest_service("/shipments", shipments::routes(state.clone()))
        .with_state(state)
        .fallback_service(on(METHOD_FILTER_ALL, route_not_found))
}
