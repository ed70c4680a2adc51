use std::convert::Infallible;

use axum::{
    extract::{OriginalUri, Path, State},
    http::Method,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, on, put},
    Json, Router,
};
use axum_extra::TypedHeader;
use futures::stream::{self, Stream};
use model::{position::PositionSample, shipment::ShipmentEndpoints};
use serde::Serialize;
use tokio_stream::StreamExt as _;
use utility::id::Id;

use crate::{
    common::{route_not_found, RouteErrorResponse, METHOD_FILTER_ALL},
    RouteResult, WebState,
};

macro_rules! resource {
    ($($arg:tt)*) => {
        crate::api::v1::resource!("/shipments{}", format_args!($($arg)*))
    };
}

pub(crate) fn routes(state: WebState) -> Router {
    Router::new()
        .route("/:id", put(register_shipment))
        .route("/:id/position", get(get_position))
        .route("/:id/live", get(live))
        .with_state(state)
        .fallback_service(on(METHOD_FILTER_ALL, route_not_found))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisteredShipment {
    shipment_id: String,
    endpoints: ShipmentEndpoints,
    position: String,
    live: String,
}

async fn register_shipment(
    Path(id): Path<String>,
    State(WebState {
        tracking,
        directory,
        ..
    }): State<WebState>,
    Json(endpoints): Json<ShipmentEndpoints>,
) -> RouteResult<Json<RegisteredShipment>> {
    if !endpoints.origin.is_valid() || !endpoints.destination.is_valid() {
        return Err(RouteErrorResponse::unprocessable("Invalid shipment endpoints."));
    }

    let shipment_id = Id::new(id.clone());
    if let Some(previous) = directory.register(shipment_id.clone(), endpoints).await {
        if previous.destination != endpoints.destination {
            tracking.routes().invalidate(&shipment_id).await;
        }
    }
    log::info!("registered shipment {id}");

    Ok(Json(RegisteredShipment {
        position: resource!("/{}/position", id),
        live: resource!("/{}/live", id),
        shipment_id: id,
        endpoints,
    }))
}

async fn get_position(
    OriginalUri(original_uri): OriginalUri,
    Path(id): Path<String>,
    State(WebState { tracking, .. }): State<WebState>,
) -> RouteResult<Json<PositionSample>> {
    tracking
        .store()
        .get(&Id::new(id))
        .await
        .map(Json)
        .ok_or_else(|| {
            RouteErrorResponse::not_found(&Method::GET, original_uri.path())
                .with_message("No position known for this shipment.")
        })
}

/// Streams one observer session as server-sent events. The session ends
/// when the client disconnects.
async fn live(
    Path(id): Path<String>,
    user_agent: Option<TypedHeader<headers::UserAgent>>,
    State(WebState { tracking, .. }): State<WebState>,
) -> RouteResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let mut session = tracking.open_session();
    session.activate(Id::new(id.clone())).await?;
    match user_agent {
        Some(TypedHeader(user_agent)) => {
            log::info!("`{}` watching {id}", user_agent.as_str())
        }
        None => log::info!("observer {} watching {id}", session.observer_id()),
    }

    let stream = stream::unfold(session, |mut session| async move {
        let event = session.next_event().await?;
        let sse = Event::default()
            .event(event.kind())
            .json_data(&event)
            .unwrap_or_else(|why| {
                log::error!("could not encode {} event: {why}", event.kind());
                Event::default().comment("dropped event")
            });
        Some((sse, session))
    })
    .map(Ok);

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
