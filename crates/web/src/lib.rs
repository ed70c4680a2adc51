pub use crate::common::RouteResult;

use std::{net::SocketAddr, sync::Arc};

use axum::{extract::FromRef, routing::on, Router};
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::trace::TraceLayer;
use tracking::{directory::InMemoryDirectory, TrackingService};

use crate::common::{route_not_found, METHOD_FILTER_ALL};

pub mod api;
pub mod common;
pub mod config;

#[derive(Clone, FromRef)]
pub struct WebState {
    pub tracking: Arc<TrackingService>,
    pub directory: Arc<InMemoryDirectory>,
    /// Encoded `gps_update` frames fanned out to every connected socket.
    pub relay: broadcast::Sender<String>,
}

impl WebState {
    pub fn new(
        tracking: Arc<TrackingService>,
        directory: Arc<InMemoryDirectory>,
        relay_capacity: usize,
    ) -> Self {
        let (relay, _) = broadcast::channel(relay_capacity.max(1));
        Self {
            tracking,
            directory,
            relay,
        }
    }
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .nest_service("/api", api::routes(state))
        .layer(TraceLayer::new_for_http())
        .fallback_service(on(METHOD_FILTER_ALL, route_not_found))
}

pub async fn start_web_server(state: WebState, addr: SocketAddr) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: WebState) -> std::io::Result<()> {
    log::info!("hub listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state).into_make_service()).await
}
