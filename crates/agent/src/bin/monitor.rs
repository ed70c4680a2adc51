use std::{error::Error, sync::Arc};

use agent::{AgentConfig, WsConnector};
use routing::HttpRouteService;
use tracking::{
    channel::TransportChannel,
    directory::InMemoryDirectory,
    route::{RouteService, StraightLine},
    SessionEvent, TrackingService,
};

/// Follows one shipment through the hub and logs what a map view would
/// render.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = AgentConfig::from_env()?;
    let route_service: Arc<dyn RouteService> = match &config.routing_url {
        Some(url) => Arc::new(
            HttpRouteService::new(url.as_str()).with_timeout(config.tracking.route_timeout),
        ),
        None => Arc::new(StraightLine),
    };
    let directory = Arc::new(InMemoryDirectory::default());
    match config.endpoints {
        Some(endpoints) => {
            directory.register(config.shipment_id.clone(), endpoints).await;
        }
        None => log::warn!("no SHIPMENT_ORIGIN/SHIPMENT_DESTINATION, following without route"),
    }

    let tracking = TrackingService::start(config.tracking.clone(), route_service, directory);
    let (channel, inbound) =
        TransportChannel::open(WsConnector::new(&config.hub_ws_url), config.tracking.reconnect);
    let pipe = tracking.pipe_inbound(inbound);

    let mut session = tracking.open_session();
    session.activate(config.shipment_id.clone()).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = session.next_event() => match event {
                Some(event) => render(&event),
                None => break,
            },
        }
    }

    drop(session);
    channel.close();
    pipe.abort();
    tracking.shutdown();
    Ok(())
}

fn render(event: &SessionEvent) {
    match event {
        SessionEvent::Position(update) => match update.bearing {
            Some(bearing) => log::info!(
                "vehicle at {:.6},{:.6} heading {bearing:.0}°",
                update.position.lat,
                update.position.lng
            ),
            None => log::info!(
                "vehicle at {:.6},{:.6}",
                update.position.lat,
                update.position.lng
            ),
        },
        SessionEvent::Route(path) => log::info!(
            "route with {} points, {:.0} m{}",
            path.waypoints.len(),
            path.length(),
            if path.fallback { " (straight line)" } else { "" }
        ),
        SessionEvent::Eta(eta) => log::info!(
            "ETA {} min ({:.0} m at {:.1} m/s)",
            eta.rounded_minutes(),
            eta.remaining_m,
            eta.speed_mps
        ),
    }
}
