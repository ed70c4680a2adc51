use std::sync::Arc;

use routing::HttpRouteService;
use tracking::{
    directory::InMemoryDirectory,
    route::{RouteService, StraightLine},
    TrackingConfig, TrackingService,
};
use web::{config::HubConfig, start_web_server, WebState};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config = HubConfig::from_env();
    let tracking_config = TrackingConfig::from_env();
    let route_service: Arc<dyn RouteService> = match &config.routing_url {
        Some(url) => Arc::new(
            HttpRouteService::new(url.as_str()).with_timeout(tracking_config.route_timeout),
        ),
        None => {
            log::warn!("ROUTING_URL not set, routes are straight lines");
            Arc::new(StraightLine)
        }
    };

    // tracking core
    let directory = Arc::new(InMemoryDirectory::default());
    let tracking = TrackingService::start(tracking_config, route_service, directory.clone());

    // web server
    let state = WebState::new(tracking.clone(), directory, config.relay_capacity);
    let result = start_web_server(state, config.bind).await;

    tracking.shutdown();
    result
}
