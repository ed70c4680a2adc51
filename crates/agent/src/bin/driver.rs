use std::error::Error;

use agent::{AgentConfig, WsConnector};
use routing::LocationUploader;
use tokio::sync::mpsc;
use tracking::{
    channel::TransportChannel,
    location::{LocationEvent, LocationSource, ReplayPositioning},
    wire::OutboundMessage,
};

/// Replays a recorded track as a driver's device would report it.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let config = AgentConfig::from_env()?;
    let track = config.track.as_ref().ok_or("expected TRACK_FILE in env")?;
    let positioning = ReplayPositioning::from_path(track)?;
    log::info!(
        "replaying {} fixes for {}",
        positioning.remaining(),
        config.shipment_id
    );

    let (channel, mut inbound) =
        TransportChannel::open(WsConnector::new(&config.hub_ws_url), config.tracking.reconnect);
    // the driver only sends; drain whatever the hub relays back
    tokio::spawn(async move { while inbound.recv().await.is_some() {} });
    let uploader = LocationUploader::new(&config.hub_api_url, config.driver_id.clone());

    let (events_tx, mut events) = mpsc::channel(64);
    let mut source = LocationSource::new(config.shipment_id.clone(), positioning, &config.tracking);
    source.start(move |event| {
        if events_tx.try_send(event).is_err() {
            log::warn!("location events backing up, dropping one");
        }
    });

    while let Some(event) = events.recv().await {
        match event {
            LocationEvent::Local(sample) => {
                log::debug!("at {:.6},{:.6}", sample.lat, sample.lng);
            }
            LocationEvent::Network(sample) => {
                let message = OutboundMessage::driver_gps(&sample, config.driver_id.clone());
                if !channel.send(&message) {
                    log::info!("channel not open, relying on HTTP upload");
                }
                let uploader = uploader.clone();
                tokio::spawn(async move {
                    if let Err(why) = uploader.upload(&sample).await {
                        log::warn!("location upload failed: {why}");
                    }
                });
            }
            LocationEvent::Unavailable(why) => log::warn!("{why}"),
        }
    }

    source.join().await;
    channel.close();
    log::info!("track finished");
    Ok(())
}
