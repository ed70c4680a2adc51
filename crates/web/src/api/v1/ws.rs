use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use chrono::Utc;
use futures::{SinkExt as _, StreamExt as _};
use tokio::sync::broadcast::error::RecvError;
use tracking::wire::{InboundMessage, OutboundMessage};

use crate::WebState;

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Sends the snapshot, then relays live updates to the socket while
/// ingesting whatever it sends.
async fn handle_socket(socket: WebSocket, state: WebState) {
    let (mut sender, mut receiver) = socket.split();
    // subscribe before the snapshot so nothing falls in between
    let mut relay = state.relay.subscribe();

    let init = OutboundMessage::init(state.tracking.snapshot().await.into_values());
    match init.encode() {
        Ok(text) => {
            if sender.send(Message::Text(text)).await.is_err() {
                return;
            }
        }
        Err(why) => log::error!("could not encode snapshot: {why}"),
    }

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => handle_frame(&state, &text).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(why)) => {
                    log::warn!("socket error: {why}");
                    break;
                }
            },
            relayed = relay.recv() => match relayed {
                Ok(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("socket lagging, skipped {skipped} updates");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    log::debug!("socket closed");
}

async fn handle_frame(state: &WebState, text: &str) {
    let sample = match InboundMessage::decode(text, Utc::now()) {
        Ok(InboundMessage::DriverSample { sample, .. }) | Ok(InboundMessage::Update(sample)) => {
            sample
        }
        Ok(InboundMessage::Snapshot(_)) => {
            log::debug!("ignoring snapshot sent by a client");
            return;
        }
        Err(why) => {
            log::warn!("dropping malformed frame: {why}");
            return;
        }
    };

    if let Err(why) = state.tracking.ingest(sample.clone()).await {
        log::error!("could not ingest sample: {why}");
        return;
    }
    match OutboundMessage::gps_update(&sample).encode() {
        Ok(frame) => {
            let _ = state.relay.send(frame);
        }
        Err(why) => log::error!("could not encode update: {why}"),
    }
}
