use async_trait::async_trait;
use futures::{future, SinkExt as _, StreamExt as _};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracking::channel::{ChannelError, Connector, Link};

/// Connects a [`tracking::channel::TransportChannel`] to the hub's
/// WebSocket endpoint. Only text frames are passed through.
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, ChannelError> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|why| ChannelError::Connect(format!("{}: {why}", self.url)))?;
        log::debug!("connected to {}", self.url);

        let (sink, stream) = socket.split();
        let sink = sink
            .sink_map_err(|why| ChannelError::Io(why.to_string()))
            .with(|text: String| future::ready(Ok::<_, ChannelError>(Message::text(text))));
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text.to_string())),
                Ok(Message::Close(_)) => Some(Err(ChannelError::Closed)),
                Ok(_) => None,
                Err(why) => Some(Err(ChannelError::Io(why.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
