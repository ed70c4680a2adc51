//! Duplex text channel with an explicit connection lifecycle.
//!
//! [`ChannelMachine`] holds the lifecycle and the reconnect schedule and is
//! driven purely by the `now` values handed to it. [`TransportChannel`]
//! runs the machine against a real [`Connector`].

use std::{error, fmt, pin::Pin, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use futures::{Sink, SinkExt as _, Stream, StreamExt as _};
use tokio::{
    sync::{mpsc, watch},
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::wire::{InboundMessage, OutboundMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPolicy {
    Fixed(Duration),
    /// Doubles the delay after every consecutive failure, up to `max`.
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Delay before the reconnect following `failures` consecutive failed
    /// or dropped connections (starting at 0).
    pub fn delay(&self, failures: u32) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Exponential { initial, max } => initial
                .checked_mul(2u32.saturating_pow(failures.min(16)))
                .unwrap_or(max)
                .min(max),
        }
    }
}

#[derive(Debug)]
pub struct ChannelMachine {
    state: ConnectionState,
    policy: ReconnectPolicy,
    next_reconnect_at: Option<Instant>,
    failures: u32,
}

impl ChannelMachine {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            state: ConnectionState::Closed,
            policy,
            next_reconnect_at: None,
            failures: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn next_reconnect_at(&self) -> Option<Instant> {
        self.next_reconnect_at
    }

    /// Returns `true` when the caller should connect now. A no-op while
    /// connecting, open, or while a reconnect is already scheduled.
    pub fn start(&mut self) -> bool {
        if self.state != ConnectionState::Closed || self.next_reconnect_at.is_some() {
            return false;
        }
        self.state = ConnectionState::Connecting;
        true
    }

    pub fn opened(&mut self) {
        self.state = ConnectionState::Open;
        self.next_reconnect_at = None;
        self.failures = 0;
    }

    /// Records a close (or a failed connect) and schedules the reconnect.
    /// Returns `None` when a reconnect is already pending.
    pub fn closed(&mut self, now: Instant) -> Option<Instant> {
        if self.state == ConnectionState::Closed && self.next_reconnect_at.is_some() {
            return None;
        }
        let at = now + self.policy.delay(self.failures);
        self.state = ConnectionState::Closed;
        self.failures = self.failures.saturating_add(1);
        self.next_reconnect_at = Some(at);
        Some(at)
    }

    /// Fires the pending reconnect once it is due. Returns `true` when the
    /// caller should connect now.
    pub fn poll_reconnect(&mut self, now: Instant) -> bool {
        match self.next_reconnect_at {
            Some(at) if now >= at => {
                self.next_reconnect_at = None;
                self.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    pub fn shutdown(&mut self) {
        self.state = ConnectionState::Closed;
        self.next_reconnect_at = None;
    }
}

#[derive(Debug, Clone)]
pub enum ChannelError {
    Connect(String),
    Io(String),
    Closed,
}

impl error::Error for ChannelError {}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ChannelError::Connect(why) => write!(f, "could not connect: {why}"),
            ChannelError::Io(why) => write!(f, "channel error: {why}"),
            ChannelError::Closed => write!(f, "channel closed"),
        }
    }
}

pub type LinkSink = Pin<Box<dyn Sink<String, Error = ChannelError> + Send>>;
pub type LinkStream = Pin<Box<dyn Stream<Item = Result<String, ChannelError>> + Send>>;

/// One established connection: text frames out, text frames in.
pub struct Link {
    pub sink: LinkSink,
    pub stream: LinkStream,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link, ChannelError>;
}

/// Handle to a running channel. Cheap to clone; the channel stops when
/// `close` is called or every handle is dropped.
#[derive(Clone)]
pub struct TransportChannel {
    outbound: mpsc::Sender<String>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl TransportChannel {
    /// Starts connecting in the background. Decoded inbound messages are
    /// delivered on the returned receiver.
    pub fn open<C: Connector>(
        connector: C,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
        let cancel = CancellationToken::new();

        tokio::spawn(run(
            connector,
            ChannelMachine::new(policy),
            outbound_rx,
            inbound_tx,
            state_tx,
            cancel.clone(),
        ));

        let channel = Self {
            outbound: outbound_tx,
            state: state_rx,
            cancel,
        };
        (channel, inbound_rx)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Fire-and-forget send. Returns `false` when the message was dropped
    /// because the channel is not open.
    pub fn send(&self, message: &OutboundMessage) -> bool {
        if self.state() != ConnectionState::Open {
            log::debug!("channel not open, dropping outbound message");
            return false;
        }
        match message.encode() {
            Ok(text) => self.outbound.try_send(text).is_ok(),
            Err(why) => {
                log::error!("could not encode outbound message: {why}");
                false
            }
        }
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

enum PumpEnd {
    Cancelled,
    ReceiverGone,
    LinkClosed(Option<ChannelError>),
}

async fn run<C: Connector>(
    connector: C,
    mut machine: ChannelMachine,
    mut outbound: mpsc::Receiver<String>,
    inbound: mpsc::Sender<InboundMessage>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
) {
    let mut connect_now = machine.start();
    loop {
        if connect_now {
            state.send_replace(ConnectionState::Connecting);
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                connected = connector.connect() => connected,
            };
            match connected {
                Ok(link) => {
                    machine.opened();
                    state.send_replace(ConnectionState::Open);
                    log::info!("channel open");
                    match pump(link, &mut outbound, &inbound, &cancel).await {
                        PumpEnd::Cancelled | PumpEnd::ReceiverGone => break,
                        PumpEnd::LinkClosed(Some(why)) => log::warn!("channel lost: {why}"),
                        PumpEnd::LinkClosed(None) => log::warn!("channel closed by peer"),
                    }
                }
                Err(why) => log::warn!("{why}"),
            }
            // at-most-once: nothing queued for the dead link is replayed
            while outbound.try_recv().is_ok() {}
            if let Some(at) = machine.closed(Instant::now()) {
                log::info!(
                    "reconnecting in {:?}",
                    at.saturating_duration_since(Instant::now())
                );
            }
            state.send_replace(ConnectionState::Closed);
        }

        let Some(at) = machine.next_reconnect_at() else {
            break;
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep_until(at) => {}
        }
        connect_now = machine.poll_reconnect(Instant::now());
    }

    machine.shutdown();
    state.send_replace(ConnectionState::Closed);
    log::info!("channel stopped");
}

async fn pump(
    mut link: Link,
    outbound: &mut mpsc::Receiver<String>,
    inbound: &mpsc::Sender<InboundMessage>,
    cancel: &CancellationToken,
) -> PumpEnd {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = link.sink.close().await;
                return PumpEnd::Cancelled;
            }
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(why) = link.sink.send(text).await {
                        return PumpEnd::LinkClosed(Some(why));
                    }
                }
                None => return PumpEnd::Cancelled,
            },
            incoming = link.stream.next() => match incoming {
                Some(Ok(text)) => match InboundMessage::decode(&text, Utc::now()) {
                    Ok(message) => {
                        if inbound.send(message).await.is_err() {
                            return PumpEnd::ReceiverGone;
                        }
                    }
                    Err(why) => log::warn!("dropping malformed frame: {why}"),
                },
                Some(Err(why)) => return PumpEnd::LinkClosed(Some(why)),
                None => return PumpEnd::LinkClosed(None),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use futures::{channel::mpsc as link_mpsc, SinkExt as _, StreamExt as _};
    use model::{
        position::{PositionSample, SampleSource},
        Coordinate,
    };
    use tokio::sync::Mutex;

    use super::*;

    const DELAY: Duration = Duration::from_millis(2500);

    #[test]
    fn close_schedules_exactly_one_reconnect() {
        let now = Instant::now();
        let mut machine = ChannelMachine::new(ReconnectPolicy::Fixed(DELAY));

        assert!(machine.start());
        assert!(!machine.start(), "start while connecting must be a no-op");
        machine.opened();
        assert!(!machine.start(), "start while open must be a no-op");

        assert_eq!(machine.closed(now), Some(now + DELAY));
        assert_eq!(machine.closed(now + Duration::from_millis(10)), None);
        assert!(!machine.start(), "start with a pending reconnect must be a no-op");
        assert_eq!(machine.next_reconnect_at(), Some(now + DELAY));

        assert!(!machine.poll_reconnect(now + DELAY - Duration::from_millis(1)));
        assert_eq!(machine.state(), ConnectionState::Closed);
        assert!(machine.poll_reconnect(now + DELAY));
        assert_eq!(machine.state(), ConnectionState::Connecting);
        assert_eq!(machine.next_reconnect_at(), None);
        assert!(!machine.poll_reconnect(now + DELAY * 2));
    }

    #[test]
    fn exponential_backoff_is_capped_and_reset_on_open() {
        let policy = ReconnectPolicy::Exponential {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(4),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(10), Duration::from_secs(4));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(4));

        let now = Instant::now();
        let mut machine = ChannelMachine::new(policy);
        machine.start();
        assert_eq!(machine.closed(now), Some(now + Duration::from_millis(500)));
        assert!(machine.poll_reconnect(now + Duration::from_secs(1)));
        assert_eq!(
            machine.closed(now + Duration::from_secs(1)),
            Some(now + Duration::from_secs(2))
        );
        assert!(machine.poll_reconnect(now + Duration::from_secs(2)));
        machine.opened();
        assert_eq!(
            machine.closed(now + Duration::from_secs(3)),
            Some(now + Duration::from_millis(3500))
        );
    }

    /// Hands out in-memory links and keeps the far ends for the test.
    #[derive(Clone, Default)]
    struct LoopbackConnector {
        attempts: Arc<AtomicUsize>,
        peers: Arc<Mutex<Vec<Peer>>>,
    }

    struct Peer {
        to_channel: link_mpsc::UnboundedSender<Result<String, ChannelError>>,
        from_channel: link_mpsc::UnboundedReceiver<String>,
    }

    #[async_trait]
    impl Connector for LoopbackConnector {
        async fn connect(&self) -> Result<Link, ChannelError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let (to_peer, from_channel) = link_mpsc::unbounded::<String>();
            let (to_channel, from_peer) = link_mpsc::unbounded();
            self.peers.lock().await.push(Peer {
                to_channel,
                from_channel,
            });
            Ok(Link {
                sink: Box::pin(to_peer.sink_map_err(|_| ChannelError::Closed)),
                stream: Box::pin(from_peer),
            })
        }
    }

    async fn wait_for(channel: &TransportChannel, wanted: ConnectionState) {
        let mut changes = channel.state_changes();
        while *changes.borrow_and_update() != wanted {
            changes.changed().await.unwrap();
        }
    }

    fn sample() -> PositionSample {
        PositionSample::new(
            "SHP-1".into(),
            Coordinate::new(14.6, 121.0),
            None,
            Utc::now(),
            SampleSource::Device,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_inbound_and_drops_malformed_frames() {
        let connector = LoopbackConnector::default();
        let (channel, mut inbound) =
            TransportChannel::open(connector.clone(), ReconnectPolicy::Fixed(DELAY));
        wait_for(&channel, ConnectionState::Open).await;

        let peers = connector.peers.lock().await;
        let peer = &peers[0];
        peer.to_channel.unbounded_send(Ok("garbage".to_owned())).unwrap();
        peer.to_channel
            .unbounded_send(Ok(
                r#"{"type":"gps_update","shipmentId":"SHP-1","lat":14.6,"lng":121.0}"#.to_owned(),
            ))
            .unwrap();

        match inbound.recv().await {
            Some(InboundMessage::Update(sample)) => assert_eq!(sample.shipment_id.raw(), "SHP-1"),
            other => panic!("unexpected {other:?}"),
        }
        channel.close();
    }

    #[tokio::test(start_paused = true)]
    async fn sends_only_while_open_and_reconnects_after_delay() {
        let connector = LoopbackConnector::default();
        let (channel, _inbound) =
            TransportChannel::open(connector.clone(), ReconnectPolicy::Fixed(DELAY));
        wait_for(&channel, ConnectionState::Open).await;

        assert!(channel.send(&OutboundMessage::driver_gps(&sample(), None)));
        {
            let mut peers = connector.peers.lock().await;
            let frame = peers[0].from_channel.next().await.unwrap();
            assert!(frame.contains("driver_gps"));
            // the peer hangs up
            peers[0].to_channel.close_channel();
        }

        wait_for(&channel, ConnectionState::Closed).await;
        let closed_at = Instant::now();
        assert!(!channel.send(&OutboundMessage::driver_gps(&sample(), None)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);

        wait_for(&channel, ConnectionState::Open).await;
        assert!(Instant::now() >= closed_at + DELAY);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        channel.close();
    }
}
