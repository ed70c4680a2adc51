use std::{
    collections::HashMap,
    error, fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use futures::FutureExt;
use model::{
    position::PositionSample,
    shipment::{ObserverId, ShipmentId, Subscription},
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        oneshot,
    },
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    buffer::UpdateBuffer,
    config::TrackingConfig,
    directory::ShipmentDirectory,
    route::{RoutePathCache, RouteService},
    session::ObserverSession,
    store::PositionStore,
    wire::InboundMessage,
};

#[derive(Debug)]
pub enum ServiceError {
    /// The dispatch loop is no longer running.
    Stopped,
    ResponseError(oneshot::error::RecvError),
}

impl error::Error for ServiceError {}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServiceError::Stopped => write!(f, "tracking service stopped"),
            ServiceError::ResponseError(e) => write!(f, "no response from tracking service: {e}"),
        }
    }
}

impl From<oneshot::error::RecvError> for ServiceError {
    fn from(why: oneshot::error::RecvError) -> Self {
        Self::ResponseError(why)
    }
}

impl<T> From<mpsc::error::SendError<T>> for ServiceError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        Self::Stopped
    }
}

/// What a subscriber has to render before live updates start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    pub stored: Option<PositionSample>,
    pub buffered: Option<PositionSample>,
}

impl Replay {
    /// The buffered update supersedes the stored position unless it is older.
    pub fn latest(&self) -> Option<&PositionSample> {
        match (&self.stored, &self.buffered) {
            (Some(stored), Some(buffered)) if buffered.is_older_than(stored) => Some(stored),
            (_, Some(buffered)) => Some(buffered),
            (stored, None) => stored.as_ref(),
        }
    }
}

enum Command {
    Ingest(PositionSample),
    Seed(Vec<PositionSample>),
    Subscribe {
        subscription: Subscription,
        live: mpsc::Sender<PositionSample>,
        responder: oneshot::Sender<Replay>,
    },
    Unsubscribe {
        observer_id: ObserverId,
    },
}

/// Owns every write to the store, the buffer and the subscriber registry.
/// Commands are applied one at a time, so a subscription can never observe
/// a half-applied ingest.
struct Dispatcher {
    store: Arc<PositionStore>,
    buffer: Arc<UpdateBuffer>,
    live: HashMap<ShipmentId, HashMap<ObserverId, mpsc::Sender<PositionSample>>>,
    observers: HashMap<ObserverId, ShipmentId>,
}

impl Dispatcher {
    async fn handle(&mut self, command: Command) {
        match command {
            Command::Ingest(sample) => self.ingest(sample).await,
            Command::Seed(samples) => {
                log::debug!("seeding {} positions", samples.len());
                for sample in samples {
                    if self.store.set(sample.clone()).await {
                        self.deliver(&sample);
                    }
                }
            }
            Command::Subscribe {
                subscription,
                live,
                responder,
            } => {
                let replay = self.subscribe(subscription, live).await;
                // the subscriber may have given up waiting
                let _ = responder.send(replay);
            }
            Command::Unsubscribe { observer_id } => self.unsubscribe(&observer_id),
        }
    }

    async fn ingest(&mut self, sample: PositionSample) {
        if !self.store.set(sample.clone()).await {
            log::debug!("ignoring stale sample for {}", sample.shipment_id);
            return;
        }
        if !self.deliver(&sample) {
            self.buffer.push(sample).await;
        }
    }

    /// Pushes `sample` to the shipment's live subscribers. Returns whether
    /// the shipment is still watched, even if every subscriber was too far
    /// behind to take this sample.
    fn deliver(&mut self, sample: &PositionSample) -> bool {
        let Some(subscribers) = self.live.get_mut(&sample.shipment_id) else {
            return false;
        };

        let mut gone = Vec::new();
        for (observer_id, sender) in subscribers.iter() {
            match sender.try_send(sample.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("observer {observer_id} is lagging, dropping live update");
                }
                Err(TrySendError::Closed(_)) => gone.push(*observer_id),
            }
        }
        for observer_id in gone {
            subscribers.remove(&observer_id);
            self.observers.remove(&observer_id);
        }
        if subscribers.is_empty() {
            self.live.remove(&sample.shipment_id);
            return false;
        }
        true
    }

    async fn subscribe(
        &mut self,
        subscription: Subscription,
        live: mpsc::Sender<PositionSample>,
    ) -> Replay {
        let Subscription {
            observer_id,
            shipment_id,
        } = subscription;
        self.unsubscribe(&observer_id);

        let stored = self.store.get(&shipment_id).await;
        let mut buffered = self.buffer.drain(&shipment_id).await;

        self.live
            .entry(shipment_id.clone())
            .or_default()
            .insert(observer_id, live);
        self.observers.insert(observer_id, shipment_id.clone());

        if let Some(late) = self.buffer.drain(&shipment_id).await {
            buffered = Some(late);
        }
        log::debug!("observer {observer_id} now follows {shipment_id}");

        Replay { stored, buffered }
    }

    fn unsubscribe(&mut self, observer_id: &ObserverId) {
        let Some(shipment_id) = self.observers.remove(observer_id) else {
            return;
        };
        if let Some(subscribers) = self.live.get_mut(&shipment_id) {
            subscribers.remove(observer_id);
            if subscribers.is_empty() {
                self.live.remove(&shipment_id);
            }
        }
        log::debug!("observer {observer_id} stopped following {shipment_id}");
    }
}

/// Runs the dispatcher. A panicking command is logged and the loop resumes
/// with the next one.
async fn run(
    mut dispatcher: Dispatcher,
    mut commands: mpsc::Receiver<Command>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };
        let result = AssertUnwindSafe(dispatcher.handle(command))
            .catch_unwind()
            .await;
        if let Err(why) = result {
            log::error!("tracking dispatcher panicked: {:?}", why);
        }
    }
    log::info!("tracking dispatcher stopped");
}

/// The tracking core of one process: latest positions, the buffer for
/// unwatched shipments, routed paths and the dispatch loop feeding
/// observer sessions.
pub struct TrackingService {
    config: TrackingConfig,
    store: Arc<PositionStore>,
    buffer: Arc<UpdateBuffer>,
    routes: Arc<RoutePathCache>,
    directory: Arc<dyn ShipmentDirectory>,
    commands: mpsc::Sender<Command>,
    cancel: CancellationToken,
    next_observer: AtomicU64,
}

impl TrackingService {
    /// Builds the service and spawns its dispatch loop on the current
    /// runtime.
    pub fn start(
        config: TrackingConfig,
        route_service: Arc<dyn RouteService>,
        directory: Arc<dyn ShipmentDirectory>,
    ) -> Arc<Self> {
        let store = Arc::new(PositionStore::new(config.store_policy));
        let buffer = Arc::new(UpdateBuffer::default());
        let routes = Arc::new(
            RoutePathCache::new(route_service, config.redraw_threshold_m)
                .with_fetch_timeout(config.route_timeout),
        );
        let (tx, rx) = mpsc::channel(config.command_queue.max(1));
        let cancel = CancellationToken::new();

        let dispatcher = Dispatcher {
            store: store.clone(),
            buffer: buffer.clone(),
            live: HashMap::new(),
            observers: HashMap::new(),
        };
        tokio::spawn(run(dispatcher, rx, cancel.clone()));
        log::info!("tracking service started");

        Arc::new(Self {
            config,
            store,
            buffer,
            routes,
            directory,
            commands: tx,
            cancel,
            next_observer: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    pub fn store(&self) -> &PositionStore {
        &self.store
    }

    pub fn buffer(&self) -> &UpdateBuffer {
        &self.buffer
    }

    pub fn routes(&self) -> &RoutePathCache {
        &self.routes
    }

    pub fn directory(&self) -> &dyn ShipmentDirectory {
        self.directory.as_ref()
    }

    pub async fn ingest(&self, sample: PositionSample) -> Result<(), ServiceError> {
        self.commands.send(Command::Ingest(sample)).await?;
        Ok(())
    }

    /// Stores a snapshot. Seeded positions reach live observers but are
    /// never buffered.
    pub async fn seed(&self, samples: Vec<PositionSample>) -> Result<(), ServiceError> {
        self.commands.send(Command::Seed(samples)).await?;
        Ok(())
    }

    pub async fn apply(&self, message: InboundMessage) -> Result<(), ServiceError> {
        match message {
            InboundMessage::Snapshot(samples) => self.seed(samples).await,
            InboundMessage::Update(sample) | InboundMessage::DriverSample { sample, .. } => {
                self.ingest(sample).await
            }
        }
    }

    /// Feeds a channel's decoded messages into the service until either
    /// side goes away.
    pub fn pipe_inbound(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<InboundMessage>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if let Err(why) = service.apply(message).await {
                    log::warn!("stopped forwarding inbound messages: {why}");
                    break;
                }
            }
        })
    }

    pub async fn snapshot(&self) -> HashMap<ShipmentId, PositionSample> {
        self.store.snapshot_all().await
    }

    pub fn open_session(self: &Arc<Self>) -> ObserverSession {
        let observer_id =
            ObserverId::new(self.next_observer.fetch_add(1, Ordering::Relaxed));
        ObserverSession::new(self.clone(), observer_id)
    }

    /// Registers `live` for the subscription's shipment and returns what
    /// the observer has to replay first.
    pub async fn subscribe(
        &self,
        subscription: Subscription,
        live: mpsc::Sender<PositionSample>,
    ) -> Result<Replay, ServiceError> {
        let (responder, response) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                subscription,
                live,
                responder,
            })
            .await?;
        Ok(response.await?)
    }

    pub async fn unsubscribe(&self, observer_id: ObserverId) -> Result<(), ServiceError> {
        self.commands
            .send(Command::Unsubscribe { observer_id })
            .await?;
        Ok(())
    }

    /// Non-blocking unsubscribe for use from `Drop`. If the queue is full
    /// the registration is pruned on the next delivery instead, once the
    /// dropped receiver is noticed.
    pub fn unsubscribe_now(&self, observer_id: ObserverId) {
        if let Err(TrySendError::Full(_)) =
            self.commands.try_send(Command::Unsubscribe { observer_id })
        {
            log::debug!("command queue full, observer {observer_id} is pruned lazily");
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.commands.is_closed()
    }
}

impl Drop for TrackingService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};
    use model::{position::SampleSource, Coordinate};

    use super::*;
    use crate::{directory::InMemoryDirectory, route::StraightLine};

    fn at(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    fn sample(shipment: &str, lat: f64, millis: i64) -> PositionSample {
        PositionSample::new(
            shipment.into(),
            Coordinate::new(lat, 121.0),
            Some(at(millis)),
            at(millis),
            SampleSource::Channel,
        )
        .unwrap()
    }

    fn service() -> Arc<TrackingService> {
        TrackingService::start(
            TrackingConfig::default(),
            Arc::new(StraightLine),
            Arc::new(InMemoryDirectory::default()),
        )
    }

    fn subscription(observer: u64, shipment: &str) -> Subscription {
        Subscription {
            observer_id: ObserverId::new(observer),
            shipment_id: shipment.into(),
        }
    }

    #[test]
    fn buffered_replay_wins_unless_older() {
        let replay = Replay {
            stored: Some(sample("S", 14.1, 2_000)),
            buffered: Some(sample("S", 14.2, 2_000)),
        };
        assert_eq!(replay.latest().map(|s| s.lat), Some(14.2));

        let replay = Replay {
            stored: Some(sample("S", 14.1, 2_000)),
            buffered: Some(sample("S", 14.2, 1_000)),
        };
        assert_eq!(replay.latest().map(|s| s.lat), Some(14.1));

        let replay = Replay {
            stored: Some(sample("S", 14.1, 2_000)),
            buffered: None,
        };
        assert_eq!(replay.latest().map(|s| s.lat), Some(14.1));
        assert_eq!(Replay::default().latest(), None);
    }

    #[tokio::test]
    async fn unwatched_updates_are_stored_and_buffered() {
        let service = service();
        service.ingest(sample("S", 14.1, 1_000)).await.unwrap();
        service.ingest(sample("S", 14.2, 2_000)).await.unwrap();

        let (live, _rx) = mpsc::channel(8);
        let replay = service.subscribe(subscription(1, "S"), live).await.unwrap();

        assert_eq!(replay.stored.map(|s| s.lat), Some(14.2));
        assert_eq!(replay.buffered.map(|s| s.lat), Some(14.2));
        assert!(service.buffer().is_empty().await);
    }

    #[tokio::test]
    async fn watched_updates_bypass_the_buffer() {
        let service = service();
        let (live, mut rx) = mpsc::channel(8);
        service.subscribe(subscription(1, "S"), live).await.unwrap();

        service.ingest(sample("S", 14.1, 1_000)).await.unwrap();
        service.ingest(sample("T", 14.5, 1_000)).await.unwrap();

        assert_eq!(rx.recv().await.map(|s| s.lat), Some(14.1));
        // round trip through the queue so both ingests are applied
        let (other, _other_rx) = mpsc::channel(1);
        service.subscribe(subscription(2, "U"), other).await.unwrap();

        assert_eq!(service.buffer().drain(&"S".into()).await, None);
        assert_eq!(
            service.buffer().drain(&"T".into()).await.map(|s| s.lat),
            Some(14.5)
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lagging_observers_still_keep_updates_out_of_the_buffer() {
        let service = service();
        let (live, mut rx) = mpsc::channel(1);
        service.subscribe(subscription(1, "S"), live).await.unwrap();

        service.ingest(sample("S", 14.1, 1_000)).await.unwrap();
        service.ingest(sample("S", 14.2, 2_000)).await.unwrap();
        let (other, _other_rx) = mpsc::channel(1);
        service.subscribe(subscription(2, "U"), other).await.unwrap();

        assert_eq!(service.buffer().drain(&"S".into()).await, None);
        assert_eq!(
            service.store().get(&"S".into()).await.map(|s| s.lat),
            Some(14.2)
        );
        assert_eq!(rx.recv().await.map(|s| s.lat), Some(14.1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_observers_are_pruned_and_updates_buffer_again() {
        let service = service();
        let (live, rx) = mpsc::channel(1);
        service.subscribe(subscription(1, "S"), live).await.unwrap();
        drop(rx);

        service.ingest(sample("S", 14.1, 1_000)).await.unwrap();
        let (other, _other_rx) = mpsc::channel(1);
        service.subscribe(subscription(2, "U"), other).await.unwrap();

        assert_eq!(
            service.buffer().drain(&"S".into()).await.map(|s| s.lat),
            Some(14.1)
        );
    }

    #[tokio::test]
    async fn resubscribing_moves_the_observer() {
        let service = service();
        let (live, mut rx) = mpsc::channel(8);
        service.subscribe(subscription(1, "S"), live.clone()).await.unwrap();
        service.subscribe(subscription(1, "T"), live).await.unwrap();

        service.ingest(sample("S", 14.1, 1_000)).await.unwrap();
        service.ingest(sample("T", 14.2, 1_000)).await.unwrap();

        assert_eq!(rx.recv().await.map(|s| s.shipment_id), Some("T".into()));
    }

    #[tokio::test]
    async fn unsubscribed_observers_receive_nothing() {
        let service = service();
        let (live, mut rx) = mpsc::channel(8);
        service.subscribe(subscription(1, "S"), live).await.unwrap();
        service.unsubscribe(ObserverId::new(1)).await.unwrap();
        service.ingest(sample("S", 14.1, 1_000)).await.unwrap();

        let (other, _other_rx) = mpsc::channel(1);
        service.subscribe(subscription(2, "U"), other).await.unwrap();
        assert!(rx.try_recv().is_err());
        assert!(service.buffer().drain(&"S".into()).await.is_some());
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_commands() {
        let service = service();
        service.shutdown();
        tokio::task::yield_now().await;
        assert!(!service.is_running());
        assert!(matches!(
            service.subscribe(subscription(1, "S"), mpsc::channel(1).0).await,
            Err(ServiceError::Stopped) | Err(ServiceError::ResponseError(_))
        ));
    }
}
