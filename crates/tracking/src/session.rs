use std::{collections::VecDeque, error, fmt, sync::Arc};

use model::{
    position::PositionSample,
    route::RoutePath,
    shipment::{ObserverId, ShipmentId, Subscription},
    Coordinate,
};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    eta::{Eta, EtaEstimator},
    marker::{MarkerTracker, MarkerUpdate},
    service::{ServiceError, TrackingService},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Inactive,
    Activating,
    Active,
}

/// Something the map view has to render.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    Position(MarkerUpdate),
    Route(RoutePath),
    Eta(Eta),
}

impl SessionEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionEvent::Position(_) => "position",
            SessionEvent::Route(_) => "route",
            SessionEvent::Eta(_) => "eta",
        }
    }
}

#[derive(Debug)]
pub enum SessionError {
    Service(ServiceError),
}

impl error::Error for SessionError {}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SessionError::Service(e) => write!(f, "could not activate session: {e}"),
        }
    }
}

impl From<ServiceError> for SessionError {
    fn from(why: ServiceError) -> Self {
        Self::Service(why)
    }
}

/// One consumer's view of a single shipment.
///
/// Activation replays the latest known position before any live update,
/// then fetches a fresh route. Afterwards every live sample is turned into
/// marker, route and ETA events. Dropping the session unregisters it.
pub struct ObserverSession {
    service: Arc<TrackingService>,
    observer_id: ObserverId,
    state: SessionState,
    shipment_id: Option<ShipmentId>,
    destination: Option<Coordinate>,
    live: Option<mpsc::Receiver<PositionSample>>,
    pending: VecDeque<SessionEvent>,
    marker: MarkerTracker,
    eta: EtaEstimator,
}

impl ObserverSession {
    pub(crate) fn new(service: Arc<TrackingService>, observer_id: ObserverId) -> Self {
        let config = service.config();
        let marker = MarkerTracker::new(config.jitter_threshold_m);
        let eta = EtaEstimator::new(config.waypoint_match_radius_m);
        Self {
            service,
            observer_id,
            state: SessionState::Inactive,
            shipment_id: None,
            destination: None,
            live: None,
            pending: VecDeque::new(),
            marker,
            eta,
        }
    }

    pub fn observer_id(&self) -> ObserverId {
        self.observer_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn shipment_id(&self) -> Option<&ShipmentId> {
        self.shipment_id.as_ref()
    }

    pub fn last_eta(&self) -> Option<Eta> {
        self.shipment_id
            .as_ref()
            .and_then(|shipment_id| self.eta.last(shipment_id))
    }

    /// Starts following `shipment_id`, leaving any shipment followed so far.
    pub async fn activate(&mut self, shipment_id: ShipmentId) -> Result<(), SessionError> {
        if self.shipment_id.is_some() {
            self.deactivate().await;
        }
        self.state = SessionState::Activating;

        let (tx, rx) = mpsc::channel(self.service.config().live_queue.max(1));
        let subscription = Subscription {
            observer_id: self.observer_id,
            shipment_id: shipment_id.clone(),
        };
        let replay = match self.service.subscribe(subscription, tx).await {
            Ok(replay) => replay,
            Err(why) => {
                self.state = SessionState::Inactive;
                return Err(why.into());
            }
        };
        self.shipment_id = Some(shipment_id.clone());
        self.live = Some(rx);

        let latest = replay.latest().cloned();
        if let Some(sample) = &latest {
            if let Some(update) = self.marker.advance(sample) {
                self.pending.push_back(SessionEvent::Position(update));
            }
            self.eta.update(sample, None);
        }

        let endpoints = self.service.directory().endpoints(&shipment_id).await;
        self.destination = endpoints.map(|endpoints| endpoints.destination);
        let origin = latest
            .as_ref()
            .map(PositionSample::position)
            .or(endpoints.map(|endpoints| endpoints.origin));
        match (origin, self.destination) {
            (Some(origin), Some(destination)) => {
                let path = self
                    .service
                    .routes()
                    .refresh(&shipment_id, origin, destination)
                    .await;
                self.pending.push_back(SessionEvent::Route(path));
            }
            _ => log::debug!("no endpoints for {shipment_id}, following without a route"),
        }

        self.state = SessionState::Active;
        log::info!("observer {} following {shipment_id}", self.observer_id);
        Ok(())
    }

    /// Stops following the current shipment. Store and buffer keep
    /// collecting its updates.
    pub async fn deactivate(&mut self) {
        let Some(shipment_id) = self.shipment_id.take() else {
            return;
        };
        if let Err(why) = self.service.unsubscribe(self.observer_id).await {
            log::debug!("unsubscribe of observer {}: {why}", self.observer_id);
        }
        self.live = None;
        self.destination = None;
        self.pending.clear();
        self.marker.reset();
        self.eta.forget(&shipment_id);
        self.state = SessionState::Inactive;
        log::info!("observer {} left {shipment_id}", self.observer_id);
    }

    /// Waits for the next event to render. Returns `None` once the session
    /// is inactive or the service has stopped.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let sample = self.live.as_mut()?.recv().await;
            match sample {
                Some(sample) => self.process(sample).await,
                None => {
                    log::warn!("live updates for observer {} ended", self.observer_id);
                    self.live = None;
                    self.shipment_id = None;
                    self.state = SessionState::Inactive;
                    return None;
                }
            }
        }
    }

    async fn process(&mut self, sample: PositionSample) {
        if self.shipment_id.as_ref() != Some(&sample.shipment_id) {
            return;
        }
        if let Some(update) = self.marker.advance(&sample) {
            self.pending.push_back(SessionEvent::Position(update));
        }

        let path = match self.destination {
            Some(destination) => {
                let routes = self.service.routes();
                let cached = routes.get(&sample.shipment_id).await;
                let path = routes
                    .get_or_fetch(&sample.shipment_id, sample.position(), destination)
                    .await;
                if cached.as_ref() != Some(&path) {
                    self.pending.push_back(SessionEvent::Route(path.clone()));
                }
                Some(path)
            }
            None => None,
        };

        if let Some(eta) = self.eta.update(&sample, path.as_ref()) {
            self.pending.push_back(SessionEvent::Eta(eta));
        }
    }
}

impl Drop for ObserverSession {
    fn drop(&mut self) {
        if self.shipment_id.is_some() {
            self.service.unsubscribe_now(self.observer_id);
        }
    }
}
