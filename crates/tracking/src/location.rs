//! Sampling of the device's position.
//!
//! A [`LocationSource`] pulls fixes from a [`Positioning`] capability,
//! validates them and reports two kinds of events: every valid sample is
//! reported for local display, and a throttled subset is reported for
//! sending over the network.

use std::{
    collections::{HashMap, VecDeque},
    error, fmt,
    fs::File,
    io,
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{
    position::{PositionSample, SampleSource},
    shipment::ShipmentId,
    Coordinate,
};
use serde::Deserialize;
use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{sleep_until, timeout_at, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::config::TrackingConfig;

/// A raw reading of the positioning capability.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fix {
    pub position: Coordinate,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PositioningError {
    /// The device has no positioning capability.
    Unavailable(String),
    PermissionDenied,
    /// No first fix arrived within the acquisition timeout.
    TimedOut,
    /// A recorded track could not be read.
    Track(String),
}

impl error::Error for PositioningError {}

impl fmt::Display for PositioningError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unavailable(why) => write!(f, "positioning unavailable: {why}"),
            Self::PermissionDenied => write!(f, "positioning permission denied"),
            Self::TimedOut => write!(f, "no position fix acquired in time"),
            Self::Track(why) => write!(f, "could not read track: {why}"),
        }
    }
}

impl From<csv::Error> for PositioningError {
    fn from(e: csv::Error) -> Self {
        PositioningError::Track(e.to_string())
    }
}

impl From<io::Error> for PositioningError {
    fn from(e: io::Error) -> Self {
        PositioningError::Track(e.to_string())
    }
}

#[async_trait]
pub trait Positioning: Send + 'static {
    /// Waits for the next fix. `Ok(None)` means the capability has finished
    /// and will not produce more fixes.
    ///
    /// Implementations must be cancel safe: dropping the future before it
    /// completes must not lose a fix.
    async fn next_fix(&mut self) -> Result<Option<Fix>, PositioningError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocationEvent {
    /// A valid sample for local display.
    Local(PositionSample),
    /// A valid sample that passed the network throttle.
    Network(PositionSample),
    /// The capability cannot deliver positions. Non-fatal.
    Unavailable(PositioningError),
}

/// Admits at most one network send per shipment per interval.
#[derive(Debug)]
pub struct NetworkThrottle {
    interval: Duration,
    last_sent: HashMap<ShipmentId, Instant>,
}

impl NetworkThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: HashMap::new(),
        }
    }

    pub fn admit(&mut self, shipment_id: &ShipmentId, now: Instant) -> bool {
        match self.last_sent.get(shipment_id) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            _ => {
                self.last_sent.insert(shipment_id.clone(), now);
                true
            }
        }
    }
}

pub struct LocationSource<P: Positioning> {
    shipment_id: ShipmentId,
    positioning: Arc<Mutex<P>>,
    network_throttle: Duration,
    initial_fix_timeout: Duration,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl<P: Positioning> LocationSource<P> {
    pub fn new(shipment_id: ShipmentId, positioning: P, config: &TrackingConfig) -> Self {
        Self {
            shipment_id,
            positioning: Arc::new(Mutex::new(positioning)),
            network_throttle: config.network_throttle,
            initial_fix_timeout: config.initial_fix_timeout,
            cancel: None,
            task: None,
        }
    }

    /// True between `start` and `stop` while the sampling task lives. A
    /// stopped source reports false even before its task has wound down.
    pub fn is_running(&self) -> bool {
        self.cancel.is_some() && self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Starts emitting events to `callback`. Calling `start` on a running
    /// source does nothing.
    pub fn start<F>(&mut self, callback: F)
    where
        F: FnMut(LocationEvent) + Send + 'static,
    {
        if self.is_running() {
            log::debug!("location source for {} already running", self.shipment_id);
            return;
        }
        let cancel = CancellationToken::new();
        let sampler = Sampler {
            shipment_id: self.shipment_id.clone(),
            throttle: NetworkThrottle::new(self.network_throttle),
            initial_fix_timeout: self.initial_fix_timeout,
        };
        self.task = Some(tokio::spawn(sampler.run(
            self.positioning.clone(),
            callback,
            cancel.clone(),
        )));
        self.cancel = Some(cancel);
    }

    /// Stops emission. Safe to call any number of times.
    pub fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
    }

    /// Waits until the sampling task has ended.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(why) = task.await {
                log::error!("location task for {} failed: {why}", self.shipment_id);
            }
        }
    }
}

impl<P: Positioning> Drop for LocationSource<P> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Sampler {
    shipment_id: ShipmentId,
    throttle: NetworkThrottle,
    initial_fix_timeout: Duration,
}

impl Sampler {
    async fn run<P, F>(
        mut self,
        positioning: Arc<Mutex<P>>,
        mut callback: F,
        cancel: CancellationToken,
    ) where
        P: Positioning,
        F: FnMut(LocationEvent) + Send + 'static,
    {
        let mut positioning = positioning.lock().await;
        let acquire_deadline = Instant::now() + self.initial_fix_timeout;
        let mut acquiring = true;

        loop {
            let result = if acquiring {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = timeout_at(acquire_deadline, positioning.next_fix()) => match result {
                        Ok(result) => result,
                        Err(_) => {
                            log::warn!("no fix for {} after {:?}", self.shipment_id, self.initial_fix_timeout);
                            callback(LocationEvent::Unavailable(PositioningError::TimedOut));
                            acquiring = false;
                            continue;
                        }
                    },
                }
            } else {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = positioning.next_fix() => result,
                }
            };

            match result {
                Ok(Some(fix)) => {
                    let sample = PositionSample::new(
                        self.shipment_id.clone(),
                        fix.position,
                        fix.timestamp,
                        Utc::now(),
                        SampleSource::Device,
                    );
                    let Some(sample) = sample else {
                        log::debug!("discarding invalid fix {:?}", fix.position);
                        continue;
                    };
                    acquiring = false;
                    callback(LocationEvent::Local(sample.clone()));
                    if self.throttle.admit(&sample.shipment_id, Instant::now()) {
                        callback(LocationEvent::Network(sample));
                    }
                }
                Ok(None) => {
                    log::info!("positioning for {} finished", self.shipment_id);
                    break;
                }
                Err(why) => {
                    log::warn!("positioning for {} stopped: {why}", self.shipment_id);
                    callback(LocationEvent::Unavailable(why));
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TrackRow {
    latitude: f64,
    longitude: f64,
    offset_ms: u64,
}

/// Replays a recorded track at its recorded cadence. Offsets are relative
/// to the first call of `next_fix`.
#[derive(Debug, Clone)]
pub struct ReplayPositioning {
    fixes: VecDeque<(Duration, Coordinate)>,
    started: Option<Instant>,
}

impl ReplayPositioning {
    pub fn new(fixes: Vec<(Duration, Coordinate)>) -> Self {
        Self {
            fixes: fixes.into(),
            started: None,
        }
    }

    /// Reads a CSV track with `latitude,longitude,offset_ms` columns.
    pub fn from_csv<R: io::Read>(reader: R) -> Result<Self, PositioningError> {
        let mut fixes = vec![];
        for row in csv::Reader::from_reader(reader).deserialize::<TrackRow>() {
            let row = row?;
            fixes.push((
                Duration::from_millis(row.offset_ms),
                Coordinate::new(row.latitude, row.longitude),
            ));
        }
        Ok(Self::new(fixes))
    }

    pub fn from_path<Q: AsRef<Path>>(path: Q) -> Result<Self, PositioningError> {
        Self::from_csv(File::open(path)?)
    }

    pub fn remaining(&self) -> usize {
        self.fixes.len()
    }
}

#[async_trait]
impl Positioning for ReplayPositioning {
    async fn next_fix(&mut self) -> Result<Option<Fix>, PositioningError> {
        let started = *self.started.get_or_insert_with(Instant::now);
        let Some(&(offset, position)) = self.fixes.front() else {
            return Ok(None);
        };
        sleep_until(started + offset).await;
        self.fixes.pop_front();
        Ok(Some(Fix {
            position,
            timestamp: Some(Utc::now()),
        }))
    }
}

/// Stand-in for devices without positioning support.
#[derive(Debug, Clone)]
pub struct NoPositioning(pub PositioningError);

#[async_trait]
impl Positioning for NoPositioning {
    async fn next_fix(&mut self) -> Result<Option<Fix>, PositioningError> {
        Err(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    struct Silent;

    #[async_trait]
    impl Positioning for Silent {
        async fn next_fix(&mut self) -> Result<Option<Fix>, PositioningError> {
            std::future::pending().await
        }
    }

    fn collect<P: Positioning>(
        positioning: P,
    ) -> (LocationSource<P>, mpsc::UnboundedReceiver<LocationEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source =
            LocationSource::new("SHP-1".into(), positioning, &TrackingConfig::default());
        source.start(move |event| {
            let _ = tx.send(event);
        });
        (source, rx)
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<LocationEvent>) -> Vec<LocationEvent> {
        let mut events = vec![];
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    #[test]
    fn throttle_is_per_shipment() {
        let start = Instant::now();
        let mut throttle = NetworkThrottle::new(Duration::from_millis(2500));
        let a: ShipmentId = "A".into();
        let b: ShipmentId = "B".into();

        assert!(throttle.admit(&a, start));
        assert!(!throttle.admit(&a, start + Duration::from_millis(1000)));
        assert!(throttle.admit(&b, start + Duration::from_millis(1000)));
        assert!(!throttle.admit(&a, start + Duration::from_millis(2499)));
        assert!(throttle.admit(&a, start + Duration::from_millis(2500)));
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_gates_network_events_only() {
        let track = ReplayPositioning::new(vec![
            (Duration::from_millis(0), Coordinate::new(14.0, 121.0)),
            (Duration::from_millis(1000), Coordinate::new(14.0001, 121.0)),
            (Duration::from_millis(2000), Coordinate::new(14.0002, 121.0)),
            (Duration::from_millis(3000), Coordinate::new(14.0003, 121.0)),
        ]);
        let (_source, rx) = collect(track);
        let events = drain(rx).await;

        let local = events
            .iter()
            .filter(|event| matches!(event, LocationEvent::Local(_)))
            .count();
        let network: Vec<f64> = events
            .iter()
            .filter_map(|event| match event {
                LocationEvent::Network(sample) => Some(sample.lat),
                _ => None,
            })
            .collect();
        assert_eq!(local, 4);
        assert_eq!(network, vec![14.0, 14.0003]);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_fixes_are_rejected() {
        let track = ReplayPositioning::new(vec![
            (Duration::from_millis(0), Coordinate::new(0.0, 0.0)),
            (Duration::from_millis(100), Coordinate::new(f64::NAN, 121.0)),
            (Duration::from_millis(200), Coordinate::new(14.0, 121.0)),
        ]);
        let (_source, rx) = collect(track);
        let events = drain(rx).await;

        assert_eq!(events.len(), 2);
        match &events[0] {
            LocationEvent::Local(sample) => {
                assert_eq!(sample.position(), Coordinate::new(14.0, 121.0));
                assert_eq!(sample.source, SampleSource::Device);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn permission_denied_is_reported_once() {
        let (mut source, rx) = collect(NoPositioning(PositioningError::PermissionDenied));
        let events = drain(rx).await;

        assert_eq!(
            events,
            vec![LocationEvent::Unavailable(PositioningError::PermissionDenied)]
        );
        source.join().await;
        assert!(!source.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn first_fix_timeout_notifies_and_stop_is_idempotent() {
        let (mut source, mut rx) = collect(Silent);

        let event = rx.recv().await;
        assert_eq!(
            event,
            Some(LocationEvent::Unavailable(PositioningError::TimedOut))
        );

        source.stop();
        source.stop();
        source.join().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn start_on_running_source_is_a_no_op() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source =
            LocationSource::new("SHP-1".into(), Silent, &TrackingConfig::default());
        let first = tx.clone();
        source.start(move |event| {
            let _ = first.send(("first", event));
        });
        source.start(move |event| {
            let _ = tx.send(("second", event));
        });

        let (origin, _) = rx.recv().await.unwrap();
        assert_eq!(origin, "first");
        source.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn start_right_after_stop_uses_the_new_callback() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut source =
            LocationSource::new("SHP-1".into(), Silent, &TrackingConfig::default());
        let first = tx.clone();
        source.start(move |event| {
            let _ = first.send(("first", event));
        });
        tokio::task::yield_now().await;
        source.stop();
        assert!(!source.is_running());

        source.start(move |event| {
            let _ = tx.send(("second", event));
        });
        assert!(source.is_running());

        let (origin, event) = rx.recv().await.unwrap();
        assert_eq!(origin, "second");
        assert_eq!(event, LocationEvent::Unavailable(PositioningError::TimedOut));
        source.stop();
    }

    #[test]
    fn track_is_read_from_csv() {
        let csv = "latitude,longitude,offset_ms\n14.6,121.0,0\n14.61,121.01,2500\n";
        let track = ReplayPositioning::from_csv(csv.as_bytes()).unwrap();
        assert_eq!(track.remaining(), 2);
        assert!(ReplayPositioning::from_csv("latitude\nabc\n".as_bytes()).is_err());
    }
}
