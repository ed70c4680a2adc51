//! Live position tracking: sampling, the transport channel, the latest
//! position store and per-observer sessions with route and ETA updates.

pub mod buffer;
pub mod channel;
pub mod config;
pub mod directory;
pub mod eta;
pub mod location;
pub mod marker;
pub mod route;
pub mod service;
pub mod session;
pub mod store;
pub mod wire;

pub use config::TrackingConfig;
pub use service::TrackingService;
pub use session::{ObserverSession, SessionEvent};
