//! Processes that talk to the hub: a driver replaying a recorded track and
//! a monitor following one shipment.

pub mod config;
pub mod connector;

pub use config::AgentConfig;
pub use connector::WsConnector;
