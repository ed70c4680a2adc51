use std::{env, net::SocketAddr};

use tracking::config::env_parse;

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub bind: SocketAddr,
    /// Base URL of the routing service. Without one every route is a
    /// straight line.
    pub routing_url: Option<String>,
    pub relay_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 8080)),
            routing_url: None,
            relay_capacity: 256,
        }
    }
}

impl HubConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env_parse("HUB_BIND").unwrap_or(defaults.bind),
            routing_url: env::var("ROUTING_URL").ok().filter(|url| !url.is_empty()),
            relay_capacity: env_parse("HUB_RELAY_CAPACITY").unwrap_or(defaults.relay_capacity),
        }
    }
}
