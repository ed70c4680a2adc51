use std::{env, str::FromStr, time::Duration};

use crate::{channel::ReconnectPolicy, store::StorePolicy};

/// Tunables of the tracking core. Every field has a default; `from_env`
/// overrides individual values from `TRACKING_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingConfig {
    /// Minimum spacing of network sends per shipment.
    pub network_throttle: Duration,
    /// How long to wait for the first fix before reporting unavailability.
    pub initial_fix_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Movement below this distance (meters) does not move the marker.
    pub jitter_threshold_m: f64,
    /// Drift from a route's reference start (meters) that triggers a refetch.
    pub redraw_threshold_m: f64,
    /// Radius (meters) in which a waypoint counts as "reached" for ETA.
    pub waypoint_match_radius_m: f64,
    /// Routing calls running longer than this fall back to a straight line.
    pub route_timeout: Duration,
    pub store_policy: StorePolicy,
    pub command_queue: usize,
    pub live_queue: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            network_throttle: Duration::from_millis(2500),
            initial_fix_timeout: Duration::from_secs(8),
            reconnect: ReconnectPolicy::Fixed(Duration::from_millis(2500)),
            jitter_threshold_m: 3.0,
            redraw_threshold_m: 50.0,
            waypoint_match_radius_m: 30.0,
            route_timeout: Duration::from_secs(10),
            store_policy: StorePolicy::LastWriterWins,
            command_queue: 256,
            live_queue: 64,
        }
    }
}

impl TrackingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let reconnect = match (
            env_parse::<u64>("TRACKING_RECONNECT_DELAY_MS"),
            env_parse::<u64>("TRACKING_RECONNECT_MAX_MS"),
        ) {
            (Some(initial), Some(max)) => ReconnectPolicy::Exponential {
                initial: Duration::from_millis(initial),
                max: Duration::from_millis(max),
            },
            (Some(delay), None) => ReconnectPolicy::Fixed(Duration::from_millis(delay)),
            _ => defaults.reconnect,
        };

        let store_policy = match env::var("TRACKING_IGNORE_OLDER").ok().as_deref() {
            Some("1") | Some("true") => StorePolicy::IgnoreOlder,
            _ => defaults.store_policy,
        };

        Self {
            network_throttle: env_parse("TRACKING_NETWORK_THROTTLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.network_throttle),
            initial_fix_timeout: env_parse("TRACKING_FIX_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_fix_timeout),
            reconnect,
            jitter_threshold_m: env_parse("TRACKING_JITTER_M")
                .unwrap_or(defaults.jitter_threshold_m),
            redraw_threshold_m: env_parse("TRACKING_REDRAW_M")
                .unwrap_or(defaults.redraw_threshold_m),
            waypoint_match_radius_m: env_parse("TRACKING_MATCH_RADIUS_M")
                .unwrap_or(defaults.waypoint_match_radius_m),
            route_timeout: env_parse("TRACKING_ROUTE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.route_timeout),
            store_policy,
            command_queue: env_parse("TRACKING_COMMAND_QUEUE")
                .unwrap_or(defaults.command_queue),
            live_queue: env_parse("TRACKING_LIVE_QUEUE").unwrap_or(defaults.live_queue),
        }
    }
}

/// Reads and parses an environment variable. Unset or unparsable values are
/// treated as absent; the latter is logged.
pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring unparsable value `{raw}` for {key}");
            None
        }
    }
}
