use std::time::Duration;

use shared::{
    DEFAULT_GRACE_MS, DEFAULT_TICK_MS, HEARTBEAT_INTERVAL_SECS, PROXIMITY_THRESHOLD,
    TCP_PORT, types::Position,
};

use crate::media::MediaConstraints;

pub const DEFAULT_CHAT_HISTORY: usize = 200;
pub const DEFAULT_FORMATION_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// How long a peer may stay out of range before it is dropped from the session.
    pub grace: Duration,
    /// Upper bound on a single description exchange.
    pub formation_timeout: Duration,
    pub constraints: MediaConstraints,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            formation_timeout: Duration::from_secs(DEFAULT_FORMATION_TIMEOUT_SECS),
            constraints: MediaConstraints::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub room: String,
    pub username: String,
    pub display_name: String,
    pub start: Position,
    pub tick: Duration,
    pub heartbeat: Duration,
    pub threshold: f64,
    pub chat_history: usize,
    pub mesh: MeshConfig,
}

impl ClientConfig {
    pub fn new(username: &str) -> Self {
        Self {
            server_addr: format!("127.0.0.1:{}", TCP_PORT),
            room: "lobby".to_string(),
            username: username.to_string(),
            display_name: username.to_string(),
            start: Position::new(100.0, 100.0),
            tick: Duration::from_millis(DEFAULT_TICK_MS),
            heartbeat: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            threshold: PROXIMITY_THRESHOLD,
            chat_history: DEFAULT_CHAT_HISTORY,
            mesh: MeshConfig::default(),
        }
    }
}
