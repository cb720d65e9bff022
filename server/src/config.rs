use std::time::Duration;

use shared::types::RoomBounds;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tcp_addr: String,
    pub bounds: RoomBounds,
    pub idle_timeout: Duration,
    pub outbox_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tcp_addr: format!("0.0.0.0:{}", shared::TCP_PORT),
            bounds: RoomBounds::default(),
            idle_timeout: Duration::from_secs(shared::IDLE_TIMEOUT_SECS),
            outbox_capacity: 64,
        }
    }
}
