pub mod error;
pub mod message;
pub mod proximity;
pub mod received_tcp_command;
pub mod tcp_command;
pub mod tcp_command_id;
pub mod tcp_command_payload_type;
pub mod types;
pub mod wire;

pub const TCP_PORT: u16 = 8040;

pub const MAX_NAME_LENGTH: usize = 15;
pub const MAX_DISPLAY_NAME_LENGTH: usize = 32;
pub const MAX_CHAT_LENGTH: usize = 500;

/// Upper bound, in bytes, on a relayed session description. Keeps the relayed
/// frame well inside the u16 length of a `Bytes` payload.
pub const MAX_DESCRIPTION_LENGTH: usize = 16 * 1024;

/// Room lists travel as a `StringList`, whose entry count is a single byte.
pub const MAX_ROOM_LIST: usize = u8::MAX as usize;

/// Maximum distance (inclusive) at which two users count as nearby.
pub const PROXIMITY_THRESHOLD: f64 = 150.0;

pub const DEFAULT_ROOM_WIDTH: f64 = 2000.0;
pub const DEFAULT_ROOM_HEIGHT: f64 = 1200.0;

pub const DEFAULT_TICK_MS: u64 = 16;
pub const DEFAULT_GRACE_MS: u64 = 1500;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;
pub const IDLE_TIMEOUT_SECS: u64 = 15;

pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
