use std::fmt;

use chrono::{DateTime, Utc};
use strum_macros::{Display, EnumIter, EnumString};

use crate::{MAX_NAME_LENGTH, error::OfficeError, is_valid_name};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, OfficeError> {
        if raw.len() > MAX_NAME_LENGTH || !is_valid_name(raw) {
            return Err(OfficeError::InvalidName(raw.to_string()));
        }

        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance_squared(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    pub fn distance(&self, other: &Position) -> f64 {
        self.distance_squared(other).sqrt()
    }

    pub fn offset(&self, dx: f64, dy: f64) -> Self {
        Self::new(self.x + dx, self.y + dy)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.1}, {:.1})", self.x, self.y)
    }
}

/// The rectangle `[0, width] x [0, height]` every position must fall in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoomBounds {
    pub width: f64,
    pub height: f64,
}

impl RoomBounds {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, position: &Position) -> bool {
        position.x.is_finite()
            && position.y.is_finite()
            && (0.0..=self.width).contains(&position.x)
            && (0.0..=self.height).contains(&position.y)
    }

    pub fn check(&self, position: &Position) -> Result<(), OfficeError> {
        if self.contains(position) {
            Ok(())
        } else {
            Err(OfficeError::OutOfBounds {
                x: position.x,
                y: position.y,
                width: self.width,
                height: self.height,
            })
        }
    }
}

impl Default for RoomBounds {
    fn default() -> Self {
        Self::new(crate::DEFAULT_ROOM_WIDTH, crate::DEFAULT_ROOM_HEIGHT)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Status {
    #[default]
    Online,
    Away,
    Busy,
    Offline,
}

impl Status {
    pub fn to_byte(self) -> u8 {
        match self {
            Status::Online => 0,
            Status::Away => 1,
            Status::Busy => 2,
            Status::Offline => 3,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, OfficeError> {
        match byte {
            0 => Ok(Status::Online),
            1 => Ok(Status::Away),
            2 => Ok(Status::Busy),
            3 => Ok(Status::Offline),
            _ => Err(OfficeError::Protocol(format!("invalid status byte {}", byte))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserPresence {
    pub id: UserId,
    pub display_name: String,
    pub position: Position,
    pub mic_on: bool,
    pub camera_on: bool,
    pub status: Status,
}

impl UserPresence {
    pub fn new(id: UserId, display_name: &str, position: Position) -> Self {
        Self {
            id,
            display_name: display_name.to_string(),
            position,
            mic_on: false,
            camera_on: false,
            status: Status::Online,
        }
    }
}

/// Partial status change; `None` fields are left untouched.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StatusUpdate {
    pub mic_on: Option<bool>,
    pub camera_on: Option<bool>,
    pub status: Option<Status>,
}

impl StatusUpdate {
    pub fn is_empty(&self) -> bool {
        self.mic_on.is_none() && self.camera_on.is_none() && self.status.is_none()
    }

    pub fn apply_to(&self, presence: &mut UserPresence) {
        if let Some(mic_on) = self.mic_on {
            presence.mic_on = mic_on;
        }
        if let Some(camera_on) = self.camera_on {
            presence.camera_on = camera_on;
        }
        if let Some(status) = self.status {
            presence.status = status;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ChatScope {
    Office,
    Global,
}

impl ChatScope {
    pub fn to_byte(self) -> u8 {
        match self {
            ChatScope::Office => 0,
            ChatScope::Global => 1,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, OfficeError> {
        match byte {
            0 => Ok(ChatScope::Office),
            1 => Ok(ChatScope::Global),
            _ => Err(OfficeError::Protocol(format!("invalid chat scope {}", byte))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: u64,
    pub user_id: UserId,
    pub username: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub scope: ChatScope,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemberState {
    pub presence: UserPresence,
    pub seq: u64,
}

/// Full room state, sent on join and whenever a client has to resync.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub version: u64,
    pub bounds: RoomBounds,
    pub members: Vec<MemberState>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresenceChange {
    Joined(UserPresence),
    Moved {
        user: UserId,
        seq: u64,
        position: Position,
    },
    StatusChanged {
        user: UserId,
        seq: u64,
        mic_on: bool,
        camera_on: bool,
        status: Status,
    },
    Left {
        user: UserId,
    },
}

impl PresenceChange {
    pub fn user(&self) -> &UserId {
        match self {
            PresenceChange::Joined(presence) => &presence.id,
            PresenceChange::Moved { user, .. }
            | PresenceChange::StatusChanged { user, .. }
            | PresenceChange::Left { user } => user,
        }
    }
}

/// One authoritative mutation, stamped with the room version it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceDelta {
    pub version: u64,
    pub change: PresenceChange,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveAck {
    pub move_id: u32,
    pub accepted: bool,
    pub position: Position,
}
