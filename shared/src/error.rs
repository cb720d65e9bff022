use thiserror::Error;

pub type OfficeResult<T> = Result<T, OfficeError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OfficeError {
    #[error("position ({x}, {y}) is outside the room bounds {width}x{height}")]
    OutOfBounds {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
    },

    #[error("user id '{0}' is already present in the room")]
    DuplicateId(String),

    #[error("session with {peer} could not be formed: {reason}")]
    SessionFormationFailed { peer: String, reason: String },

    #[error("missed deltas: expected version {expected}, received {received}")]
    StaleDelta { expected: u64, received: u64 },

    #[error("{0} disconnected without leaving")]
    DisconnectedAbruptly(String),

    #[error("invalid name '{0}': use up to 15 letters, numbers, underscores or hyphens")]
    InvalidName(String),

    #[error("unknown user '{0}'")]
    UnknownUser(String),

    #[error("room is closed")]
    RoomClosed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl OfficeError {
    /// Stable code used when the error crosses the wire in an `ErrorResponse`.
    pub fn code(&self) -> u8 {
        match self {
            Self::OutOfBounds { .. } => 1,
            Self::DuplicateId(_) => 2,
            Self::SessionFormationFailed { .. } => 3,
            Self::StaleDelta { .. } => 4,
            Self::DisconnectedAbruptly(_) => 5,
            Self::InvalidName(_) => 6,
            Self::UnknownUser(_) => 7,
            Self::RoomClosed => 8,
            Self::Protocol(_) => 9,
        }
    }

    /// The text that travels next to the code in an `ErrorResponse`.
    pub fn subject(&self) -> String {
        match self {
            Self::DuplicateId(subject)
            | Self::DisconnectedAbruptly(subject)
            | Self::InvalidName(subject)
            | Self::UnknownUser(subject)
            | Self::Protocol(subject) => subject.clone(),
            Self::RoomClosed => String::new(),
            other => other.to_string(),
        }
    }

    /// Rebuilds an error from its wire code and subject. Variants whose fields
    /// do not survive the trip come back as `Protocol` with the server's text.
    pub fn from_wire(code: u8, subject: String) -> Self {
        match code {
            2 => Self::DuplicateId(subject),
            5 => Self::DisconnectedAbruptly(subject),
            6 => Self::InvalidName(subject),
            7 => Self::UnknownUser(subject),
            8 => Self::RoomClosed,
            _ => Self::Protocol(subject),
        }
    }

    /// Errors the client recovers from on its own instead of showing the user.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OutOfBounds { .. } | Self::StaleDelta { .. } | Self::SessionFormationFailed { .. }
        )
    }
}
