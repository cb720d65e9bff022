use crate::{error::OfficeError, tcp_command_payload_type::TcpCommandPayloadType};

const COMMAND_BYTE_OFFSET: u8 = 69;

macro_rules! tcp_command_id_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident => $payload:ident),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, PartialEq, Eq, Clone, Copy)]
        #[repr(u8)]
        $vis enum $name {
            $($variant),*
        }

        impl $name {
            pub fn to_byte(&self) -> u8 {
                (*self as u8).wrapping_add(COMMAND_BYTE_OFFSET)
            }

            pub fn from_byte(byte: u8) -> Result<Self, OfficeError> {
                match byte.wrapping_sub(COMMAND_BYTE_OFFSET) {
                    $(x if x == $name::$variant as u8 => Ok($name::$variant),)*
                    _ => Err(OfficeError::Protocol(format!("invalid command id byte {}", byte))),
                }
            }

            pub fn get_payload_type(&self) -> TcpCommandPayloadType {
                match self {
                    $($name::$variant => TcpCommandPayloadType::$payload,)*
                }
            }
        }
    };
}

tcp_command_id_enum! {
    pub enum TcpCommandId {
        // client -> server
        HelloFromClient => Bytes,
        MoveTo => Bytes,
        SetStatus => Bytes,
        SendChat => Bytes,
        RequestSnapshot => Simple,
        Heartbeat => Simple,
        LeaveRoom => Simple,
        GetRoomList => Simple,

        // server -> client
        RoomSnapshot => Bytes,
        PresenceDelta => Bytes,
        MoveAck => Bytes,
        ChatRelay => Bytes,
        RoomList => StringList,
        ErrorResponse => Bytes,

        // both directions; the peer field names the target going up and the
        // sender coming down
        SessionDescription => Bytes,
    }
}
