//! Logical messages exchanged between office clients and the server, and their
//! mapping onto `TcpCommand` frames.

use chrono::DateTime;

use crate::{
    error::OfficeError,
    tcp_command::TcpCommand,
    tcp_command_id::TcpCommandId,
    types::{
        ChatMessage, ChatScope, MemberState, MoveAck, Position, PresenceChange, PresenceDelta,
        RoomBounds, RoomSnapshot, SessionId, Status, StatusUpdate, UserId, UserPresence,
    },
    wire::{ByteReader, ByteWriter},
};

const MIC_BIT: u8 = 0b001;
const CAMERA_BIT: u8 = 0b010;
const STATUS_BIT: u8 = 0b100;

const DELTA_JOINED: u8 = 0;
const DELTA_MOVED: u8 = 1;
const DELTA_STATUS: u8 = 2;
const DELTA_LEFT: u8 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Hello {
        room: String,
        presence: UserPresence,
    },
    MoveTo {
        move_id: u32,
        position: Position,
    },
    SetStatus(StatusUpdate),
    SendChat {
        scope: ChatScope,
        body: String,
    },
    SessionDescription {
        peer: UserId,
        session: SessionId,
        description: String,
    },
    RequestSnapshot,
    Heartbeat,
    LeaveRoom,
    GetRoomList,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    Snapshot(RoomSnapshot),
    Delta(PresenceDelta),
    MoveAck(MoveAck),
    Chat(ChatMessage),
    SessionDescription {
        peer: UserId,
        session: SessionId,
        description: String,
    },
    RoomList(Vec<String>),
    Error(OfficeError),
}

impl ClientMessage {
    pub fn into_command(self) -> TcpCommand {
        match self {
            ClientMessage::Hello { room, presence } => {
                let mut writer = ByteWriter::new();
                writer.str(&room);
                write_presence(&mut writer, &presence);
                TcpCommand::Bytes(TcpCommandId::HelloFromClient, writer.finish())
            }
            ClientMessage::MoveTo { move_id, position } => TcpCommand::Bytes(
                TcpCommandId::MoveTo,
                ByteWriter::new().u32(move_id).position(&position).finish(),
            ),
            ClientMessage::SetStatus(update) => {
                let mut writer = ByteWriter::new();
                write_status_update(&mut writer, &update);
                TcpCommand::Bytes(TcpCommandId::SetStatus, writer.finish())
            }
            ClientMessage::SendChat { scope, body } => TcpCommand::Bytes(
                TcpCommandId::SendChat,
                ByteWriter::new().u8(scope.to_byte()).str(&body).finish(),
            ),
            ClientMessage::SessionDescription {
                peer,
                session,
                description,
            } => session_description_command(&peer, session, &description),
            ClientMessage::RequestSnapshot => TcpCommand::Simple(TcpCommandId::RequestSnapshot),
            ClientMessage::Heartbeat => TcpCommand::Simple(TcpCommandId::Heartbeat),
            ClientMessage::LeaveRoom => TcpCommand::Simple(TcpCommandId::LeaveRoom),
            ClientMessage::GetRoomList => TcpCommand::Simple(TcpCommandId::GetRoomList),
        }
    }

    pub fn from_command(command: TcpCommand) -> Result<Self, OfficeError> {
        let message = match command {
            TcpCommand::Simple(TcpCommandId::RequestSnapshot) => ClientMessage::RequestSnapshot,
            TcpCommand::Simple(TcpCommandId::Heartbeat) => ClientMessage::Heartbeat,
            TcpCommand::Simple(TcpCommandId::LeaveRoom) => ClientMessage::LeaveRoom,
            TcpCommand::Simple(TcpCommandId::GetRoomList) => ClientMessage::GetRoomList,
            TcpCommand::Bytes(id, payload) => {
                let mut reader = ByteReader::new(&payload);
                let message = match id {
                    TcpCommandId::HelloFromClient => ClientMessage::Hello {
                        room: reader.str()?,
                        presence: read_presence(&mut reader)?,
                    },
                    TcpCommandId::MoveTo => ClientMessage::MoveTo {
                        move_id: reader.u32()?,
                        position: reader.position()?,
                    },
                    TcpCommandId::SetStatus => {
                        ClientMessage::SetStatus(read_status_update(&mut reader)?)
                    }
                    TcpCommandId::SendChat => ClientMessage::SendChat {
                        scope: ChatScope::from_byte(reader.u8()?)?,
                        body: reader.str()?,
                    },
                    TcpCommandId::SessionDescription => ClientMessage::SessionDescription {
                        peer: reader.user_id()?,
                        session: SessionId(reader.u64()?),
                        description: reader.str()?,
                    },
                    other => return Err(unexpected(other)),
                };
                reader.finish()?;
                message
            }
            other => return Err(unexpected(other.id())),
        };

        Ok(message)
    }
}

impl ServerMessage {
    pub fn into_command(self) -> TcpCommand {
        match self {
            ServerMessage::Snapshot(snapshot) => {
                let mut writer = ByteWriter::new();
                write_snapshot(&mut writer, &snapshot);
                TcpCommand::Bytes(TcpCommandId::RoomSnapshot, writer.finish())
            }
            ServerMessage::Delta(delta) => {
                let mut writer = ByteWriter::new();
                write_delta(&mut writer, &delta);
                TcpCommand::Bytes(TcpCommandId::PresenceDelta, writer.finish())
            }
            ServerMessage::MoveAck(ack) => TcpCommand::Bytes(
                TcpCommandId::MoveAck,
                ByteWriter::new()
                    .u32(ack.move_id)
                    .bool(ack.accepted)
                    .position(&ack.position)
                    .finish(),
            ),
            ServerMessage::Chat(message) => {
                let mut writer = ByteWriter::new();
                writer
                    .u64(message.id)
                    .user_id(&message.user_id)
                    .str(&message.username)
                    .str(&message.body)
                    .i64(message.timestamp.timestamp_millis())
                    .u8(message.scope.to_byte());
                TcpCommand::Bytes(TcpCommandId::ChatRelay, writer.finish())
            }
            ServerMessage::SessionDescription {
                peer,
                session,
                description,
            } => session_description_command(&peer, session, &description),
            ServerMessage::RoomList(rooms) => TcpCommand::StringList(TcpCommandId::RoomList, rooms),
            ServerMessage::Error(error) => TcpCommand::Bytes(
                TcpCommandId::ErrorResponse,
                ByteWriter::new()
                    .u8(error.code())
                    .str(&error.subject())
                    .finish(),
            ),
        }
    }

    pub fn from_command(command: TcpCommand) -> Result<Self, OfficeError> {
        let message = match command {
            TcpCommand::StringList(TcpCommandId::RoomList, rooms) => ServerMessage::RoomList(rooms),
            TcpCommand::Bytes(id, payload) => {
                let mut reader = ByteReader::new(&payload);
                let message = match id {
                    TcpCommandId::RoomSnapshot => ServerMessage::Snapshot(read_snapshot(&mut reader)?),
                    TcpCommandId::PresenceDelta => ServerMessage::Delta(read_delta(&mut reader)?),
                    TcpCommandId::MoveAck => ServerMessage::MoveAck(MoveAck {
                        move_id: reader.u32()?,
                        accepted: reader.bool()?,
                        position: reader.position()?,
                    }),
                    TcpCommandId::ChatRelay => {
                        let id = reader.u64()?;
                        let user_id = reader.user_id()?;
                        let username = reader.str()?;
                        let body = reader.str()?;
                        let millis = reader.i64()?;
                        let timestamp = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                            OfficeError::Protocol(format!("invalid chat timestamp {}", millis))
                        })?;
                        let scope = ChatScope::from_byte(reader.u8()?)?;
                        ServerMessage::Chat(ChatMessage {
                            id,
                            user_id,
                            username,
                            body,
                            timestamp,
                            scope,
                        })
                    }
                    TcpCommandId::SessionDescription => ServerMessage::SessionDescription {
                        peer: reader.user_id()?,
                        session: SessionId(reader.u64()?),
                        description: reader.str()?,
                    },
                    TcpCommandId::ErrorResponse => {
                        let code = reader.u8()?;
                        ServerMessage::Error(OfficeError::from_wire(code, reader.str()?))
                    }
                    other => return Err(unexpected(other)),
                };
                reader.finish()?;
                message
            }
            other => return Err(unexpected(other.id())),
        };

        Ok(message)
    }
}

fn unexpected(id: TcpCommandId) -> OfficeError {
    OfficeError::Protocol(format!("unexpected command {:?}", id))
}

fn session_description_command(peer: &UserId, session: SessionId, description: &str) -> TcpCommand {
    TcpCommand::Bytes(
        TcpCommandId::SessionDescription,
        ByteWriter::new()
            .user_id(peer)
            .u64(session.0)
            .str(description)
            .finish(),
    )
}

fn write_presence(writer: &mut ByteWriter, presence: &UserPresence) {
    writer
        .user_id(&presence.id)
        .str(&presence.display_name)
        .position(&presence.position)
        .bool(presence.mic_on)
        .bool(presence.camera_on)
        .u8(presence.status.to_byte());
}

fn read_presence(reader: &mut ByteReader) -> Result<UserPresence, OfficeError> {
    Ok(UserPresence {
        id: reader.user_id()?,
        display_name: reader.str()?,
        position: reader.position()?,
        mic_on: reader.bool()?,
        camera_on: reader.bool()?,
        status: Status::from_byte(reader.u8()?)?,
    })
}

fn write_status_update(writer: &mut ByteWriter, update: &StatusUpdate) {
    let mut mask = 0;
    if update.mic_on.is_some() {
        mask |= MIC_BIT;
    }
    if update.camera_on.is_some() {
        mask |= CAMERA_BIT;
    }
    if update.status.is_some() {
        mask |= STATUS_BIT;
    }

    writer
        .u8(mask)
        .bool(update.mic_on.unwrap_or_default())
        .bool(update.camera_on.unwrap_or_default())
        .u8(update.status.unwrap_or_default().to_byte());
}

fn read_status_update(reader: &mut ByteReader) -> Result<StatusUpdate, OfficeError> {
    let mask = reader.u8()?;
    let mic_on = reader.bool()?;
    let camera_on = reader.bool()?;
    let status = Status::from_byte(reader.u8()?)?;

    Ok(StatusUpdate {
        mic_on: (mask & MIC_BIT != 0).then_some(mic_on),
        camera_on: (mask & CAMERA_BIT != 0).then_some(camera_on),
        status: (mask & STATUS_BIT != 0).then_some(status),
    })
}

fn write_snapshot(writer: &mut ByteWriter, snapshot: &RoomSnapshot) {
    writer
        .u64(snapshot.version)
        .f64(snapshot.bounds.width)
        .f64(snapshot.bounds.height)
        .u16(snapshot.members.len() as u16);

    for member in &snapshot.members {
        write_presence(writer, &member.presence);
        writer.u64(member.seq);
    }
}

fn read_snapshot(reader: &mut ByteReader) -> Result<RoomSnapshot, OfficeError> {
    let version = reader.u64()?;
    let bounds = RoomBounds::new(reader.f64()?, reader.f64()?);
    let count = reader.u16()? as usize;

    let mut members = Vec::with_capacity(count);
    for _ in 0..count {
        let presence = read_presence(reader)?;
        let seq = reader.u64()?;
        members.push(MemberState { presence, seq });
    }

    Ok(RoomSnapshot {
        version,
        bounds,
        members,
    })
}

fn write_delta(writer: &mut ByteWriter, delta: &PresenceDelta) {
    writer.u64(delta.version);

    match &delta.change {
        PresenceChange::Joined(presence) => {
            writer.u8(DELTA_JOINED);
            write_presence(writer, presence);
        }
        PresenceChange::Moved {
            user,
            seq,
            position,
        } => {
            writer.u8(DELTA_MOVED).user_id(user).u64(*seq).position(position);
        }
        PresenceChange::StatusChanged {
            user,
            seq,
            mic_on,
            camera_on,
            status,
        } => {
            writer
                .u8(DELTA_STATUS)
                .user_id(user)
                .u64(*seq)
                .bool(*mic_on)
                .bool(*camera_on)
                .u8(status.to_byte());
        }
        PresenceChange::Left { user } => {
            writer.u8(DELTA_LEFT).user_id(user);
        }
    }
}

fn read_delta(reader: &mut ByteReader) -> Result<PresenceDelta, OfficeError> {
    let version = reader.u64()?;

    let change = match reader.u8()? {
        DELTA_JOINED => PresenceChange::Joined(read_presence(reader)?),
        DELTA_MOVED => PresenceChange::Moved {
            user: reader.user_id()?,
            seq: reader.u64()?,
            position: reader.position()?,
        },
        DELTA_STATUS => PresenceChange::StatusChanged {
            user: reader.user_id()?,
            seq: reader.u64()?,
            mic_on: reader.bool()?,
            camera_on: reader.bool()?,
            status: Status::from_byte(reader.u8()?)?,
        },
        DELTA_LEFT => PresenceChange::Left {
            user: reader.user_id()?,
        },
        other => {
            return Err(OfficeError::Protocol(format!("invalid delta kind {}", other)));
        }
    };

    Ok(PresenceDelta { version, change })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    #[test]
    fn partial_status_update_keeps_absent_fields_absent() {
        let update = StatusUpdate {
            mic_on: Some(true),
            camera_on: None,
            status: Some(Status::Busy),
        };

        let command = ClientMessage::SetStatus(update).into_command();
        let decoded = ClientMessage::from_command(command).unwrap();

        assert_eq!(decoded, ClientMessage::SetStatus(update));
    }

    #[test]
    fn error_response_carries_code_and_subject() {
        let command = ServerMessage::Error(OfficeError::DuplicateId("alice".into())).into_command();

        match ServerMessage::from_command(command).unwrap() {
            ServerMessage::Error(OfficeError::DuplicateId(id)) => assert_eq!(id, "alice"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn client_rejects_server_only_commands() {
        let command = ServerMessage::MoveAck(MoveAck {
            move_id: 1,
            accepted: true,
            position: Position::new(1.0, 2.0),
        })
        .into_command();

        assert!(matches!(
            ClientMessage::from_command(command),
            Err(OfficeError::Protocol(_))
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut payload = ByteWriter::new()
            .u32(3)
            .position(&Position::new(4.0, 5.0))
            .finish();
        payload.push(0xff);

        let result = ClientMessage::from_command(TcpCommand::Bytes(TcpCommandId::MoveTo, payload));

        assert!(matches!(result, Err(OfficeError::Protocol(_))));
    }

    #[test]
    fn delta_for_departed_user_decodes() {
        let delta = PresenceDelta {
            version: 42,
            change: PresenceChange::Left { user: user("bob") },
        };

        let decoded = ServerMessage::from_command(ServerMessage::Delta(delta.clone()).into_command());

        assert_eq!(decoded.unwrap(), ServerMessage::Delta(delta));
    }
}
