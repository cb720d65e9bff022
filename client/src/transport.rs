use core::error::Error;

use log::{debug, warn};
use shared::{
    error::OfficeError,
    message::{ClientMessage, ServerMessage},
    received_tcp_command::ReceivedTcpCommand,
    tcp_command::TcpCommand,
    types::{
        ChatMessage, ChatScope, MoveAck, Position, PresenceDelta, RoomSnapshot, SessionId,
        StatusUpdate, UserId, UserPresence,
    },
};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
};

/// Everything the server can tell a joined client.
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent {
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
    Disconnected,
}

impl From<ServerMessage> for NetEvent {
    fn from(message: ServerMessage) -> Self {
        match message {
            ServerMessage::Snapshot(snapshot) => NetEvent::Snapshot(snapshot),
            ServerMessage::Delta(delta) => NetEvent::Delta(delta),
            ServerMessage::MoveAck(ack) => NetEvent::MoveAck(ack),
            ServerMessage::Chat(message) => NetEvent::Chat(message),
            ServerMessage::SessionDescription {
                peer,
                session,
                description,
            } => NetEvent::SessionDescription {
                peer,
                session,
                description,
            },
            ServerMessage::RoomList(rooms) => NetEvent::RoomList(rooms),
            ServerMessage::Error(e) => NetEvent::Error(e),
        }
    }
}

/// Sending side of a room connection. Cloning it is cheap; every clone feeds
/// the same writer task.
#[derive(Clone)]
pub struct Transport {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
}

impl Transport {
    /// Connects, says hello and waits for the join verdict. On success the
    /// initial snapshot is returned next to the stream of later events.
    pub async fn join_room(
        server_addr: &str,
        room: &str,
        presence: UserPresence,
    ) -> Result<(Self, RoomSnapshot, mpsc::UnboundedReceiver<NetEvent>), Box<dyn Error + Send + Sync>>
    {
        let mut tcp_stream = TcpStream::connect(server_addr).await?;

        ClientMessage::Hello {
            room: room.to_string(),
            presence,
        }
        .into_command()
        .write_to_stream(&mut tcp_stream)
        .await?;

        let received_command = match TcpCommand::read_from_stream(&mut tcp_stream).await? {
            ReceivedTcpCommand::EOF => {
                return Err("Unexpected EOF from server during handshake".into());
            }
            ReceivedTcpCommand::Command(command) => command,
        };

        let snapshot = match ServerMessage::from_command(received_command)? {
            ServerMessage::Snapshot(snapshot) => snapshot,
            ServerMessage::Error(e) => return Err(e.into()),
            _ => return Err("Invalid command from server during handshake".into()),
        };

        let (read_half, write_half) = tcp_stream.into_split();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_messages(write_half, outgoing_rx));
        tokio::spawn(read_events(read_half, event_tx));

        Ok((
            Self {
                outgoing: outgoing_tx,
            },
            snapshot,
            event_rx,
        ))
    }

    /// A transport whose messages land in the returned receiver instead of a socket.
    #[cfg(test)]
    pub fn detached() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        (Self { outgoing }, rx)
    }

    fn send(&self, message: ClientMessage) -> Result<(), OfficeError> {
        self.outgoing
            .send(message)
            .map_err(|_| OfficeError::RoomClosed)
    }

    pub fn send_position_update(&self, move_id: u32, position: Position) -> Result<(), OfficeError> {
        self.send(ClientMessage::MoveTo { move_id, position })
    }

    pub fn send_status_update(&self, update: StatusUpdate) -> Result<(), OfficeError> {
        self.send(ClientMessage::SetStatus(update))
    }

    pub fn send_chat(&self, scope: ChatScope, body: &str) -> Result<(), OfficeError> {
        self.send(ClientMessage::SendChat {
            scope,
            body: body.to_string(),
        })
    }

    pub fn send_description(
        &self,
        peer: &UserId,
        session: SessionId,
        description: String,
    ) -> Result<(), OfficeError> {
        self.send(ClientMessage::SessionDescription {
            peer: peer.clone(),
            session,
            description,
        })
    }

    pub fn request_resync(&self) -> Result<(), OfficeError> {
        self.send(ClientMessage::RequestSnapshot)
    }

    pub fn request_room_list(&self) -> Result<(), OfficeError> {
        self.send(ClientMessage::GetRoomList)
    }

    pub fn heartbeat(&self) -> Result<(), OfficeError> {
        self.send(ClientMessage::Heartbeat)
    }

    pub fn leave_room(&self) -> Result<(), OfficeError> {
        self.send(ClientMessage::LeaveRoom)
    }
}

async fn write_messages(
    mut write_half: OwnedWriteHalf,
    mut outgoing_rx: mpsc::UnboundedReceiver<ClientMessage>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        let leaving = message == ClientMessage::LeaveRoom;

        if let Err(e) = message.into_command().write_to_stream(&mut write_half).await {
            warn!("Error writing to server: {}", e);
            break;
        }

        if leaving {
            break;
        }
    }

    debug!("Writer task finished");
}

async fn read_events(mut read_half: OwnedReadHalf, event_tx: mpsc::UnboundedSender<NetEvent>) {
    loop {
        let command = match TcpCommand::read_from_stream(&mut read_half).await {
            Ok(ReceivedTcpCommand::Command(command)) => command,
            Ok(ReceivedTcpCommand::EOF) => break,
            Err(e) => {
                warn!("Error reading from server: {}", e);
                break;
            }
        };

        let event = match ServerMessage::from_command(command) {
            Ok(message) => NetEvent::from(message),
            Err(e) => {
                warn!("Ignoring malformed command from server: {}", e);
                continue;
            }
        };

        if event_tx.send(event).is_err() {
            return;
        }
    }

    let _ = event_tx.send(NetEvent::Disconnected);
}
