use core::error::Error;
use std::sync::Arc;

use log::{debug, warn};
use shared::{
    MAX_CHAT_LENGTH, MAX_DESCRIPTION_LENGTH, MAX_ROOM_LIST,
    error::OfficeError,
    message::{ClientMessage, ServerMessage},
    tcp_command::TcpCommand,
    types::UserId,
};
use tokio::io::AsyncWrite;

use crate::{registry::RoomRegistry, room_actor::RoomHandle};

pub struct ConnectionContext {
    pub user: UserId,
    pub room: RoomHandle,
    pub registry: Arc<RoomRegistry>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum CommandFlow {
    Continue,
    Leave,
}

pub struct TcpCommandHandler;

impl TcpCommandHandler {
    /// Applies one command from a joined client. Errors that only concern this
    /// request are reported back to the client; the returned error is reserved
    /// for a broken connection.
    pub async fn handle_command<W>(
        incoming_command: TcpCommand,
        context: &ConnectionContext,
        writer: &mut W,
    ) -> Result<CommandFlow, Box<dyn Error + Send + Sync>>
    where
        W: AsyncWrite + Unpin,
    {
        let message = match ClientMessage::from_command(incoming_command) {
            Ok(message) => message,
            Err(e) => {
                warn!("Bad command from {}: {}", context.user, e);
                respond(writer, ServerMessage::Error(e)).await?;
                return Ok(CommandFlow::Continue);
            }
        };

        let result = match message {
            ClientMessage::MoveTo { move_id, position } => {
                // The room answers the mover with a MoveAck either way.
                if let Err(e) = context
                    .room
                    .update_position(&context.user, move_id, position)
                    .await
                {
                    debug!("{}: {}", context.user, e);
                }
                Ok(())
            }

            ClientMessage::SetStatus(update) => {
                if update.is_empty() {
                    Ok(())
                } else {
                    context.room.update_status(&context.user, update).await
                }
            }

            ClientMessage::SendChat { scope, body } => {
                let body = body.trim();
                if body.is_empty() {
                    Ok(())
                } else if body.chars().count() > MAX_CHAT_LENGTH {
                    Err(OfficeError::Protocol(format!(
                        "chat messages are limited to {} characters",
                        MAX_CHAT_LENGTH
                    )))
                } else {
                    context
                        .room
                        .chat(&context.user, scope, body.to_string())
                        .await
                }
            }

            ClientMessage::SessionDescription {
                peer,
                session,
                description,
            } => {
                if description.len() > MAX_DESCRIPTION_LENGTH {
                    Err(OfficeError::Protocol(format!(
                        "session descriptions are limited to {} bytes",
                        MAX_DESCRIPTION_LENGTH
                    )))
                } else {
                    context
                        .room
                        .relay_description(&context.user, peer, session, description)
                        .await
                }
            }

            ClientMessage::RequestSnapshot => {
                let snapshot = context.room.snapshot().await?;
                respond(writer, ServerMessage::Snapshot(snapshot)).await?;
                Ok(())
            }

            ClientMessage::GetRoomList => {
                let mut rooms = context.registry.room_list().await;
                if rooms.len() > MAX_ROOM_LIST {
                    debug!("Room list cut to {} of {} rooms", MAX_ROOM_LIST, rooms.len());
                    rooms.truncate(MAX_ROOM_LIST);
                }
                respond(writer, ServerMessage::RoomList(rooms)).await?;
                Ok(())
            }

            ClientMessage::Heartbeat => Ok(()),

            ClientMessage::LeaveRoom => return Ok(CommandFlow::Leave),

            ClientMessage::Hello { .. } => Err(OfficeError::Protocol(
                "already joined; leave before saying hello again".into(),
            )),
        };

        if let Err(e) = result {
            if e == OfficeError::RoomClosed {
                return Err(e.into());
            }
            respond(writer, ServerMessage::Error(e)).await?;
        }

        Ok(CommandFlow::Continue)
    }
}

async fn respond<W>(writer: &mut W, message: ServerMessage) -> Result<(), Box<dyn Error + Send + Sync>>
where
    W: AsyncWrite + Unpin,
{
    message.into_command().write_to_stream(writer).await
}
