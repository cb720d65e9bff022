use core::error::Error;
use std::{sync::Arc, time::Duration};

use log::{info, warn};
use shared::{
    MAX_DISPLAY_NAME_LENGTH, MAX_NAME_LENGTH, error::OfficeError, is_valid_name,
    message::{ClientMessage, ServerMessage},
    received_tcp_command::ReceivedTcpCommand,
    tcp_command::TcpCommand,
    types::{Status, UserId, UserPresence},
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{
        broadcast::{self, error::RecvError},
        mpsc,
    },
    time::{Instant, sleep_until, timeout},
};

use crate::{
    config::ServerConfig,
    registry::RoomRegistry,
    room_actor::LeaveReason,
    tcp_command_handler::{CommandFlow, ConnectionContext, TcpCommandHandler},
};

type Inbound = Result<TcpCommand, Box<dyn Error + Send + Sync>>;

pub struct TcpHandler;

impl TcpHandler {
    pub async fn handle_stream(
        mut stream: TcpStream,
        registry: Arc<RoomRegistry>,
        config: Arc<ServerConfig>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let (room_name, presence) =
            match Self::handle_handshake(&mut stream, config.idle_timeout).await? {
                Some(hello) => hello,
                None => return Ok(()),
            };

        let user = presence.id.clone();

        // Subscribed before joining so no delta between the snapshot and the
        // first read is lost.
        let (outbox_tx, mut outbox_rx) = broadcast::channel(config.outbox_capacity);

        let (room, snapshot) = match registry.join(&room_name, presence, outbox_tx).await {
            Ok(joined) => joined,
            Err(e) => {
                ServerMessage::Error(e)
                    .into_command()
                    .write_to_stream(&mut stream)
                    .await?;
                return Ok(());
            }
        };

        ServerMessage::Snapshot(snapshot)
            .into_command()
            .write_to_stream(&mut stream)
            .await?;

        let (read_half, mut write_half) = stream.into_split();
        let (inbound_tx, mut inbound_rx) = mpsc::channel(32);
        let reader_task = tokio::spawn(read_commands(read_half, inbound_tx));

        let context = ConnectionContext {
            user,
            room,
            registry,
        };

        let result = Self::run_session(
            &context,
            &mut write_half,
            &mut inbound_rx,
            &mut outbox_rx,
            config.idle_timeout,
        )
        .await;

        reader_task.abort();

        let reason = match &result {
            Ok(reason) => *reason,
            Err(_) => LeaveReason::ConnectionClosed,
        };
        leave(&context, reason).await;

        result.map(|_| ())
    }

    async fn run_session(
        context: &ConnectionContext,
        writer: &mut OwnedWriteHalf,
        inbound_rx: &mut mpsc::Receiver<Inbound>,
        outbox_rx: &mut broadcast::Receiver<TcpCommand>,
        idle_timeout: Duration,
    ) -> Result<LeaveReason, Box<dyn Error + Send + Sync>> {
        let mut deadline = Instant::now() + idle_timeout;

        loop {
            tokio::select! {

                incoming = inbound_rx.recv() => {

                    let command = match incoming {
                        None => return Ok(LeaveReason::ConnectionClosed),
                        Some(result) => result?,
                    };

                    deadline = Instant::now() + idle_timeout;

                    match TcpCommandHandler::handle_command(command, context, writer).await? {
                        CommandFlow::Continue => {}
                        CommandFlow::Leave => return Ok(LeaveReason::Requested),
                    }
                }

                outgoing = outbox_rx.recv() => {

                    match outgoing {
                        Ok(command) => forward(&context.user, &command, writer).await?,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("{} fell {} commands behind, sending a snapshot", context.user, skipped);

                            let snapshot = context.room.snapshot().await?;
                            ServerMessage::Snapshot(snapshot)
                                .into_command()
                                .write_to_stream(writer)
                                .await?;
                        }
                        Err(RecvError::Closed) => return Ok(LeaveReason::ConnectionClosed),
                    }
                }

                _ = sleep_until(deadline) => {

                    let error = OfficeError::DisconnectedAbruptly(context.user.to_string());
                    info!("{}", error);

                    // Best effort; the peer may already be gone.
                    let _ = ServerMessage::Error(error)
                        .into_command()
                        .write_to_stream(writer)
                        .await;

                    return Ok(LeaveReason::IdleTimeout);
                }
            }
        }
    }

    async fn handle_handshake(
        stream: &mut TcpStream,
        idle_timeout: Duration,
    ) -> Result<Option<(String, UserPresence)>, Box<dyn Error + Send + Sync>> {
        let received_command = match timeout(idle_timeout, TcpCommand::read_from_stream(stream)).await {
            Ok(result) => match result? {
                ReceivedTcpCommand::EOF => return Ok(None),
                ReceivedTcpCommand::Command(cmd) => cmd,
            },
            Err(_) => {
                info!("Client never said hello");
                return Ok(None);
            }
        };

        let (room_name, mut presence) = match ClientMessage::from_command(received_command) {
            Ok(ClientMessage::Hello { room, presence }) => (room, presence),
            Ok(_) => return Err("Invalid hello command from client".into()),
            Err(e) => {
                info!("Client sent invalid hello: {}", e);
                reject(stream, e).await?;
                return Ok(None);
            }
        };

        if room_name.len() > MAX_NAME_LENGTH || !is_valid_name(&room_name) {
            info!("Client asked for invalid room name");
            reject(stream, OfficeError::InvalidName(room_name)).await?;
            return Ok(None);
        }

        presence.display_name = presence
            .display_name
            .trim()
            .chars()
            .take(MAX_DISPLAY_NAME_LENGTH)
            .collect();
        if presence.display_name.is_empty() {
            presence.display_name = presence.id.to_string();
        }
        if presence.status == Status::Offline {
            presence.status = Status::Online;
        }

        info!("{} has connected!", presence.id);

        Ok(Some((room_name, presence)))
    }
}

async fn reject(
    stream: &mut TcpStream,
    error: OfficeError,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    ServerMessage::Error(error)
        .into_command()
        .write_to_stream(stream)
        .await
}

/// Writes one outbox command. A command that cannot be framed is dropped for
/// this connection only; write failures still end the session.
async fn forward<W>(
    user: &UserId,
    command: &TcpCommand,
    writer: &mut W,
) -> Result<(), Box<dyn Error + Send + Sync>>
where
    W: AsyncWrite + Unpin,
{
    let bytes = match command.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Dropping {:?} for {}: {}", command.id(), user, e);
            return Ok(());
        }
    };

    writer.write_all(&bytes).await?;

    Ok(())
}

async fn leave(context: &ConnectionContext, reason: LeaveReason) {
    if context.room.leave(&context.user, reason).await {
        info!("{} has disconnected", context.user);
    }
}

/// Reads frames on their own task so the session loop can select over the
/// channel without cancelling a half-read frame.
async fn read_commands(mut read_half: OwnedReadHalf, inbound_tx: mpsc::Sender<Inbound>) {
    loop {
        match TcpCommand::read_from_stream(&mut read_half).await {
            Ok(ReceivedTcpCommand::Command(command)) => {
                if inbound_tx.send(Ok(command)).await.is_err() {
                    break;
                }
            }
            Ok(ReceivedTcpCommand::EOF) => break,
            Err(e) => {
                let _ = inbound_tx.send(Err(e)).await;
                break;
            }
        }
    }
}
