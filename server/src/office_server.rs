use core::error::Error;
use std::{net::SocketAddr, sync::Arc};

use log::error;
use tokio::net::TcpListener;

use crate::{config::ServerConfig, registry::RoomRegistry, tcp_handler::TcpHandler};

pub struct OfficeServer {
    tcp_listener: TcpListener,
    registry: Arc<RoomRegistry>,
    config: Arc<ServerConfig>,
}

impl OfficeServer {
    pub async fn bind(config: ServerConfig) -> Result<Self, Box<dyn Error>> {
        Ok(Self {
            tcp_listener: TcpListener::bind(&config.tcp_addr).await?,
            registry: Arc::new(RoomRegistry::new(config.bounds)),
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Box<dyn Error>> {
        Ok(self.tcp_listener.local_addr()?)
    }

    pub async fn listen(self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let registry = self.registry.clone();
        let mut sweep_task = tokio::spawn(async move { registry.sweep_forever().await });

        loop {
            let registry = self.registry.clone();
            let config = self.config.clone();

            tokio::select! {

                result = &mut sweep_task => {

                    return result.map_err(|e| e.into());
                }

                result = self.tcp_listener.accept() => {

                    let tcp_socket = result?.0;

                    tokio::spawn(async move {

                        if let Err(e) = TcpHandler::handle_stream(tcp_socket, registry, config).await {

                            error!("Error handling TcpSocket: {}", e);
                        }
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use shared::{
        error::OfficeError,
        message::{ClientMessage, ServerMessage},
        received_tcp_command::ReceivedTcpCommand,
        tcp_command::TcpCommand,
        MAX_DESCRIPTION_LENGTH,
        types::{Position, PresenceChange, SessionId, UserId, UserPresence},
    };
    use tokio::{
        io::{AsyncRead, AsyncWrite},
        net::TcpStream,
        time::timeout,
    };

    use super::*;

    async fn start() -> SocketAddr {
        start_with(ServerConfig::default()).await
    }

    async fn start_with(config: ServerConfig) -> SocketAddr {
        let config = ServerConfig {
            tcp_addr: "127.0.0.1:0".into(),
            ..config
        };
        let server = OfficeServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.listen());
        addr
    }

    async fn send<W: AsyncWrite + Unpin>(stream: &mut W, message: ClientMessage) {
        message.into_command().write_to_stream(stream).await.unwrap();
    }

    async fn recv<R: AsyncRead + Unpin>(stream: &mut R) -> ServerMessage {
        let received = timeout(Duration::from_secs(5), TcpCommand::read_from_stream(stream))
            .await
            .unwrap()
            .unwrap();
        match received {
            ReceivedTcpCommand::Command(command) => ServerMessage::from_command(command).unwrap(),
            ReceivedTcpCommand::EOF => panic!("server hung up"),
        }
    }

    async fn hello(addr: SocketAddr, name: &str, x: f64, y: f64) -> (TcpStream, ServerMessage) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let presence = UserPresence::new(UserId::parse(name).unwrap(), name, Position::new(x, y));
        send(
            &mut stream,
            ClientMessage::Hello {
                room: "lobby".into(),
                presence,
            },
        )
        .await;
        let reply = recv(&mut stream).await;
        (stream, reply)
    }

    fn is_left(message: &ServerMessage, name: &str) -> bool {
        matches!(
            message,
            ServerMessage::Delta(delta)
                if matches!(&delta.change, PresenceChange::Left { user } if user.as_str() == name)
        )
    }

    #[tokio::test]
    async fn clients_share_presence_through_the_server() {
        let addr = start().await;

        let (mut alice, reply) = hello(addr, "alice", 0.0, 0.0).await;
        assert!(matches!(reply, ServerMessage::Snapshot(s) if s.members.len() == 1));

        let (mut bob, reply) = hello(addr, "bob", 90.0, 120.0).await;
        assert!(matches!(reply, ServerMessage::Snapshot(s) if s.members.len() == 2 && s.version == 2));

        assert!(matches!(
            recv(&mut alice).await,
            ServerMessage::Delta(delta) if matches!(delta.change, PresenceChange::Joined(_))
        ));

        send(
            &mut bob,
            ClientMessage::MoveTo {
                move_id: 1,
                position: Position::new(100.0, 100.0),
            },
        )
        .await;

        match recv(&mut alice).await {
            ServerMessage::Delta(delta) => {
                assert_eq!(delta.version, 3);
                assert!(matches!(
                    delta.change,
                    PresenceChange::Moved { seq: 1, position, .. } if position == Position::new(100.0, 100.0)
                ));
            }
            other => panic!("unexpected {:?}", other),
        }

        send(&mut bob, ClientMessage::LeaveRoom).await;
        assert!(matches!(
            recv(&mut alice).await,
            ServerMessage::Delta(delta) if matches!(delta.change, PresenceChange::Left { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_user_is_turned_away() {
        let addr = start().await;

        let (_alice, _) = hello(addr, "alice", 0.0, 0.0).await;
        let (_imposter, reply) = hello(addr, "alice", 5.0, 5.0).await;

        assert_eq!(
            reply,
            ServerMessage::Error(OfficeError::DuplicateId("alice".into()))
        );
    }

    #[tokio::test]
    async fn oversized_description_leaves_the_recipient_connected() {
        let addr = start().await;

        let (mut bob, _) = hello(addr, "bob", 0.0, 0.0).await;
        let (mut sender, _) = hello(addr, "abcdefghijklmno", 10.0, 0.0).await;
        assert!(matches!(recv(&mut bob).await, ServerMessage::Delta(_)));

        send(
            &mut sender,
            ClientMessage::SessionDescription {
                peer: UserId::parse("bob").unwrap(),
                session: SessionId(1),
                description: "x".repeat(65520),
            },
        )
        .await;
        assert!(matches!(
            recv(&mut sender).await,
            ServerMessage::Error(OfficeError::Protocol(_))
        ));

        // bob still hears what happens in the room
        send(
            &mut sender,
            ClientMessage::MoveTo {
                move_id: 1,
                position: Position::new(20.0, 0.0),
            },
        )
        .await;
        assert!(matches!(
            recv(&mut bob).await,
            ServerMessage::Delta(delta) if matches!(delta.change, PresenceChange::Moved { .. })
        ));

        let description = "y".repeat(MAX_DESCRIPTION_LENGTH);
        send(
            &mut sender,
            ClientMessage::SessionDescription {
                peer: UserId::parse("bob").unwrap(),
                session: SessionId(2),
                description: description.clone(),
            },
        )
        .await;
        assert_eq!(
            recv(&mut bob).await,
            ServerMessage::SessionDescription {
                peer: UserId::parse("abcdefghijklmno").unwrap(),
                session: SessionId(2),
                description,
            }
        );
    }

    #[tokio::test]
    async fn dropped_socket_counts_as_leaving() {
        let addr = start().await;

        let (mut alice, _) = hello(addr, "alice", 0.0, 0.0).await;
        let (bob, _) = hello(addr, "bob", 50.0, 0.0).await;
        assert!(matches!(recv(&mut alice).await, ServerMessage::Delta(_)));

        drop(bob);

        assert!(is_left(&recv(&mut alice).await, "bob"));

        // the id is free again
        let (_bob, reply) = hello(addr, "bob", 50.0, 0.0).await;
        assert!(matches!(reply, ServerMessage::Snapshot(s) if s.members.len() == 2));
    }

    #[tokio::test]
    async fn silent_client_is_dropped_after_idle_timeout() {
        let idle_timeout = Duration::from_millis(300);
        let addr = start_with(ServerConfig {
            idle_timeout,
            ..Default::default()
        })
        .await;

        let (alice, _) = hello(addr, "alice", 0.0, 0.0).await;
        let (mut alice_read, mut alice_write) = alice.into_split();
        tokio::spawn(async move {
            loop {
                send(&mut alice_write, ClientMessage::Heartbeat).await;
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });

        let started = tokio::time::Instant::now();
        let (mut bob, _) = hello(addr, "bob", 50.0, 0.0).await;
        assert!(matches!(recv(&mut alice_read).await, ServerMessage::Delta(_)));

        assert_eq!(
            recv(&mut bob).await,
            ServerMessage::Error(OfficeError::DisconnectedAbruptly("bob".into()))
        );
        assert!(is_left(&recv(&mut alice_read).await, "bob"));
        assert!(started.elapsed() < idle_timeout * 4);
    }

    #[tokio::test]
    async fn lagging_outbox_is_caught_up_with_a_snapshot() {
        let addr = start_with(ServerConfig {
            outbox_capacity: 1,
            ..Default::default()
        })
        .await;

        let (mut alice, _) = hello(addr, "alice", 0.0, 0.0).await;
        let (mut bob, _) = hello(addr, "bob", 50.0, 0.0).await;
        assert!(matches!(recv(&mut alice).await, ServerMessage::Delta(_)));

        // The move's delta and ack land in bob's one-slot outbox back to back,
        // so the delta is overrun before bob's connection can forward it.
        send(
            &mut bob,
            ClientMessage::MoveTo {
                move_id: 1,
                position: Position::new(60.0, 0.0),
            },
        )
        .await;

        match recv(&mut bob).await {
            ServerMessage::Snapshot(snapshot) => {
                assert_eq!(snapshot.version, 3);
                let bob_state = snapshot
                    .members
                    .iter()
                    .find(|member| member.presence.id.as_str() == "bob")
                    .unwrap();
                assert_eq!(bob_state.presence.position, Position::new(60.0, 0.0));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(
            recv(&mut bob).await,
            ServerMessage::MoveAck(ack) if ack.accepted && ack.move_id == 1
        ));
        assert!(matches!(recv(&mut alice).await, ServerMessage::Delta(_)));
    }
}
