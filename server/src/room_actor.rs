use std::collections::HashMap;

use log::{debug, info, warn};
use shared::{
    error::OfficeError,
    message::ServerMessage,
    tcp_command::TcpCommand,
    types::{
        ChatScope, Position, PresenceDelta, RoomBounds, RoomSnapshot, SessionId, StatusUpdate,
        UserId, UserPresence,
    },
};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::room::Room;

const REQUEST_QUEUE: usize = 256;

/// Per-connection queue the room writes outgoing commands into.
pub type Outbox = broadcast::Sender<TcpCommand>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveReason {
    Requested,
    ConnectionClosed,
    IdleTimeout,
}

pub enum RoomRequest {
    Join {
        presence: UserPresence,
        outbox: Outbox,
        reply: oneshot::Sender<Result<RoomSnapshot, OfficeError>>,
    },
    UpdatePosition {
        user: UserId,
        move_id: u32,
        position: Position,
        reply: oneshot::Sender<Result<(), OfficeError>>,
    },
    UpdateStatus {
        user: UserId,
        update: StatusUpdate,
        reply: oneshot::Sender<Result<(), OfficeError>>,
    },
    Chat {
        user: UserId,
        scope: ChatScope,
        body: String,
        reply: oneshot::Sender<Result<(), OfficeError>>,
    },
    RelayDescription {
        from: UserId,
        to: UserId,
        session: SessionId,
        description: String,
        reply: oneshot::Sender<Result<(), OfficeError>>,
    },
    Snapshot {
        reply: oneshot::Sender<RoomSnapshot>,
    },
    MemberCount {
        reply: oneshot::Sender<usize>,
    },
    Leave {
        user: UserId,
        reason: LeaveReason,
        reply: oneshot::Sender<bool>,
    },
}

/// Cheap handle to a room's actor. All mutations of one room go through its
/// queue and are applied one at a time.
#[derive(Clone)]
pub struct RoomHandle {
    name: String,
    tx: mpsc::Sender<RoomRequest>,
}

impl RoomHandle {
    pub fn spawn(name: &str, bounds: RoomBounds) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let actor = RoomActor {
            room: Room::new(name, bounds),
            outboxes: HashMap::new(),
        };

        tokio::spawn(actor.run(rx));

        Self {
            name: name.to_string(),
            tx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the actor has stopped, which happens when its last member leaves.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RoomRequest,
    ) -> Result<T, OfficeError> {
        let (reply, response) = oneshot::channel();

        self.tx
            .send(build(reply))
            .await
            .map_err(|_| OfficeError::RoomClosed)?;

        response.await.map_err(|_| OfficeError::RoomClosed)
    }

    pub async fn join(
        &self,
        presence: UserPresence,
        outbox: Outbox,
    ) -> Result<RoomSnapshot, OfficeError> {
        self.request(|reply| RoomRequest::Join {
            presence,
            outbox,
            reply,
        })
        .await?
    }

    pub async fn update_position(
        &self,
        user: &UserId,
        move_id: u32,
        position: Position,
    ) -> Result<(), OfficeError> {
        self.request(|reply| RoomRequest::UpdatePosition {
            user: user.clone(),
            move_id,
            position,
            reply,
        })
        .await?
    }

    pub async fn update_status(
        &self,
        user: &UserId,
        update: StatusUpdate,
    ) -> Result<(), OfficeError> {
        self.request(|reply| RoomRequest::UpdateStatus {
            user: user.clone(),
            update,
            reply,
        })
        .await?
    }

    pub async fn chat(&self, user: &UserId, scope: ChatScope, body: String) -> Result<(), OfficeError> {
        self.request(|reply| RoomRequest::Chat {
            user: user.clone(),
            scope,
            body,
            reply,
        })
        .await?
    }

    pub async fn relay_description(
        &self,
        from: &UserId,
        to: UserId,
        session: SessionId,
        description: String,
    ) -> Result<(), OfficeError> {
        self.request(|reply| RoomRequest::RelayDescription {
            from: from.clone(),
            to,
            session,
            description,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, OfficeError> {
        self.request(|reply| RoomRequest::Snapshot { reply }).await
    }

    pub async fn member_count(&self) -> Result<usize, OfficeError> {
        self.request(|reply| RoomRequest::MemberCount { reply }).await
    }

    pub async fn leave(&self, user: &UserId, reason: LeaveReason) -> bool {
        self.request(|reply| RoomRequest::Leave {
            user: user.clone(),
            reason,
            reply,
        })
        .await
        .unwrap_or(false)
    }
}

struct RoomActor {
    room: Room,
    outboxes: HashMap<UserId, Outbox>,
}

impl RoomActor {
    async fn run(mut self, mut rx: mpsc::Receiver<RoomRequest>) {
        info!("Room '{}' opened", self.room.name);

        while let Some(request) = rx.recv().await {
            self.handle(request);

            if self.room.is_empty() {
                break;
            }
        }

        info!("Room '{}' closed", self.room.name);
    }

    fn handle(&mut self, request: RoomRequest) {
        match request {
            RoomRequest::Join {
                presence,
                outbox,
                reply,
            } => {
                let user = presence.id.clone();
                let result = match self.room.join(presence) {
                    Ok(delta) => {
                        self.fan_out(delta);
                        self.outboxes.insert(user.clone(), outbox);
                        info!(
                            "{} joined '{}' ({} present, version {})",
                            user,
                            self.room.name,
                            self.room.len(),
                            self.room.version()
                        );
                        Ok(self.room.snapshot())
                    }
                    Err(e) => {
                        info!("{} was refused by '{}': {}", user, self.room.name, e);
                        Err(e)
                    }
                };

                let _ = reply.send(result);
            }

            RoomRequest::UpdatePosition {
                user,
                move_id,
                position,
                reply,
            } => {
                let (ack, result) = match self.room.update_position(&user, move_id, position) {
                    Ok((ack, delta)) => {
                        self.fan_out(delta);
                        (ack, Ok(()))
                    }
                    Err((ack, e)) => {
                        debug!("Rejected move {} from {}: {}", move_id, user, e);
                        (ack, Err(e))
                    }
                };

                self.send_to(&user, ServerMessage::MoveAck(ack).into_command());
                let _ = reply.send(result);
            }

            RoomRequest::UpdateStatus {
                user,
                update,
                reply,
            } => {
                let result = self.room.update_status(&user, update).map(|delta| self.fan_out(delta));
                let _ = reply.send(result);
            }

            RoomRequest::Chat {
                user,
                scope,
                body,
                reply,
            } => {
                let result = self.room.chat(&user, scope, body).map(|message| {
                    self.broadcast(ServerMessage::Chat(message).into_command());
                });
                let _ = reply.send(result);
            }

            RoomRequest::RelayDescription {
                from,
                to,
                session,
                description,
                reply,
            } => {
                let result = if self.room.contains(&to) && self.room.contains(&from) {
                    let command = ServerMessage::SessionDescription {
                        peer: from,
                        session,
                        description,
                    }
                    .into_command();
                    self.send_to(&to, command);
                    Ok(())
                } else {
                    Err(OfficeError::UnknownUser(to.to_string()))
                };
                let _ = reply.send(result);
            }

            RoomRequest::Snapshot { reply } => {
                let _ = reply.send(self.room.snapshot());
            }

            RoomRequest::MemberCount { reply } => {
                let _ = reply.send(self.room.len());
            }

            RoomRequest::Leave {
                user,
                reason,
                reply,
            } => {
                self.outboxes.remove(&user);
                let removed = match self.room.leave(&user) {
                    Some(delta) => {
                        self.fan_out(delta);
                        match reason {
                            LeaveReason::IdleTimeout => {
                                warn!("{} timed out in '{}'", user, self.room.name)
                            }
                            _ => info!("{} left '{}' ({:?})", user, self.room.name, reason),
                        }
                        true
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }
        }
    }

    fn fan_out(&self, delta: PresenceDelta) {
        self.broadcast(ServerMessage::Delta(delta).into_command());
    }

    fn broadcast(&self, command: TcpCommand) {
        for outbox in self.outboxes.values() {
            // A send only fails when the connection is already gone; its leave
            // request is on the way.
            let _ = outbox.send(command.clone());
        }
    }

    fn send_to(&self, user: &UserId, command: TcpCommand) {
        if let Some(outbox) = self.outboxes.get(user) {
            let _ = outbox.send(command);
        }
    }
}

#[cfg(test)]
mod tests {
    use shared::types::{PresenceChange, Status};

    use super::*;

    fn id(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn presence(raw: &str, x: f64, y: f64) -> UserPresence {
        UserPresence::new(id(raw), raw, Position::new(x, y))
    }

    fn next_message(rx: &mut broadcast::Receiver<TcpCommand>) -> ServerMessage {
        ServerMessage::from_command(rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn deltas_reach_every_member_and_ack_reaches_the_mover() {
        let room = RoomHandle::spawn("lobby", RoomBounds::new(500.0, 500.0));
        let (alice_tx, mut alice_rx) = broadcast::channel(16);
        let (bob_tx, mut bob_rx) = broadcast::channel(16);

        room.join(presence("alice", 0.0, 0.0), alice_tx).await.unwrap();
        let snapshot = room.join(presence("bob", 100.0, 0.0), bob_tx).await.unwrap();
        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(snapshot.version, 2);

        // alice hears about bob joining
        assert!(matches!(
            next_message(&mut alice_rx),
            ServerMessage::Delta(PresenceDelta { version: 2, change: PresenceChange::Joined(_) })
        ));

        room.update_position(&id("bob"), 1, Position::new(120.0, 5.0))
            .await
            .unwrap();

        for rx in [&mut alice_rx, &mut bob_rx] {
            match next_message(rx) {
                ServerMessage::Delta(delta) => {
                    assert_eq!(delta.version, 3);
                    assert_eq!(
                        delta.change,
                        PresenceChange::Moved {
                            user: id("bob"),
                            seq: 1,
                            position: Position::new(120.0, 5.0)
                        }
                    );
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(matches!(
            next_message(&mut bob_rx),
            ServerMessage::MoveAck(ack) if ack.accepted && ack.move_id == 1
        ));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejected_move_is_acked_with_authoritative_position() {
        let room = RoomHandle::spawn("lobby", RoomBounds::new(500.0, 500.0));
        let (tx, mut rx) = broadcast::channel(16);
        room.join(presence("alice", 0.0, 10.0), tx).await.unwrap();

        let result = room
            .update_position(&id("alice"), 9, Position::new(-10.0, 10.0))
            .await;

        assert!(matches!(result, Err(OfficeError::OutOfBounds { .. })));
        match next_message(&mut rx) {
            ServerMessage::MoveAck(ack) => {
                assert!(!ack.accepted);
                assert_eq!(ack.position, Position::new(0.0, 10.0));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let room = RoomHandle::spawn("lobby", RoomBounds::default());
        let (tx, _rx) = broadcast::channel(16);
        room.join(presence("alice", 0.0, 0.0), tx.clone()).await.unwrap();

        let result = room.join(presence("alice", 5.0, 5.0), tx).await;

        assert_eq!(result, Err(OfficeError::DuplicateId("alice".into())));
    }

    #[tokio::test]
    async fn status_and_chat_are_broadcast() {
        let room = RoomHandle::spawn("lobby", RoomBounds::default());
        let (tx, mut rx) = broadcast::channel(16);
        room.join(presence("alice", 0.0, 0.0), tx).await.unwrap();

        room.update_status(
            &id("alice"),
            StatusUpdate {
                mic_on: Some(true),
                status: Some(Status::Away),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        room.chat(&id("alice"), ChatScope::Office, "hello".into())
            .await
            .unwrap();

        assert!(matches!(
            next_message(&mut rx),
            ServerMessage::Delta(PresenceDelta {
                change: PresenceChange::StatusChanged { mic_on: true, camera_on: false, status: Status::Away, .. },
                ..
            })
        ));
        assert!(matches!(
            next_message(&mut rx),
            ServerMessage::Chat(message) if message.body == "hello" && message.scope == ChatScope::Office
        ));
    }

    #[tokio::test]
    async fn descriptions_are_relayed_to_the_target_only() {
        let room = RoomHandle::spawn("lobby", RoomBounds::default());
        let (alice_tx, mut alice_rx) = broadcast::channel(16);
        let (bob_tx, mut bob_rx) = broadcast::channel(16);
        room.join(presence("alice", 0.0, 0.0), alice_tx).await.unwrap();
        room.join(presence("bob", 0.0, 0.0), bob_tx).await.unwrap();
        let _ = alice_rx.try_recv();

        room.relay_description(&id("alice"), id("bob"), SessionId(4), "offer".into())
            .await
            .unwrap();

        assert_eq!(
            next_message(&mut bob_rx),
            ServerMessage::SessionDescription {
                peer: id("alice"),
                session: SessionId(4),
                description: "offer".into()
            }
        );
        assert!(alice_rx.try_recv().is_err());
        assert!(room
            .relay_description(&id("alice"), id("ghost"), SessionId(4), "offer".into())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn room_closes_after_last_member_leaves() {
        let room = RoomHandle::spawn("lobby", RoomBounds::default());
        let (alice_tx, _alice_rx) = broadcast::channel(16);
        let (bob_tx, mut bob_rx) = broadcast::channel(16);
        room.join(presence("alice", 0.0, 0.0), alice_tx).await.unwrap();
        room.join(presence("bob", 0.0, 0.0), bob_tx).await.unwrap();

        assert!(room.leave(&id("alice"), LeaveReason::Requested).await);
        assert!(matches!(
            next_message(&mut bob_rx),
            ServerMessage::Delta(PresenceDelta { change: PresenceChange::Left { .. }, .. })
        ));
        assert_eq!(room.member_count().await.unwrap(), 1);

        assert!(room.leave(&id("bob"), LeaveReason::IdleTimeout).await);
        tokio::task::yield_now().await;

        assert_eq!(room.snapshot().await, Err(OfficeError::RoomClosed));
        assert!(room.is_closed());
    }
}
