use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::{Result, anyhow};
use log::{debug, info, warn};
use shared::{
    error::OfficeError,
    proximity::ProximityEngine,
    types::{ChatScope, PresenceChange, PresenceDelta, RoomSnapshot, StatusUpdate, UserId, UserPresence},
};
use tokio::{
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval, timeout_at},
};

use crate::{
    call_mesh::{CallMeshManager, MeshEvent, TaskOutcome},
    chat_router::ScopedMessageRouter,
    cli_display::CliDisplay,
    command_interface::{CommandInterface, UserCommand},
    config::ClientConfig,
    media::{LoopbackMediaSource, MediaSource},
    position_sync::PositionSynchronizer,
    room_mirror::RoomMirror,
    signaling::RelaySignaling,
    transport::{NetEvent, Transport},
};

const LEAVE_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// One joined room. Everything here is owned by a single event loop; the
/// tasks it spawns only talk back through channels.
pub struct OfficeClient {
    config: ClientConfig,
    local: UserId,
    transport: Transport,
    signaling: Arc<RelaySignaling>,
    mirror: RoomMirror,
    sync: PositionSynchronizer,
    engine: ProximityEngine,
    mesh: CallMeshManager,
    router: ScopedMessageRouter,
    nearby: BTreeSet<UserId>,
    awaiting_snapshot: bool,
}

impl OfficeClient {
    pub async fn run(config: ClientConfig) -> Result<()> {
        let local = UserId::parse(&config.username)?;
        let presence = UserPresence::new(local.clone(), &config.display_name, config.start);

        let (transport, snapshot, events) =
            Transport::join_room(&config.server_addr, &config.room, presence)
                .await
                .map_err(|e| anyhow!("Could not join '{}': {}", config.room, e))?;

        CliDisplay::print_connected_message(&config.server_addr, local.as_str(), &config.room);

        let media: Arc<dyn MediaSource> = Arc::new(LoopbackMediaSource::new());
        let (client, outcomes) = Self::new(config, local, transport, snapshot, media);

        client
            .event_loop(events, outcomes, CommandInterface::spawn_reader())
            .await
    }

    pub fn new(
        config: ClientConfig,
        local: UserId,
        transport: Transport,
        snapshot: RoomSnapshot,
        media: Arc<dyn MediaSource>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskOutcome>) {
        let signaling = Arc::new(RelaySignaling::new(
            transport.clone(),
            config.mesh.formation_timeout,
        ));
        let (mesh, outcomes) =
            CallMeshManager::new(local.clone(), config.mesh.clone(), signaling.clone(), media);

        let mirror = RoomMirror::from_snapshot(snapshot);
        let start = mirror.position_of(&local).unwrap_or(config.start);

        let client = Self {
            sync: PositionSynchronizer::new(start, config.tick),
            engine: ProximityEngine::new(config.threshold),
            router: ScopedMessageRouter::new(local.clone(), config.chat_history),
            config,
            local,
            transport,
            signaling,
            mirror,
            mesh,
            nearby: BTreeSet::new(),
            awaiting_snapshot: false,
        };

        (client, outcomes)
    }

    async fn event_loop(
        mut self,
        mut events: mpsc::UnboundedReceiver<NetEvent>,
        mut outcomes: mpsc::UnboundedReceiver<TaskOutcome>,
        mut commands: mpsc::UnboundedReceiver<String>,
    ) -> Result<()> {
        let mut tick = interval(self.config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut heartbeat = interval(self.config.heartbeat);
        heartbeat.tick().await;

        CliDisplay::print_prompt();

        loop {
            let flow = tokio::select! {

                _ = tick.tick() => {

                    self.on_tick(Instant::now());
                    Flow::Continue
                }

                _ = heartbeat.tick() => {

                    match self.transport.heartbeat() {
                        Ok(()) => Flow::Continue,
                        Err(_) => Flow::Exit,
                    }
                }

                event = events.recv() => {

                    match event {
                        Some(event) => self.on_net_event(event),
                        None => Flow::Exit,
                    }
                }

                Some(outcome) = outcomes.recv() => {

                    self.on_outcome(outcome, Instant::now());
                    Flow::Continue
                }

                line = commands.recv() => {

                    match line {
                        Some(line) => self.on_input(&line),
                        None => Flow::Exit,
                    }
                }
            };

            if flow == Flow::Exit {
                break;
            }
        }

        self.leave(&mut outcomes).await;

        Ok(())
    }

    /// One frame: flush the pending move, recompute proximity and bring the
    /// call mesh in line with it.
    pub fn on_tick(&mut self, now: Instant) {
        if let Some((move_id, position)) = self.sync.poll_outgoing(now) {
            if let Err(e) = self.transport.send_position_update(move_id, position) {
                warn!("Could not send move {}: {}", move_id, e);
            }
        }

        let changes = self.engine.tick(self.mirror.positions());

        if let Some(change) = changes.iter().find(|change| change.user == self.local) {
            for user in change.nearby.difference(&self.nearby) {
                CliDisplay::print_notice(&format!("{} is nearby", user));
            }
            for user in self.nearby.difference(&change.nearby) {
                CliDisplay::print_notice(&format!("{} walked away", user));
            }
            self.nearby = change.nearby.clone();
        }

        let group = self.engine.group_of(&self.local);
        let events = self.mesh.update(&group, now);
        self.show_mesh_events(events);
    }

    pub fn on_net_event(&mut self, event: NetEvent) -> Flow {
        match event {
            NetEvent::Snapshot(snapshot) => self.apply_snapshot(snapshot),

            NetEvent::Delta(delta) => self.apply_delta(delta),

            NetEvent::MoveAck(ack) => {
                if let Some(position) = self.sync.on_ack(&ack) {
                    let text = if ack.accepted {
                        format!("Position corrected to {}", position)
                    } else {
                        format!("You can't go there; you are at {}", position)
                    };
                    CliDisplay::print_notice(&text);
                }
            }

            NetEvent::Chat(message) => {
                let line = CliDisplay::format_chat(&message);
                if self.router.route(message, &self.engine) {
                    CliDisplay::print_notice(&line);
                }
            }

            NetEvent::SessionDescription {
                peer,
                session,
                description,
            } => self.signaling.deliver(peer, session, description),

            NetEvent::RoomList(rooms) => {
                CliDisplay::print_room_list(&rooms);
                CliDisplay::print_prompt();
            }

            NetEvent::Error(e) => CliDisplay::print_notice(&format!("Server: {}", e)),

            NetEvent::Disconnected => {
                CliDisplay::print_notice("Lost connection to the server");
                return Flow::Exit;
            }
        }

        Flow::Continue
    }

    pub fn on_outcome(&mut self, outcome: TaskOutcome, now: Instant) {
        let events = self.mesh.on_outcome(outcome, now);
        self.show_mesh_events(events);
    }

    fn on_input(&mut self, line: &str) -> Flow {
        let flow = match CommandInterface::parse(line) {
            Ok(Some(command)) => self.on_command(command),
            Ok(None) => Flow::Continue,
            Err(usage) => {
                eprintln!("{}", usage);
                Flow::Continue
            }
        };

        if flow == Flow::Continue {
            CliDisplay::print_prompt();
        }

        flow
    }

    pub fn on_command(&mut self, command: UserCommand) -> Flow {
        let sent = match command {
            UserCommand::MoveTo(target) => {
                let bounds = self.mirror.bounds();
                if !bounds.contains(&target) {
                    println!("That spot is outside the {}x{} room", bounds.width, bounds.height);
                }
                self.sync.move_to(target);
                Ok(())
            }

            UserCommand::Step { dx, dy } => {
                let target = self.sync.step(dx, dy);
                println!("Walking to {}", target);
                Ok(())
            }

            UserCommand::Mic(on) => self.transport.send_status_update(StatusUpdate {
                mic_on: Some(on),
                ..Default::default()
            }),

            UserCommand::Camera(on) => self.transport.send_status_update(StatusUpdate {
                camera_on: Some(on),
                ..Default::default()
            }),

            UserCommand::Status(status) => self.transport.send_status_update(StatusUpdate {
                status: Some(status),
                ..Default::default()
            }),

            UserCommand::Say(text) => self.transport.send_chat(ChatScope::Office, &text),

            UserCommand::Shout(text) => self.transport.send_chat(ChatScope::Global, &text),

            UserCommand::Who => {
                CliDisplay::print_members(self.mirror.members(), &self.local, self.sync.predicted());
                Ok(())
            }

            UserCommand::Nearby => {
                CliDisplay::print_nearby(self.engine.nearby(&self.local));
                Ok(())
            }

            UserCommand::Rooms => self.transport.request_room_list(),

            UserCommand::Sessions => {
                CliDisplay::print_sessions(&self.mesh.sessions());
                Ok(())
            }

            UserCommand::History => {
                CliDisplay::print_history(self.router.history());
                Ok(())
            }

            UserCommand::Help => {
                CliDisplay::print_help();
                Ok(())
            }

            UserCommand::Exit => {
                println!("Exiting...");
                return Flow::Exit;
            }
        };

        match sent {
            Ok(()) => Flow::Continue,
            Err(e) => {
                eprintln!("{}", e);
                Flow::Exit
            }
        }
    }

    fn apply_snapshot(&mut self, snapshot: RoomSnapshot) {
        info!("Resynced to room version {}", snapshot.version);

        self.mirror.apply_snapshot(snapshot);
        self.awaiting_snapshot = false;

        match self.mirror.position_of(&self.local) {
            Some(position) => self.sync.on_snapshot(position),
            None => warn!("Snapshot does not include {}", self.local),
        }
    }

    fn apply_delta(&mut self, delta: PresenceDelta) {
        match self.mirror.apply_delta(&delta) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e @ OfficeError::StaleDelta { .. }) => {
                if !self.awaiting_snapshot {
                    warn!("{}; requesting a snapshot", e);
                    self.awaiting_snapshot = true;
                    if let Err(e) = self.transport.request_resync() {
                        warn!("Could not request a snapshot: {}", e);
                    }
                }
                return;
            }
            Err(e) => {
                debug!("Dropping delta: {}", e);
                return;
            }
        }

        match delta.change {
            PresenceChange::Joined(presence) if presence.id != self.local => {
                CliDisplay::print_notice(&format!("{} joined the room", presence.display_name));
            }
            PresenceChange::Left { user } => {
                CliDisplay::print_notice(&format!("{} left the room", user));
                self.signaling.forget_peer(&user);
                let events = self.mesh.peer_departed(&user);
                self.show_mesh_events(events);
            }
            _ => {}
        }
    }

    fn show_mesh_events(&self, events: Vec<MeshEvent>) {
        for event in &events {
            CliDisplay::print_notice(&CliDisplay::format_mesh_event(event));
        }
    }

    /// Hangs up, tells the server and gives closing sessions a moment to hand
    /// the media back.
    async fn leave(&mut self, outcomes: &mut mpsc::UnboundedReceiver<TaskOutcome>) {
        let events = self.mesh.teardown();
        self.show_mesh_events(events);

        if let Err(e) = self.transport.leave_room() {
            debug!("Leave not sent: {}", e);
        }

        let deadline = Instant::now() + LEAVE_DRAIN;
        while !self.mesh.is_idle() {
            match timeout_at(deadline, outcomes.recv()).await {
                Ok(Some(outcome)) => self.on_outcome(outcome, Instant::now()),
                _ => break,
            }
        }

        CliDisplay::print_current_user_left_room(&self.config.room);
    }
}

#[cfg(test)]
mod tests {
    use shared::{
        message::ClientMessage,
        types::{MemberState, MoveAck, Position, RoomBounds, SessionId},
    };

    use crate::call_mesh::SessionState;

    use super::*;

    fn id(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn set(names: &[&str]) -> BTreeSet<UserId> {
        names.iter().map(|name| id(name)).collect()
    }

    fn snapshot(version: u64, members: &[(&str, f64, f64)]) -> RoomSnapshot {
        RoomSnapshot {
            version,
            bounds: RoomBounds::default(),
            members: members
                .iter()
                .map(|(name, x, y)| MemberState {
                    presence: UserPresence::new(id(name), name, Position::new(*x, *y)),
                    seq: 0,
                })
                .collect(),
        }
    }

    struct Harness {
        client: OfficeClient,
        outcomes: mpsc::UnboundedReceiver<TaskOutcome>,
        sent: mpsc::UnboundedReceiver<ClientMessage>,
        media: Arc<LoopbackMediaSource>,
    }

    impl Harness {
        fn new(local: &str, snapshot: RoomSnapshot) -> Self {
            let (transport, sent) = Transport::detached();
            let media = Arc::new(LoopbackMediaSource::new());
            let (client, outcomes) = OfficeClient::new(
                ClientConfig::new(local),
                id(local),
                transport,
                snapshot,
                media.clone(),
            );
            Self {
                client,
                outcomes,
                sent,
                media,
            }
        }

        async fn settle(&mut self) {
            for _ in 0..8 {
                tokio::task::yield_now().await;
                while let Ok(outcome) = self.outcomes.try_recv() {
                    self.client.on_outcome(outcome, Instant::now());
                }
            }
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut sent = Vec::new();
            while let Ok(message) = self.sent.try_recv() {
                sent.push(message);
            }
            sent
        }

        fn nearby(&self, user: &str) -> BTreeSet<UserId> {
            self.client.engine.nearby(&id(user)).cloned().unwrap_or_default()
        }
    }

    fn moved(version: u64, user: &str, seq: u64, x: f64, y: f64) -> NetEvent {
        NetEvent::Delta(PresenceDelta {
            version,
            change: PresenceChange::Moved {
                user: id(user),
                seq,
                position: Position::new(x, y),
            },
        })
    }

    #[tokio::test(start_paused = true)]
    async fn nearby_pair_calls_and_hangs_up_after_walking_apart() {
        let room = snapshot(3, &[("a", 0.0, 0.0), ("b", 100.0, 0.0), ("c", 400.0, 0.0)]);
        let mut a = Harness::new("a", room);

        // b's side of the exchange, relayed by the server
        a.client.on_net_event(NetEvent::SessionDescription {
            peer: id("b"),
            session: SessionId(7),
            description: "b@s-7".into(),
        });

        a.client.on_tick(Instant::now());
        assert_eq!(a.nearby("a"), set(&["b"]));
        assert_eq!(a.nearby("b"), set(&["a"]));
        assert_eq!(a.nearby("c"), set(&[]));
        assert_eq!(a.client.mesh.current_state(), Some(SessionState::Forming));

        a.settle().await;
        assert_eq!(a.client.mesh.current_state(), Some(SessionState::Active));
        assert!(a.sent().contains(&ClientMessage::SessionDescription {
            peer: id("b"),
            session: SessionId(1),
            description: "a@s-1".into(),
        }));

        a.client.on_net_event(moved(4, "b", 1, 500.0, 0.0));
        a.client.on_tick(Instant::now());
        assert_eq!(a.nearby("a"), set(&[]));
        assert!(!a.nearby("b").contains(&id("a")));

        // still inside the grace window
        assert_eq!(a.client.mesh.current_state(), Some(SessionState::Active));

        tokio::time::advance(Duration::from_millis(1500)).await;
        a.client.on_tick(Instant::now());
        assert_eq!(a.client.mesh.current_state(), None);

        a.settle().await;
        assert!(a.client.mesh.is_idle());
        assert_eq!(a.media.acquisitions(), 1);
        assert_eq!(a.media.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn isolated_user_never_forms_a_session() {
        let room = snapshot(3, &[("a", 0.0, 0.0), ("b", 100.0, 0.0), ("c", 400.0, 0.0)]);
        let mut c = Harness::new("c", room);

        for _ in 0..3 {
            c.client.on_tick(Instant::now());
            c.settle().await;
        }

        assert_eq!(c.nearby("c"), set(&[]));
        assert!(c.client.mesh.is_idle());
        assert_eq!(c.media.acquisitions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn departed_user_leaves_every_set_and_the_call() {
        let room = snapshot(2, &[("a", 0.0, 0.0), ("b", 100.0, 0.0)]);
        let mut a = Harness::new("a", room);
        a.client.on_net_event(NetEvent::SessionDescription {
            peer: id("b"),
            session: SessionId(1),
            description: "b@s-1".into(),
        });
        a.client.on_tick(Instant::now());
        a.settle().await;
        assert_eq!(a.client.mesh.current_state(), Some(SessionState::Active));

        // a reply b sent just before leaving
        a.client.on_net_event(NetEvent::SessionDescription {
            peer: id("b"),
            session: SessionId(2),
            description: "b@s-2".into(),
        });
        assert!(a.client.signaling.holds_description_from(&id("b")));

        a.client.on_net_event(NetEvent::Delta(PresenceDelta {
            version: 3,
            change: PresenceChange::Left { user: id("b") },
        }));
        assert_eq!(a.client.mesh.current_state(), None);
        assert!(!a.client.signaling.holds_description_from(&id("b")));

        a.client.on_tick(Instant::now());
        assert!(a.client.engine.nearby(&id("b")).is_none());
        assert_eq!(a.nearby("a"), set(&[]));

        a.settle().await;
        assert_eq!(a.media.releases(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_move_snaps_back() {
        let room = snapshot(1, &[("a", 0.0, 10.0)]);
        let mut a = Harness::new("a", room);

        a.client.on_command(UserCommand::MoveTo(Position::new(-10.0, 10.0)));
        assert_eq!(a.client.sync.predicted(), Position::new(-10.0, 10.0));

        a.client.on_tick(Instant::now());
        assert_eq!(
            a.sent(),
            vec![ClientMessage::MoveTo {
                move_id: 1,
                position: Position::new(-10.0, 10.0)
            }]
        );

        a.client.on_net_event(NetEvent::MoveAck(MoveAck {
            move_id: 1,
            accepted: false,
            position: Position::new(0.0, 10.0),
        }));
        assert_eq!(a.client.sync.predicted(), Position::new(0.0, 10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn version_gap_requests_one_snapshot() {
        let room = snapshot(1, &[("a", 0.0, 0.0), ("b", 10.0, 0.0)]);
        let mut a = Harness::new("a", room);

        a.client.on_net_event(moved(3, "b", 1, 20.0, 0.0));
        a.client.on_net_event(moved(4, "b", 2, 30.0, 0.0));

        assert_eq!(a.sent(), vec![ClientMessage::RequestSnapshot]);
        assert_eq!(a.client.mirror.position_of(&id("b")), Some(Position::new(10.0, 0.0)));

        a.client.on_net_event(NetEvent::Snapshot(snapshot(4, &[("a", 0.0, 0.0), ("b", 30.0, 0.0)])));
        a.client.on_net_event(moved(5, "b", 3, 40.0, 0.0));

        assert_eq!(a.client.mirror.position_of(&id("b")), Some(Position::new(40.0, 0.0)));
        assert_eq!(a.client.mirror.version(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn office_chat_is_filtered_by_proximity() {
        let room = snapshot(3, &[("a", 0.0, 0.0), ("b", 100.0, 0.0), ("c", 400.0, 0.0)]);
        let mut b = Harness::new("b", room.clone());
        let mut c = Harness::new("c", room);
        b.client.on_tick(Instant::now());
        c.client.on_tick(Instant::now());

        let message = shared::types::ChatMessage {
            id: 1,
            user_id: id("a"),
            username: "a".into(),
            body: "coffee?".into(),
            timestamp: chrono::Utc::now(),
            scope: ChatScope::Office,
        };
        b.client.on_net_event(NetEvent::Chat(message.clone()));
        c.client.on_net_event(NetEvent::Chat(message));

        assert_eq!(b.client.router.history().count(), 1);
        assert_eq!(c.client.router.history().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_reach_the_server() {
        let mut a = Harness::new("a", snapshot(1, &[("a", 0.0, 0.0)]));

        a.client.on_command(UserCommand::Mic(true));
        a.client.on_command(UserCommand::Shout("hi all".into()));
        assert_eq!(a.client.on_command(UserCommand::Exit), Flow::Exit);

        assert_eq!(
            a.sent(),
            vec![
                ClientMessage::SetStatus(StatusUpdate {
                    mic_on: Some(true),
                    ..Default::default()
                }),
                ClientMessage::SendChat {
                    scope: ChatScope::Global,
                    body: "hi all".into()
                },
            ]
        );
    }
}
