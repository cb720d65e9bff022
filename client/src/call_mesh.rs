//! Keeps the local user's call session in line with proximity.
//!
//! A session spans the connected component of the near-graph that contains the
//! local user, so a client is in at most one session. Every transition that
//! can suspend (acquiring media, creating the session, exchanging descriptions,
//! closing) runs on its own task and reports back through a [`TaskOutcome`];
//! nothing here is awaited by the tick loop.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    future::Future,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use shared::{
    error::OfficeError,
    types::{SessionId, UserId},
};
use strum_macros::Display;
use tokio::{sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

use crate::{
    config::MeshConfig,
    media::{MediaLease, MediaSource},
    signaling::{SessionDescriptor, SignalingChannel},
};

/// `Active` means every current peer has completed its exchange; a peer joining
/// an active session puts it back to `Forming` until that peer connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum SessionState {
    Forming,
    Active,
    #[strum(serialize = "tearing down")]
    TearingDown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Forming {
        participants: BTreeSet<UserId>,
    },
    Active {
        session: SessionId,
        participants: BTreeSet<UserId>,
    },
    PeerJoined {
        session: Option<SessionId>,
        peer: UserId,
    },
    PeerLeft {
        session: Option<SessionId>,
        peer: UserId,
    },
    SessionDegraded {
        session: SessionId,
        peer: UserId,
        reason: OfficeError,
    },
    FormationFailed {
        reason: OfficeError,
    },
    TearingDown {
        session: Option<SessionId>,
    },
    Closed {
        session: SessionId,
    },
}

#[derive(Debug)]
pub enum TaskOutcome {
    Formed {
        attempt: u64,
        descriptor: SessionDescriptor,
    },
    FormationFailed {
        attempt: u64,
        error: OfficeError,
    },
    FormationCancelled {
        attempt: u64,
    },
    PeerConnected {
        session: SessionId,
        peer: UserId,
    },
    PeerFailed {
        session: SessionId,
        peer: UserId,
        error: OfficeError,
    },
    PeerCancelled {
        session: SessionId,
        peer: UserId,
    },
    Closed {
        session: SessionId,
    },
}

/// Read-only view of a session for display.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session: Option<SessionId>,
    pub state: SessionState,
    pub participants: BTreeSet<UserId>,
    pub connected: BTreeSet<UserId>,
    pub since: Option<DateTime<Utc>>,
}

struct CallSession {
    attempt: u64,
    descriptor: Option<SessionDescriptor>,
    state: SessionState,
    /// Includes the local user.
    participants: BTreeSet<UserId>,
    connected: BTreeSet<UserId>,
    excluded: BTreeSet<UserId>,
    departures: BTreeMap<UserId, Instant>,
    peer_tokens: HashMap<UserId, CancellationToken>,
    token: CancellationToken,
    created_at: DateTime<Utc>,
}

impl CallSession {
    fn id(&self) -> Option<SessionId> {
        self.descriptor.as_ref().map(|descriptor| descriptor.id)
    }

    fn peers<'a>(&'a self, local: &'a UserId) -> impl Iterator<Item = &'a UserId> {
        self.participants.iter().filter(move |user| *user != local)
    }

    fn drop_peer(&mut self, peer: &UserId) {
        self.participants.remove(peer);
        self.connected.remove(peer);
        self.departures.remove(peer);
        if let Some(token) = self.peer_tokens.remove(peer) {
            token.cancel();
        }
    }
}

pub struct CallMeshManager {
    local: UserId,
    config: MeshConfig,
    signaling: Arc<dyn SignalingChannel>,
    lease: Arc<MediaLease>,
    outcome_tx: mpsc::UnboundedSender<TaskOutcome>,
    session: Option<CallSession>,
    closing: BTreeMap<SessionId, BTreeSet<UserId>>,
    next_attempt: u64,
    retry_after: Option<Instant>,
}

impl CallMeshManager {
    pub fn new(
        local: UserId,
        config: MeshConfig,
        signaling: Arc<dyn SignalingChannel>,
        media: Arc<dyn MediaSource>,
    ) -> (Self, mpsc::UnboundedReceiver<TaskOutcome>) {
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();
        let lease = Arc::new(MediaLease::new(media, config.constraints));

        (
            Self {
                local,
                config,
                signaling,
                lease,
                outcome_tx,
                session: None,
                closing: BTreeMap::new(),
                next_attempt: 1,
                retry_after: None,
            },
            outcome_rx,
        )
    }

    pub fn is_idle(&self) -> bool {
        self.session.is_none() && self.closing.is_empty()
    }

    pub fn sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .session
            .iter()
            .map(|session| SessionSummary {
                session: session.id(),
                state: session.state,
                participants: session.participants.clone(),
                connected: session.connected.clone(),
                since: Some(session.created_at),
            })
            .collect();

        summaries.extend(self.closing.iter().map(|(id, participants)| SessionSummary {
            session: Some(*id),
            state: SessionState::TearingDown,
            participants: participants.clone(),
            connected: BTreeSet::new(),
            since: None,
        }));

        summaries
    }

    #[cfg(test)]
    pub fn current_state(&self) -> Option<SessionState> {
        self.session.as_ref().map(|session| session.state)
    }

    /// Reconciles the session with the local user's proximity group. Called
    /// once per tick; repeated calls with the same group change nothing.
    pub fn update(&mut self, group: &BTreeSet<UserId>, now: Instant) -> Vec<MeshEvent> {
        let mut events = Vec::new();

        let peers: BTreeSet<UserId> = group
            .iter()
            .filter(|user| **user != self.local)
            .cloned()
            .collect();

        if self.session.is_none() {
            if !peers.is_empty() && self.retry_after.is_none_or(|at| now >= at) {
                self.form(peers, &mut events);
            }
            return events;
        }

        let grace = self.config.grace;
        let mut to_connect = Vec::new();
        let mut expired = Vec::new();

        if let Some(session) = self.session.as_mut() {
            for peer in peers.iter().filter(|peer| !session.excluded.contains(*peer)) {
                if session.departures.remove(peer).is_some() {
                    debug!("{} came back before the grace window ran out", peer);
                }

                if session.participants.insert(peer.clone()) {
                    // Active again once the newcomer's exchange completes.
                    session.state = SessionState::Forming;
                    events.push(MeshEvent::PeerJoined {
                        session: session.id(),
                        peer: peer.clone(),
                    });
                    to_connect.push(peer.clone());
                }
            }

            let departing: Vec<UserId> = session
                .peers(&self.local)
                .filter(|peer| !peers.contains(*peer) && !session.departures.contains_key(*peer))
                .cloned()
                .collect();
            for peer in departing {
                debug!("{} left range, dropping in {:?}", peer, grace);
                session.departures.insert(peer, now + grace);
            }

            expired.extend(
                session
                    .departures
                    .iter()
                    .filter(|(_, deadline)| **deadline <= now)
                    .map(|(peer, _)| peer.clone()),
            );
        }

        for peer in to_connect {
            self.connect_peer(peer);
        }

        for peer in expired {
            self.remove_peer(&peer, &mut events);
        }

        self.settle(&mut events);
        events
    }

    /// A peer that left the room is dropped at once, without a grace window.
    pub fn peer_departed(&mut self, peer: &UserId) -> Vec<MeshEvent> {
        let mut events = Vec::new();

        if self
            .session
            .as_ref()
            .is_some_and(|session| session.participants.contains(peer))
        {
            self.remove_peer(peer, &mut events);
            self.settle(&mut events);
        }

        events
    }

    /// Tears the current session down. A no-op when there is nothing left to
    /// tear down.
    pub fn teardown(&mut self) -> Vec<MeshEvent> {
        let Some(session) = self.session.take() else {
            return Vec::new();
        };

        session.token.cancel();

        let id = session.id();
        info!(
            "Tearing down session {}",
            id.map_or("(forming)".to_string(), |id| id.to_string())
        );

        // Without a descriptor the formation task still owns its lease share
        // and gives it back when it sees the cancellation.
        if let Some(descriptor) = session.descriptor {
            self.closing.insert(descriptor.id, session.participants);
            self.spawn_close(descriptor.id);
        }

        vec![MeshEvent::TearingDown { session: id }]
    }

    pub fn on_outcome(&mut self, outcome: TaskOutcome, now: Instant) -> Vec<MeshEvent> {
        let mut events = Vec::new();

        match outcome {
            TaskOutcome::Formed {
                attempt,
                descriptor,
            } => {
                let current = self
                    .session
                    .as_mut()
                    .filter(|session| session.attempt == attempt && session.descriptor.is_none());

                match current {
                    Some(session) => {
                        info!("Session {} created", descriptor.id);
                        session.descriptor = Some(descriptor);

                        let peers: Vec<UserId> = session.peers(&self.local).cloned().collect();
                        for peer in peers {
                            self.connect_peer(peer);
                        }
                    }
                    None => {
                        // torn down while the formation task was finishing
                        debug!("Closing orphaned session {}", descriptor.id);
                        self.closing.insert(descriptor.id, descriptor.participants);
                        self.spawn_close(descriptor.id);
                    }
                }
            }

            TaskOutcome::FormationFailed { attempt, error } => {
                if self
                    .session
                    .as_ref()
                    .is_some_and(|session| session.attempt == attempt)
                {
                    warn!("Session formation failed: {}", error);
                    self.session = None;
                    self.retry_after = Some(now + self.config.grace);
                    events.push(MeshEvent::FormationFailed { reason: error });
                }
            }

            TaskOutcome::FormationCancelled { attempt } => {
                debug!("Formation attempt {} cancelled", attempt);
            }

            TaskOutcome::PeerConnected { session, peer } => {
                if let Some(current) = self.current_mut(session) {
                    if current.participants.contains(&peer) {
                        info!("Connected to {} in {}", peer, session);
                        current.connected.insert(peer);
                    }
                }
            }

            TaskOutcome::PeerFailed {
                session,
                peer,
                error,
            } => {
                if let Some(current) = self.current_mut(session) {
                    if current.participants.contains(&peer) {
                        warn!("Excluding {} from {}: {}", peer, session, error);
                        current.drop_peer(&peer);
                        current.excluded.insert(peer.clone());
                        events.push(MeshEvent::SessionDegraded {
                            session,
                            peer,
                            reason: error,
                        });

                        if current.participants.len() < 2 {
                            self.retry_after = Some(now + self.config.grace);
                        }
                    }
                }
            }

            TaskOutcome::PeerCancelled { session, peer } => {
                debug!("Exchange with {} in {} cancelled", peer, session);
            }

            TaskOutcome::Closed { session } => {
                if self.closing.remove(&session).is_some() {
                    info!("Session {} closed", session);
                    events.push(MeshEvent::Closed { session });
                }
            }
        }

        self.settle(&mut events);
        events
    }

    fn current_mut(&mut self, id: SessionId) -> Option<&mut CallSession> {
        self.session
            .as_mut()
            .filter(|session| session.id() == Some(id))
    }

    fn form(&mut self, peers: BTreeSet<UserId>, events: &mut Vec<MeshEvent>) {
        let attempt = self.next_attempt;
        self.next_attempt += 1;

        let mut participants = peers;
        participants.insert(self.local.clone());

        info!("Forming a session with {:?}", participants);

        let token = CancellationToken::new();
        self.session = Some(CallSession {
            attempt,
            descriptor: None,
            state: SessionState::Forming,
            participants: participants.clone(),
            connected: BTreeSet::new(),
            excluded: BTreeSet::new(),
            departures: BTreeMap::new(),
            peer_tokens: HashMap::new(),
            token: token.clone(),
            created_at: Utc::now(),
        });

        events.push(MeshEvent::Forming {
            participants: participants.clone(),
        });

        let lease = self.lease.clone();
        let signaling = self.signaling.clone();

        lease.hold();

        self.spawn(async move {
            if token.is_cancelled() {
                lease.release().await;
                return TaskOutcome::FormationCancelled { attempt };
            }

            if let Err(error) = lease.ensure_tracks().await {
                lease.release().await;
                return TaskOutcome::FormationFailed { attempt, error };
            }

            let created = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = signaling.create_session(&participants) => Some(result),
            };

            match created {
                Some(Ok(descriptor)) => TaskOutcome::Formed {
                    attempt,
                    descriptor,
                },
                Some(Err(error)) => {
                    lease.release().await;
                    TaskOutcome::FormationFailed { attempt, error }
                }
                None => {
                    lease.release().await;
                    TaskOutcome::FormationCancelled { attempt }
                }
            }
        });
    }

    fn connect_peer(&mut self, peer: UserId) {
        let local = self.local.clone();
        let formation_timeout = self.config.formation_timeout;
        let signaling = self.signaling.clone();

        let Some(session) = self.session.as_mut() else {
            return;
        };
        // Exchanges start once the session exists.
        let Some(id) = session.id() else {
            return;
        };

        let token = session.token.child_token();
        if let Some(previous) = session.peer_tokens.insert(peer.clone(), token.clone()) {
            previous.cancel();
        }

        self.spawn(async move {
            let description = format!("{}@{}", local, id);

            let result = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                result = tokio::time::timeout(
                    formation_timeout,
                    signaling.exchange_description(id, &peer, description),
                ) => Some(result),
            };

            match result {
                None => TaskOutcome::PeerCancelled { session: id, peer },
                Some(Ok(Ok(_answer))) => TaskOutcome::PeerConnected { session: id, peer },
                Some(Ok(Err(error))) => TaskOutcome::PeerFailed {
                    session: id,
                    peer,
                    error,
                },
                Some(Err(_)) => {
                    let error = OfficeError::SessionFormationFailed {
                        peer: peer.to_string(),
                        reason: "timed out".into(),
                    };
                    TaskOutcome::PeerFailed {
                        session: id,
                        peer,
                        error,
                    }
                }
            }
        });
    }

    fn remove_peer(&mut self, peer: &UserId, events: &mut Vec<MeshEvent>) {
        if let Some(session) = self.session.as_mut() {
            session.drop_peer(peer);
            info!("{} dropped from the session", peer);
            events.push(MeshEvent::PeerLeft {
                session: session.id(),
                peer: peer.clone(),
            });
        }
    }

    /// Tears down a session that lost its last peer and promotes a forming
    /// session once every peer is connected.
    fn settle(&mut self, events: &mut Vec<MeshEvent>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        if session.participants.len() < 2 {
            events.extend(self.teardown());
            return;
        }

        let all_connected = session
            .peers(&self.local)
            .all(|peer| session.connected.contains(peer));

        if session.state == SessionState::Forming && all_connected {
            if let Some(id) = session.id() {
                session.state = SessionState::Active;
                info!("Session {} is active", id);
                events.push(MeshEvent::Active {
                    session: id,
                    participants: session.participants.clone(),
                });
            }
        }
    }

    fn spawn_close(&self, id: SessionId) {
        let lease = self.lease.clone();
        let signaling = self.signaling.clone();

        self.spawn(async move {
            if let Err(e) = signaling.close_session(id).await {
                warn!("Error closing {}: {}", id, e);
            }
            lease.release().await;

            TaskOutcome::Closed { session: id }
        });
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = TaskOutcome> + Send + 'static,
    {
        let outcome_tx = self.outcome_tx.clone();

        tokio::spawn(async move {
            let _ = outcome_tx.send(task.await);
        });
    }
}
