use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use shared::{
    MAX_DESCRIPTION_LENGTH,
    error::OfficeError,
    types::{SessionId, UserId},
};
use tokio::{
    sync::oneshot,
    time::{Instant, timeout},
};

use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescriptor {
    pub id: SessionId,
    pub participants: BTreeSet<UserId>,
    pub created_at: DateTime<Utc>,
}

/// Peer connection negotiation as the call mesh sees it.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    async fn create_session(
        &self,
        participants: &BTreeSet<UserId>,
    ) -> Result<SessionDescriptor, OfficeError>;

    /// Sends our description to `peer` and resolves with the peer's own.
    async fn exchange_description(
        &self,
        session: SessionId,
        peer: &UserId,
        description: String,
    ) -> Result<String, OfficeError>;

    async fn close_session(&self, session: SessionId) -> Result<(), OfficeError>;
}

#[derive(Default)]
struct Inbox {
    /// Descriptions nobody was waiting for yet, with their arrival time.
    early: HashMap<UserId, (String, Instant)>,
    waiting: HashMap<UserId, (SessionId, oneshot::Sender<String>)>,
    open: HashMap<SessionId, BTreeSet<UserId>>,
}

/// Signaling over the office server: descriptions travel as
/// `SessionDescription` commands and a peer's reply counts as connectivity.
///
/// Each side numbers its sessions on its own, so replies are matched by peer.
pub struct RelaySignaling {
    transport: Transport,
    next_session: AtomicU64,
    exchange_timeout: Duration,
    inbox: Mutex<Inbox>,
}

impl RelaySignaling {
    pub fn new(transport: Transport, exchange_timeout: Duration) -> Self {
        Self {
            transport,
            next_session: AtomicU64::new(1),
            exchange_timeout,
            inbox: Mutex::new(Inbox::default()),
        }
    }

    /// Feeds in a description relayed by the server.
    pub fn deliver(&self, peer: UserId, session: SessionId, description: String) {
        trace!("Description from {} for {}", peer, session);

        let Ok(mut inbox) = self.inbox.lock() else {
            return;
        };

        let description = match inbox.waiting.remove(&peer) {
            Some((_, waiter)) => match waiter.send(description) {
                Ok(()) => return,
                Err(description) => description,
            },
            None => description,
        };

        inbox.early.insert(peer, (description, Instant::now()));
    }

    /// Drops everything held for a peer that left the room. An exchange still
    /// waiting on it fails at once.
    pub fn forget_peer(&self, peer: &UserId) {
        if let Ok(mut inbox) = self.inbox.lock() {
            inbox.early.remove(peer);
            if inbox.waiting.remove(peer).is_some() {
                debug!("Abandoned exchange with departed {}", peer);
            }
        }
    }

    #[cfg(test)]
    pub fn holds_description_from(&self, peer: &UserId) -> bool {
        self.inbox
            .lock()
            .map(|inbox| inbox.early.contains_key(peer))
            .unwrap_or(false)
    }

    fn register(
        &self,
        session: SessionId,
        peer: &UserId,
    ) -> Result<Result<String, oneshot::Receiver<String>>, OfficeError> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| OfficeError::Protocol("signaling inbox poisoned".into()))?;

        if let Some((description, received_at)) = inbox.early.remove(peer) {
            if received_at.elapsed() <= self.exchange_timeout {
                return Ok(Ok(description));
            }
            debug!("Discarding stale description from {}", peer);
        }

        let (tx, rx) = oneshot::channel();
        inbox.waiting.insert(peer.clone(), (session, tx));
        Ok(Err(rx))
    }

    fn forget(&self, peer: &UserId, session: SessionId) {
        if let Ok(mut inbox) = self.inbox.lock() {
            if inbox.waiting.get(peer).is_some_and(|(s, _)| *s == session) {
                inbox.waiting.remove(peer);
            }
        }
    }
}

#[async_trait]
impl SignalingChannel for RelaySignaling {
    async fn create_session(
        &self,
        participants: &BTreeSet<UserId>,
    ) -> Result<SessionDescriptor, OfficeError> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));

        self.inbox
            .lock()
            .map_err(|_| OfficeError::Protocol("signaling inbox poisoned".into()))?
            .open
            .insert(id, participants.clone());

        Ok(SessionDescriptor {
            id,
            participants: participants.clone(),
            created_at: Utc::now(),
        })
    }

    async fn exchange_description(
        &self,
        session: SessionId,
        peer: &UserId,
        description: String,
    ) -> Result<String, OfficeError> {
        if description.len() > MAX_DESCRIPTION_LENGTH {
            return Err(OfficeError::SessionFormationFailed {
                peer: peer.to_string(),
                reason: "description too large to relay".into(),
            });
        }

        let reply = self.register(session, peer)?;

        self.transport.send_description(peer, session, description)?;

        let rx = match reply {
            Ok(early) => return Ok(early),
            Err(rx) => rx,
        };

        let failed = |reason: &str| OfficeError::SessionFormationFailed {
            peer: peer.to_string(),
            reason: reason.to_string(),
        };

        match timeout(self.exchange_timeout, rx).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(_)) => Err(failed("exchange abandoned")),
            Err(_) => {
                self.forget(peer, session);
                Err(failed("no answer from peer"))
            }
        }
    }

    async fn close_session(&self, session: SessionId) -> Result<(), OfficeError> {
        let mut inbox = self
            .inbox
            .lock()
            .map_err(|_| OfficeError::Protocol("signaling inbox poisoned".into()))?;

        inbox.waiting.retain(|_, (s, _)| *s != session);

        // Descriptions from this session's peers belong to it unless the peer
        // is also in a session that is still open.
        if let Some(participants) = inbox.open.remove(&session) {
            for peer in participants {
                if !inbox.open.values().any(|others| others.contains(&peer)) {
                    inbox.early.remove(&peer);
                }
            }
        }

        debug!("Closed {}", session);
        Ok(())
    }
}
