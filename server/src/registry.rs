use std::{collections::HashMap, time::Duration};

use log::info;
use shared::{
    error::OfficeError,
    types::{RoomBounds, RoomSnapshot, UserPresence},
};
use tokio::{sync::RwLock, time::interval};

use crate::room_actor::{Outbox, RoomHandle};

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Rooms are created on first join and forgotten once their actor stops.
pub struct RoomRegistry {
    bounds: RoomBounds,
    rooms: RwLock<HashMap<String, RoomHandle>>,
}

impl RoomRegistry {
    pub fn new(bounds: RoomBounds) -> Self {
        Self {
            bounds,
            rooms: RwLock::new(HashMap::new()),
        }
    }

    async fn get_or_spawn(&self, room_name: &str) -> RoomHandle {
        let mut rooms = self.rooms.write().await;

        match rooms.get(room_name) {
            Some(handle) if !handle.is_closed() => handle.clone(),
            _ => {
                let handle = RoomHandle::spawn(room_name, self.bounds);
                rooms.insert(room_name.to_string(), handle.clone());
                handle
            }
        }
    }

    pub async fn join(
        &self,
        room_name: &str,
        presence: UserPresence,
        outbox: Outbox,
    ) -> Result<(RoomHandle, RoomSnapshot), OfficeError> {
        // A room can shut down between lookup and join; one retry against a
        // freshly spawned actor is enough.
        for _ in 0..2 {
            let handle = self.get_or_spawn(room_name).await;

            match handle.join(presence.clone(), outbox.clone()).await {
                Ok(snapshot) => return Ok((handle, snapshot)),
                Err(OfficeError::RoomClosed) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(OfficeError::RoomClosed)
    }

    pub async fn room_list(&self) -> Vec<String> {
        let handles: Vec<RoomHandle> = self.rooms.read().await.values().cloned().collect();

        let mut list = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(count) = handle.member_count().await {
                list.push(format!("{} ({})", handle.name(), count));
            }
        }
        list.sort();
        list
    }

    pub async fn prune_closed(&self) -> usize {
        let mut rooms = self.rooms.write().await;
        let before = rooms.len();

        rooms.retain(|_, handle| !handle.is_closed());

        before - rooms.len()
    }

    pub async fn sweep_forever(&self) {
        let mut sweep_interval = interval(SWEEP_INTERVAL);

        loop {
            sweep_interval.tick().await;

            let removed = self.prune_closed().await;
            if removed > 0 {
                info!("Cleaned up {} closed rooms", removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use shared::types::{Position, UserId};
    use tokio::sync::broadcast;

    use crate::room_actor::LeaveReason;

    use super::*;

    fn presence(raw: &str) -> UserPresence {
        UserPresence::new(UserId::parse(raw).unwrap(), raw, Position::new(1.0, 1.0))
    }

    #[tokio::test]
    async fn same_name_shares_one_room() {
        let registry = RoomRegistry::new(RoomBounds::default());
        let (tx, _rx) = broadcast::channel(8);

        registry.join("lobby", presence("alice"), tx.clone()).await.unwrap();
        let (_, snapshot) = registry.join("lobby", presence("bob"), tx.clone()).await.unwrap();
        registry.join("design", presence("carol"), tx).await.unwrap();

        assert_eq!(snapshot.members.len(), 2);
        assert_eq!(
            registry.room_list().await,
            vec!["design (1)".to_string(), "lobby (2)".to_string()]
        );
    }

    #[tokio::test]
    async fn emptied_room_is_replaced_on_next_join() {
        let registry = RoomRegistry::new(RoomBounds::default());
        let (tx, _rx) = broadcast::channel(8);

        let (room, _) = registry.join("lobby", presence("alice"), tx.clone()).await.unwrap();
        room.leave(&UserId::parse("alice").unwrap(), LeaveReason::Requested)
            .await;
        assert!(room.is_closed());

        let (_, snapshot) = registry.join("lobby", presence("alice"), tx).await.unwrap();
        assert_eq!(snapshot.members.len(), 1);
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn prune_drops_closed_rooms() {
        let registry = RoomRegistry::new(RoomBounds::default());
        let (tx, _rx) = broadcast::channel(8);

        let result = registry
            .join(
                "lobby",
                UserPresence::new(UserId::parse("far").unwrap(), "far", Position::new(-1.0, 0.0)),
                tx,
            )
            .await;
        assert!(matches!(result, Err(OfficeError::OutOfBounds { .. })));

        assert_eq!(registry.prune_closed().await, 1);
        assert!(registry.room_list().await.is_empty());
    }
}
