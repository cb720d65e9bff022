use std::collections::BTreeMap;

use chrono::Utc;
use shared::{
    error::OfficeError,
    types::{
        ChatMessage, ChatScope, MemberState, MoveAck, Position, PresenceChange, PresenceDelta,
        RoomBounds, RoomSnapshot, StatusUpdate, UserId, UserPresence,
    },
};

/// Authoritative presence records for one room. Every accepted mutation bumps
/// `version` and returns the delta that has to be fanned out.
pub struct Room {
    pub name: String,
    bounds: RoomBounds,
    version: u64,
    next_chat_id: u64,
    members: BTreeMap<UserId, MemberState>,
}

impl Room {
    pub fn new(name: &str, bounds: RoomBounds) -> Self {
        Self {
            name: name.to_string(),
            bounds,
            version: 0,
            next_chat_id: 1,
            members: BTreeMap::new(),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.members.contains_key(user)
    }

    pub fn presence(&self, user: &UserId) -> Option<&UserPresence> {
        self.members.get(user).map(|member| &member.presence)
    }

    pub fn join(&mut self, presence: UserPresence) -> Result<PresenceDelta, OfficeError> {
        if self.members.contains_key(&presence.id) {
            return Err(OfficeError::DuplicateId(presence.id.to_string()));
        }
        self.bounds.check(&presence.position)?;

        self.members.insert(
            presence.id.clone(),
            MemberState {
                presence: presence.clone(),
                seq: 0,
            },
        );

        Ok(self.stamp(PresenceChange::Joined(presence)))
    }

    /// Validates and applies a move. The ack always carries the position the
    /// store holds after the call, so a rejected client can snap back to it.
    pub fn update_position(
        &mut self,
        user: &UserId,
        move_id: u32,
        position: Position,
    ) -> Result<(MoveAck, PresenceDelta), (MoveAck, OfficeError)> {
        let bounds = self.bounds;
        let Some(member) = self.members.get_mut(user) else {
            let ack = MoveAck {
                move_id,
                accepted: false,
                position,
            };
            return Err((ack, OfficeError::UnknownUser(user.to_string())));
        };

        if let Err(e) = bounds.check(&position) {
            let ack = MoveAck {
                move_id,
                accepted: false,
                position: member.presence.position,
            };
            return Err((ack, e));
        }

        member.presence.position = position;
        member.seq += 1;
        let seq = member.seq;

        let ack = MoveAck {
            move_id,
            accepted: true,
            position,
        };
        let delta = self.stamp(PresenceChange::Moved {
            user: user.clone(),
            seq,
            position,
        });

        Ok((ack, delta))
    }

    pub fn update_status(
        &mut self,
        user: &UserId,
        update: StatusUpdate,
    ) -> Result<PresenceDelta, OfficeError> {
        let member = self
            .members
            .get_mut(user)
            .ok_or_else(|| OfficeError::UnknownUser(user.to_string()))?;

        update.apply_to(&mut member.presence);
        member.seq += 1;

        let change = PresenceChange::StatusChanged {
            user: user.clone(),
            seq: member.seq,
            mic_on: member.presence.mic_on,
            camera_on: member.presence.camera_on,
            status: member.presence.status,
        };

        Ok(self.stamp(change))
    }

    pub fn leave(&mut self, user: &UserId) -> Option<PresenceDelta> {
        self.members.remove(user)?;

        Some(self.stamp(PresenceChange::Left { user: user.clone() }))
    }

    /// Stamps a chat line for relay. Chat does not touch presence, so the room
    /// version is left alone.
    pub fn chat(
        &mut self,
        user: &UserId,
        scope: ChatScope,
        body: String,
    ) -> Result<ChatMessage, OfficeError> {
        let presence = self
            .presence(user)
            .ok_or_else(|| OfficeError::UnknownUser(user.to_string()))?;

        let message = ChatMessage {
            id: self.next_chat_id,
            user_id: user.clone(),
            username: presence.display_name.clone(),
            body,
            timestamp: Utc::now(),
            scope,
        };
        self.next_chat_id += 1;

        Ok(message)
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            version: self.version,
            bounds: self.bounds,
            members: self.members.values().cloned().collect(),
        }
    }

    fn stamp(&mut self, change: PresenceChange) -> PresenceDelta {
        self.version += 1;

        PresenceDelta {
            version: self.version,
            change,
        }
    }
}

#[cfg(test)]
mod tests {
    use shared::types::Status;

    use super::*;

    fn id(raw: &str) -> UserId {
        UserId::parse(raw).unwrap()
    }

    fn room_with(users: &[(&str, f64, f64)]) -> Room {
        let mut room = Room::new("lobby", RoomBounds::new(1000.0, 500.0));
        for (name, x, y) in users {
            room.join(UserPresence::new(id(name), name, Position::new(*x, *y)))
                .unwrap();
        }
        room
    }

    #[test]
    fn duplicate_join_is_rejected_without_bumping_version() {
        let mut room = room_with(&[("alice", 0.0, 0.0)]);
        let before = room.version();

        let result = room.join(UserPresence::new(id("alice"), "again", Position::new(5.0, 5.0)));

        assert_eq!(result, Err(OfficeError::DuplicateId("alice".into())));
        assert_eq!(room.version(), before);
        assert_eq!(room.presence(&id("alice")).unwrap().display_name, "alice");
    }

    #[test]
    fn out_of_bounds_move_keeps_previous_position() {
        let mut room = room_with(&[("alice", 0.0, 10.0)]);
        let before = room.version();

        let (ack, error) = room
            .update_position(&id("alice"), 4, Position::new(-10.0, 10.0))
            .unwrap_err();

        assert!(matches!(error, OfficeError::OutOfBounds { .. }));
        assert!(!ack.accepted);
        assert_eq!(ack.move_id, 4);
        assert_eq!(ack.position, Position::new(0.0, 10.0));
        assert_eq!(room.version(), before);
    }

    #[test]
    fn non_finite_positions_are_out_of_bounds() {
        let mut room = room_with(&[("alice", 1.0, 1.0)]);

        assert!(room
            .update_position(&id("alice"), 1, Position::new(f64::NAN, 1.0))
            .is_err());
        assert!(room
            .update_position(&id("alice"), 2, Position::new(1.0, f64::INFINITY))
            .is_err());
    }

    #[test]
    fn edges_of_the_room_are_inside() {
        let mut room = room_with(&[("alice", 0.0, 0.0)]);

        assert!(room
            .update_position(&id("alice"), 1, Position::new(1000.0, 500.0))
            .is_ok());
    }

    #[test]
    fn every_mutation_advances_version_and_user_seq() {
        let mut room = room_with(&[("alice", 0.0, 0.0), ("bob", 10.0, 10.0)]);
        assert_eq!(room.version(), 2);

        let (_, moved) = room
            .update_position(&id("alice"), 1, Position::new(20.0, 20.0))
            .unwrap();
        let status = room
            .update_status(
                &id("alice"),
                StatusUpdate {
                    status: Some(Status::Busy),
                    ..Default::default()
                },
            )
            .unwrap();
        let left = room.leave(&id("bob")).unwrap();

        assert_eq!(moved.version, 3);
        assert_eq!(status.version, 4);
        assert_eq!(left.version, 5);
        assert!(matches!(moved.change, PresenceChange::Moved { seq: 1, .. }));
        assert!(matches!(
            status.change,
            PresenceChange::StatusChanged { seq: 2, status: Status::Busy, .. }
        ));
        assert!(room.leave(&id("bob")).is_none());
        assert_eq!(room.version(), 5);
    }

    #[test]
    fn snapshot_reflects_members_and_seqs() {
        let mut room = room_with(&[("alice", 0.0, 0.0), ("bob", 10.0, 10.0)]);
        room.update_position(&id("bob"), 1, Position::new(11.0, 11.0))
            .unwrap();

        let snapshot = room.snapshot();

        assert_eq!(snapshot.version, 3);
        assert_eq!(snapshot.members.len(), 2);
        let bob = snapshot
            .members
            .iter()
            .find(|member| member.presence.id == id("bob"))
            .unwrap();
        assert_eq!(bob.seq, 1);
        assert_eq!(bob.presence.position, Position::new(11.0, 11.0));
    }

    #[test]
    fn chat_is_stamped_with_increasing_ids() {
        let mut room = room_with(&[("alice", 0.0, 0.0)]);

        let first = room.chat(&id("alice"), ChatScope::Global, "hi".into()).unwrap();
        let second = room.chat(&id("alice"), ChatScope::Office, "psst".into()).unwrap();

        assert_eq!(first.id + 1, second.id);
        assert_eq!(first.username, "alice");
        assert!(room.chat(&id("ghost"), ChatScope::Global, "boo".into()).is_err());
    }
}
