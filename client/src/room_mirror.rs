use std::collections::BTreeMap;

use log::trace;
use shared::{
    error::OfficeError,
    types::{MemberState, Position, PresenceChange, PresenceDelta, RoomBounds, RoomSnapshot, UserId},
};

/// The client's copy of the authoritative room state, kept current by
/// snapshots and deltas.
#[derive(Debug, Default)]
pub struct RoomMirror {
    version: u64,
    bounds: RoomBounds,
    members: BTreeMap<UserId, MemberState>,
}

impl RoomMirror {
    pub fn from_snapshot(snapshot: RoomSnapshot) -> Self {
        let mut mirror = Self::default();
        mirror.apply_snapshot(snapshot);
        mirror
    }

    #[cfg(test)]
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn bounds(&self) -> RoomBounds {
        self.bounds
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[cfg(test)]
    pub fn get(&self, user: &UserId) -> Option<&MemberState> {
        self.members.get(user)
    }

    pub fn position_of(&self, user: &UserId) -> Option<Position> {
        self.members.get(user).map(|member| member.presence.position)
    }

    pub fn members(&self) -> impl Iterator<Item = &MemberState> {
        self.members.values()
    }

    pub fn positions(&self) -> impl Iterator<Item = (&UserId, Position)> {
        self.members
            .iter()
            .map(|(id, member)| (id, member.presence.position))
    }

    pub fn apply_snapshot(&mut self, snapshot: RoomSnapshot) {
        self.version = snapshot.version;
        self.bounds = snapshot.bounds;
        self.members = snapshot
            .members
            .into_iter()
            .map(|member| (member.presence.id.clone(), member))
            .collect();
    }

    /// Applies the next delta. Returns `Ok(false)` for a duplicate that was
    /// already folded in, and `StaleDelta` when deltas were skipped; the mirror
    /// is left untouched in both cases.
    pub fn apply_delta(&mut self, delta: &PresenceDelta) -> Result<bool, OfficeError> {
        if delta.version <= self.version {
            trace!("Dropping duplicate delta v{}", delta.version);
            return Ok(false);
        }

        if delta.version > self.version + 1 {
            return Err(OfficeError::StaleDelta {
                expected: self.version + 1,
                received: delta.version,
            });
        }

        self.version = delta.version;

        match &delta.change {
            PresenceChange::Joined(presence) => {
                self.members.insert(
                    presence.id.clone(),
                    MemberState {
                        presence: presence.clone(),
                        seq: 0,
                    },
                );
            }

            PresenceChange::Moved {
                user,
                seq,
                position,
            } => {
                if let Some(member) = self.members.get_mut(user) {
                    if *seq > member.seq {
                        member.seq = *seq;
                        member.presence.position = *position;
                    }
                }
            }

            PresenceChange::StatusChanged {
                user,
                seq,
                mic_on,
                camera_on,
                status,
            } => {
                if let Some(member) = self.members.get_mut(user) {
                    if *seq > member.seq {
                        member.seq = *seq;
                        member.presence.mic_on = *mic_on;
                        member.presence.camera_on = *camera_on;
                        member.presence.status = *status;
                    }
                }
            }

            PresenceChange::Left { user } => {
                self.members.remove(user);
            }
        }

        Ok(true)
    }
}
