//! Per-tick recomputation of the undirected "is near" relation over a room.
//!
//! Every tick compares all unordered pairs, so cost is O(n^2) in the number of
//! users. Rooms are office sized (tens of users); spatial partitioning is not
//! worth it at that scale.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Position, UserId};

/// A user whose nearby-set differs from the previous tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProximityChanged {
    pub user: UserId,
    pub nearby: BTreeSet<UserId>,
}

pub struct ProximityEngine {
    threshold_squared: f64,
    relation: BTreeMap<UserId, BTreeSet<UserId>>,
}

impl ProximityEngine {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold_squared: threshold * threshold,
            relation: BTreeMap::new(),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold_squared.sqrt()
    }

    /// Recomputes the relation from scratch and reports every present user whose
    /// nearby-set changed. Users missing from `positions` drop out of every set.
    pub fn tick<'a, I>(&mut self, positions: I) -> Vec<ProximityChanged>
    where
        I: IntoIterator<Item = (&'a UserId, Position)>,
    {
        let users: Vec<(&UserId, Position)> = positions.into_iter().collect();

        let mut next: BTreeMap<UserId, BTreeSet<UserId>> = users
            .iter()
            .map(|(id, _)| ((*id).clone(), BTreeSet::new()))
            .collect();

        for (i, (a, a_pos)) in users.iter().enumerate() {
            for (b, b_pos) in &users[i + 1..] {
                if a_pos.distance_squared(b_pos) <= self.threshold_squared {
                    if let Some(set) = next.get_mut(*a) {
                        set.insert((*b).clone());
                    }
                    if let Some(set) = next.get_mut(*b) {
                        set.insert((*a).clone());
                    }
                }
            }
        }

        let empty = BTreeSet::new();
        let changes = next
            .iter()
            .filter(|(user, nearby)| self.relation.get(*user).unwrap_or(&empty) != *nearby)
            .map(|(user, nearby)| ProximityChanged {
                user: user.clone(),
                nearby: nearby.clone(),
            })
            .collect();

        self.relation = next;
        changes
    }

    pub fn nearby(&self, user: &UserId) -> Option<&BTreeSet<UserId>> {
        self.relation.get(user)
    }

    pub fn is_near(&self, a: &UserId, b: &UserId) -> bool {
        self.relation.get(a).is_some_and(|set| set.contains(b))
    }

    /// The connected component of the near-graph containing `user`, including
    /// `user` itself. Empty when the user is not in the room.
    pub fn group_of(&self, user: &UserId) -> BTreeSet<UserId> {
        let mut group = BTreeSet::new();
        if !self.relation.contains_key(user) {
            return group;
        }

        let mut stack = vec![user.clone()];
        while let Some(current) = stack.pop() {
            if !group.insert(current.clone()) {
                continue;
            }
            if let Some(neighbours) = self.relation.get(&current) {
                stack.extend(neighbours.iter().filter(|n| !group.contains(*n)).cloned());
            }
        }

        group
    }

    pub fn clear(&mut self) {
        self.relation.clear();
    }
}

impl Default for ProximityEngine {
    fn default() -> Self {
        Self::new(crate::PROXIMITY_THRESHOLD)
    }
}
