use std::collections::VecDeque;

use log::trace;
use shared::{
    proximity::ProximityEngine,
    types::{ChatMessage, ChatScope, UserId},
};

/// Filters the room's chat stream down to what the local user may see.
///
/// The server relays every message to everyone; office-scoped messages are
/// only shown when the sender is within range of the local user.
pub struct ScopedMessageRouter {
    local: UserId,
    history: VecDeque<ChatMessage>,
    capacity: usize,
}

impl ScopedMessageRouter {
    pub fn new(local: UserId, capacity: usize) -> Self {
        Self {
            local,
            history: VecDeque::with_capacity(capacity.min(256)),
            capacity: capacity.max(1),
        }
    }

    pub fn should_deliver(&self, message: &ChatMessage, engine: &ProximityEngine) -> bool {
        match message.scope {
            ChatScope::Global => true,
            ChatScope::Office => {
                message.user_id == self.local || engine.is_near(&message.user_id, &self.local)
            }
        }
    }

    /// Keeps the message if it is visible here. Returns whether it was kept.
    pub fn route(&mut self, message: ChatMessage, engine: &ProximityEngine) -> bool {
        if !self.should_deliver(&message, engine) {
            trace!("Filtered office message {} from {}", message.id, message.user_id);
            return false;
        }

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(message);

        true
    }

    pub fn history(&self) -> impl Iterator<Item = &ChatMessage> {
        self.history.iter()
    }
}
