use std::time::Duration;

use log::debug;
use shared::types::{MoveAck, Position};
use tokio::time::Instant;

/// Client-side prediction for the local user's position.
///
/// Moves are applied locally at once and sent at most once per frame
/// interval. Only the newest unsent target is kept, so a burst of moves
/// collapses into one update.
pub struct PositionSynchronizer {
    predicted: Position,
    pending: Option<Position>,
    last_sent: Option<u32>,
    next_move_id: u32,
    last_flush: Option<Instant>,
    frame_interval: Duration,
}

impl PositionSynchronizer {
    pub fn new(start: Position, frame_interval: Duration) -> Self {
        Self {
            predicted: start,
            pending: None,
            last_sent: None,
            next_move_id: 1,
            last_flush: None,
            frame_interval,
        }
    }

    pub fn predicted(&self) -> Position {
        self.predicted
    }

    #[cfg(test)]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn move_to(&mut self, target: Position) {
        self.predicted = target;
        self.pending = Some(target);
    }

    pub fn step(&mut self, dx: f64, dy: f64) -> Position {
        let target = self.predicted.offset(dx, dy);
        self.move_to(target);
        target
    }

    /// Hands out the pending move if a frame interval has passed since the
    /// previous one.
    pub fn poll_outgoing(&mut self, now: Instant) -> Option<(u32, Position)> {
        if let Some(last_flush) = self.last_flush {
            if now.duration_since(last_flush) < self.frame_interval {
                return None;
            }
        }

        let target = self.pending.take()?;
        let move_id = self.next_move_id;
        self.next_move_id = self.next_move_id.wrapping_add(1);
        self.last_sent = Some(move_id);
        self.last_flush = Some(now);

        Some((move_id, target))
    }

    /// Returns the corrected position when the authoritative answer to the
    /// latest move disagrees with the prediction.
    pub fn on_ack(&mut self, ack: &MoveAck) -> Option<Position> {
        if self.last_sent != Some(ack.move_id) || self.pending.is_some() {
            debug!("Ignoring ack for superseded move {}", ack.move_id);
            return None;
        }

        if ack.accepted && ack.position == self.predicted {
            return None;
        }

        self.predicted = ack.position;
        Some(ack.position)
    }

    pub fn on_snapshot(&mut self, authoritative: Position) {
        self.predicted = authoritative;
        self.pending = None;
    }
}
