//! Outbound message queue
//!
//! Handlers queue messages here instead of touching the transport, so a
//! handler only needs the state it mutates. The facade flushes the queue in
//! order after every `poll`, `tick` or API call.

use std::time::Instant;

use crate::input::PlayerId;
use crate::net::messages::{ClientMessage, HostMessage};

/// A queued outbound message
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Client to host
    ToHost(ClientMessage),
    /// Host to one client
    ToClient(PlayerId, HostMessage),
    /// Host to every connected client
    Broadcast(HostMessage),
}

/// Pending outbound messages and deferred disconnects
#[derive(Debug, Default)]
pub struct Outbox {
    queue: Vec<Outgoing>,
    disconnects: Vec<(Instant, PlayerId)>,
}

impl Outbox {
    pub fn to_host(&mut self, msg: ClientMessage) {
        self.queue.push(Outgoing::ToHost(msg));
    }

    pub fn to_client(&mut self, player: PlayerId, msg: HostMessage) {
        self.queue.push(Outgoing::ToClient(player, msg));
    }

    pub fn broadcast(&mut self, msg: HostMessage) {
        self.queue.push(Outgoing::Broadcast(msg));
    }

    /// Close the channel to `player` once `at` has passed
    pub fn disconnect_at(&mut self, at: Instant, player: PlayerId) {
        self.disconnects.push((at, player));
    }

    /// Take every queued message, oldest first
    pub fn drain(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.queue)
    }

    /// Take the disconnects that are due by `now`
    pub fn due_disconnects(&mut self, now: Instant) -> Vec<PlayerId> {
        let mut due = Vec::new();
        self.disconnects.retain(|(at, player)| {
            if *at <= now {
                due.push(*player);
                false
            } else {
                true
            }
        });
        due
    }

    /// Queued messages, oldest first
    pub fn pending(&self) -> &[Outgoing] {
        &self.queue
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.queue.clear();
        self.disconnects.clear();
    }
}
