//! Room roster
//!
//! Every peer keeps the same ordered list of players. Spectators and players
//! waiting for the next stage (pending spawn) stay on the roster but do not
//! drive the simulation.

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::input::PlayerId;
use crate::net::messages::StageSeq;

/// Per-player roster flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RosterEntry {
    pub spectator: bool,
    pub pending_spawn: bool,
}

impl RosterEntry {
    /// Whether the player's inputs are simulated
    pub fn is_active(&self) -> bool {
        !self.spectator && !self.pending_spawn
    }
}

/// Players in the room, ordered by id
#[derive(Debug, Clone, Default)]
pub struct Roster {
    players: BTreeMap<PlayerId, RosterEntry>,
    /// Stage epoch each pending player joined during
    pending_spawn_seq: HashMap<PlayerId, StageSeq>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a player, or update the spectator flag of an existing one.
    ///
    /// Returns `true` when the player was not on the roster before.
    pub fn add(&mut self, player: PlayerId, spectator: bool) -> bool {
        match self.players.get_mut(&player) {
            Some(entry) => {
                entry.spectator = spectator;
                false
            }
            None => {
                self.players.insert(
                    player,
                    RosterEntry {
                        spectator,
                        pending_spawn: false,
                    },
                );
                true
            }
        }
    }

    /// Remove a player
    pub fn remove(&mut self, player: PlayerId) -> Option<RosterEntry> {
        self.pending_spawn_seq.remove(&player);
        self.players.remove(&player)
    }

    pub fn get(&self, player: PlayerId) -> Option<RosterEntry> {
        self.players.get(&player).copied()
    }

    pub fn contains(&self, player: PlayerId) -> bool {
        self.players.contains_key(&player)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// Player ids in ascending order
    pub fn ids(&self) -> impl Iterator<Item = PlayerId> + '_ {
        self.players.keys().copied()
    }

    /// Entries in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (PlayerId, RosterEntry)> + '_ {
        self.players.iter().map(|(id, entry)| (*id, *entry))
    }

    /// Whether the player is on the roster and neither spectating nor
    /// waiting to spawn
    pub fn is_active(&self, player: PlayerId) -> bool {
        self.get(player).is_some_and(|entry| entry.is_active())
    }

    /// Hold the player out of play, spectating, until a stage other than
    /// `stage_seq` starts.
    pub fn mark_pending_spawn(&mut self, player: PlayerId, stage_seq: StageSeq) {
        if let Some(entry) = self.players.get_mut(&player) {
            entry.pending_spawn = true;
            entry.spectator = true;
            self.pending_spawn_seq.insert(player, stage_seq);
        }
    }

    /// Stage epoch a pending player joined during
    pub fn pending_spawn_seq(&self, player: PlayerId) -> Option<StageSeq> {
        self.pending_spawn_seq.get(&player).copied()
    }

    /// Put a player straight into play
    pub fn clear_pending_spawn(&mut self, player: PlayerId) {
        if let Some(entry) = self.players.get_mut(&player) {
            entry.pending_spawn = false;
        }
        self.pending_spawn_seq.remove(&player);
    }

    /// Bring in every pending player whose join epoch differs from
    /// `stage_seq`. Returns the promoted ids.
    pub fn promote_pending(&mut self, stage_seq: StageSeq) -> Vec<PlayerId> {
        let mut promoted = Vec::new();
        for (id, entry) in &mut self.players {
            if !entry.pending_spawn {
                continue;
            }
            if self.pending_spawn_seq.get(id) == Some(&stage_seq) {
                continue;
            }
            entry.pending_spawn = false;
            entry.spectator = false;
            promoted.push(*id);
        }
        for id in &promoted {
            self.pending_spawn_seq.remove(id);
        }
        promoted
    }

    /// Drop everyone
    pub fn clear(&mut self) {
        self.players.clear();
        self.pending_spawn_seq.clear();
    }
}
