//! Host-authoritative rollback netplay
//!
//! One host relays every player's input; clients predict ahead of the host
//! and roll back when authoritative inputs disagree with their guesses.
//! Periodic state hashes catch divergence, and full-state snapshots repair it.
//!
//! # Module Structure
//!
//! - `state`: per-match `NetplaySessionState`, host-side `ClientState`
//! - `sim_sync`: input ledger, rollback and snapshot resimulation
//! - `state_sync`: stage handshake, authoritative hash frame, look-ahead
//! - `message_flow`: host and client message handlers, join/leave
//! - `snapshot_flow`: cooldown-gated snapshot requests and pushes
//! - `runtime`: fixed-step tick driver, resend and liveness checks
//! - `roster`, `lobby`: players, profiles, chat, room info
//! - `outbox`: queued outbound messages flushed to the transport
//!
//! # Flow
//!
//! ```text
//!   app ──start_stage / stage_loaded / tick──▶ Netplay ──▶ Outbox ──▶ Transport
//!    ▲                                            │
//!    └───────────── drain_events ◀────────────────┘◀── poll ◀── Transport
//! ```
//!
//! `Netplay` is sans-IO with respect to time: every entry point takes `now`,
//! so the whole protocol runs deterministically against a loopback transport.

mod events;
mod lobby;
mod message_flow;
mod outbox;
mod roster;
mod runtime;
mod sim_sync;
mod snapshot_flow;
mod state;
mod state_sync;

#[cfg(test)]
mod tests;

use std::time::{Duration, Instant};

use thiserror::Error;

use crate::config::NetplayConfig;
use crate::input::PlayerId;
use crate::net::backoff::Backoff;
use crate::net::messages::{
    ClientMessage, HostMessage, PlayerProfile, RoomInfo, StageId, StartMatch,
};
use crate::net::transport::{Transport, TransportEvent};
use crate::rollback::SimulationSession;

pub use events::{NetplayEvent, NetplayStats, NetplayWarning};
pub use lobby::{
    CHAT_HISTORY_LEN, ChatLine, Lobby, fallback_profile, sanitize_avatar, sanitize_chat,
    sanitize_name, sanitize_profile,
};
pub use outbox::{Outbox, Outgoing};
pub use roster::{Roster, RosterEntry};
pub use runtime::{LocalInput, TickContext};
pub use state::{ClientState, IntroProgress, NetplaySessionState, PendingSnapshot, Role};

/// Misuse of the netplay facade
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetplayError {
    /// The session was closed by a kick
    #[error("netplay session is closed")]
    Closed,
    /// The operation is reserved for the host
    #[error("only the host can {0}")]
    HostOnly(&'static str),
    /// Chat sent again before the cooldown elapsed
    #[error("chat is rate limited")]
    ChatRateLimited,
    /// Chat text was empty after sanitizing
    #[error("chat message is empty")]
    EmptyChat,
}

/// Pieces handed back when a netplay session ends
pub struct NetplayParts<S, T> {
    pub session: S,
    pub transport: T,
    pub lobby: Lobby,
}

/// Netplay facade for one connection lifetime.
///
/// Owns the match state, roster, lobby and transport. The application drives
/// it with `poll` (network), `tick` (simulation) and the stage/lobby calls,
/// then drains `NetplayEvent`s.
pub struct Netplay<S: SimulationSession, T: Transport> {
    config: NetplayConfig,
    transport: T,
    state: NetplaySessionState<S>,
    roster: Roster,
    lobby: Lobby,
    outbox: Outbox,
    events: Vec<NetplayEvent>,
    pending_snapshot: Option<PendingSnapshot>,
    backoff: Backoff,
    host_id: PlayerId,
    closed: bool,
}

impl<S: SimulationSession, T: Transport> Netplay<S, T> {
    /// Start hosting `room`
    pub fn host(
        config: NetplayConfig,
        session: S,
        transport: T,
        local_player: PlayerId,
        room: RoomInfo,
        profile: &PlayerProfile,
    ) -> Self {
        let config = config.validate();
        let state = NetplaySessionState::new(Role::Host, local_player, session, &config);
        let mut roster = Roster::new();
        roster.add(local_player, false);
        let mut lobby = Lobby::new(local_player, profile, &config.lobby);
        lobby.set_room(RoomInfo {
            host_id: local_player,
            player_count: Some(1),
            ..room
        });
        tracing::info!(
            player = local_player,
            stage_seq = state.stage_seq(),
            "Netplay host started"
        );

        Self {
            backoff: Backoff::from_config(&config.reconnect),
            config,
            transport,
            state,
            roster,
            lobby,
            outbox: Outbox::default(),
            events: Vec::new(),
            pending_snapshot: None,
            host_id: local_player,
            closed: false,
        }
    }

    /// Join the room hosted by `host_id`
    pub fn client(
        config: NetplayConfig,
        session: S,
        transport: T,
        local_player: PlayerId,
        host_id: PlayerId,
        profile: &PlayerProfile,
    ) -> Self {
        let config = config.validate();
        let state = NetplaySessionState::new(Role::Client, local_player, session, &config);
        let mut roster = Roster::new();
        roster.add(host_id, false);
        roster.add(local_player, false);
        let lobby = Lobby::new(local_player, profile, &config.lobby);
        tracing::info!(player = local_player, host = host_id, "Netplay client started");

        Self {
            backoff: Backoff::from_config(&config.reconnect),
            config,
            transport,
            state,
            roster,
            lobby,
            outbox: Outbox::default(),
            events: Vec::new(),
            pending_snapshot: None,
            host_id,
            closed: false,
        }
    }

    // ========================================================================
    // Network
    // ========================================================================

    /// Process transport events that arrived by `now`
    pub fn poll(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        for player in self.outbox.due_disconnects(now) {
            tracing::debug!(player, "Closing rejected connection");
            self.transport.disconnect(player);
        }
        for event in self.transport.poll(now) {
            match event {
                TransportEvent::Connected(peer) => self.on_peer_connected(peer, now),
                TransportEvent::Disconnected(peer) => self.on_peer_disconnected(peer),
                TransportEvent::Message { from, payload } => self.on_payload(from, &payload, now),
            }
            if self.closed {
                self.transport.close_all();
                return;
            }
        }
        self.flush();
    }

    fn on_payload(&mut self, from: PlayerId, payload: &[u8], now: Instant) {
        match self.state.role() {
            Role::Host => match ClientMessage::from_bytes(payload) {
                Ok(msg) => self.handle_client_message(from, msg, now),
                Err(e) => tracing::warn!(player = from, error = %e, "Dropping undecodable client message"),
            },
            Role::Client => {
                if from != self.host_id {
                    tracing::trace!(peer = from, "Ignoring message from non-host peer");
                    return;
                }
                match HostMessage::from_bytes(payload) {
                    Ok(msg) => self.handle_host_message(msg, now),
                    Err(e) => tracing::warn!(error = %e, "Dropping undecodable host message"),
                }
            }
        }
    }

    /// Hand every queued message to the transport
    fn flush(&mut self) {
        for outgoing in self.outbox.drain() {
            let result = match &outgoing {
                Outgoing::ToHost(msg) => self.transport.send_to(self.host_id, &msg.to_bytes()),
                Outgoing::ToClient(player, msg) => self.transport.send_to(*player, &msg.to_bytes()),
                Outgoing::Broadcast(msg) => self.transport.broadcast(&msg.to_bytes()),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to send netplay message");
            }
        }
    }

    // ========================================================================
    // Stages
    // ========================================================================

    /// Start a new stage under a fresh epoch (host only).
    ///
    /// Emits `LoadStage`; call `stage_loaded` once the stage is ready.
    pub fn start_stage(&mut self, start: StartMatch) -> Result<(), NetplayError> {
        self.ensure_open()?;
        if !self.state.is_host() {
            return Err(NetplayError::HostOnly("start a stage"));
        }
        let stage_seq = self.state.stage_seq.wrapping_add(1);
        self.state.stage_seq = stage_seq;
        let promoted = self.roster.promote_pending(stage_seq);
        let start = StartMatch {
            late_join: false,
            ..start
        };
        self.state.current_start = Some(start.clone());
        self.state.awaiting_snapshot = false;
        self.pending_snapshot = None;
        tracing::info!(
            stage_seq,
            stage_id = start.stage_id,
            promoted = promoted.len(),
            "Starting stage"
        );

        self.outbox.broadcast(HostMessage::Start {
            stage_seq,
            start: start.clone(),
        });
        self.events.push(NetplayEvent::LoadStage(start));
        self.flush();
        Ok(())
    }

    /// The application finished loading `stage_id`.
    ///
    /// Resets every per-stage table, starts the ready handshake and installs
    /// a snapshot that was waiting for this stage.
    pub fn stage_loaded(&mut self, stage_id: StageId, now: Instant) {
        if self.closed {
            return;
        }
        self.state.reset_for_stage();
        self.init_stage_sync(stage_id, now);
        self.try_apply_pending_snapshot(Some(stage_id));
        self.flush();
    }

    /// Send everyone back to the lobby (host only)
    pub fn end_match(&mut self, reason: Option<String>) -> Result<(), NetplayError> {
        self.ensure_open()?;
        if !self.state.is_host() {
            return Err(NetplayError::HostOnly("end the match"));
        }
        self.state.current_start = None;
        tracing::info!(?reason, "Ending match");
        self.outbox.broadcast(HostMessage::MatchEnd { reason });
        self.flush();
        Ok(())
    }

    /// Remove a player from the room (host only)
    pub fn kick_player(
        &mut self,
        player: PlayerId,
        reason: &str,
        now: Instant,
    ) -> Result<(), NetplayError> {
        self.ensure_open()?;
        if !self.state.is_host() {
            return Err(NetplayError::HostOnly("kick players"));
        }
        self.reject_player(player, reason, now);
        self.flush();
        Ok(())
    }

    // ========================================================================
    // Lobby
    // ========================================================================

    /// Send a chat line
    pub fn send_chat(&mut self, text: &str, now: Instant) -> Result<(), NetplayError> {
        self.ensure_open()?;
        let text = sanitize_chat(text).ok_or(NetplayError::EmptyChat)?;
        if !self.lobby.try_local_chat(now) {
            return Err(NetplayError::ChatRateLimited);
        }
        if self.state.is_host() {
            let player = self.state.local_player();
            if let Some(text) = self.lobby.push_chat(player, &text) {
                self.outbox.broadcast(HostMessage::Chat {
                    player,
                    text: text.clone(),
                });
                self.events.push(NetplayEvent::Chat { player, text });
            }
        } else {
            self.outbox.to_host(ClientMessage::Chat { text });
        }
        self.flush();
        Ok(())
    }

    /// Replace the local profile and announce it
    pub fn set_local_profile(&mut self, profile: &PlayerProfile) -> Result<(), NetplayError> {
        self.ensure_open()?;
        let profile = self.lobby.set_local_profile(profile);
        let player = self.state.local_player();
        if self.state.is_host() {
            self.outbox
                .broadcast(HostMessage::PlayerProfile { player, profile });
        } else {
            self.outbox.to_host(ClientMessage::PlayerProfile { profile });
        }
        self.events.push(NetplayEvent::ProfileUpdated { player });
        self.flush();
        Ok(())
    }

    /// Change the room settings (host only)
    pub fn set_room(&mut self, room: RoomInfo) -> Result<(), NetplayError> {
        self.ensure_open()?;
        if !self.state.is_host() {
            return Err(NetplayError::HostOnly("change the room"));
        }
        self.lobby.set_room(RoomInfo {
            host_id: self.state.local_player(),
            ..room
        });
        self.broadcast_room_update();
        self.flush();
        Ok(())
    }

    /// Room with the current player count, as the host advertises it
    fn room_info(&self) -> Option<RoomInfo> {
        let mut room = self.lobby.room()?.clone();
        room.player_count = Some(u8::try_from(self.roster.len()).unwrap_or(u8::MAX));
        Some(room)
    }

    fn broadcast_room_update(&mut self) {
        if let Some(room) = self.room_info() {
            self.lobby.set_room(room.clone());
            self.outbox.broadcast(HostMessage::RoomUpdate(room));
        }
    }

    /// Room capacity: the room setting, bounded by configuration
    fn max_players(&self) -> usize {
        let configured = self.config.lobby.max_players;
        self.lobby
            .room()
            .map_or(configured, |room| {
                usize::from(room.settings.max_players).clamp(1, configured)
            })
    }

    // ========================================================================
    // Signaling
    // ========================================================================

    /// The signaling connection dropped. Returns the delay before the next
    /// reconnect attempt, or `None` when the session was closed by a kick.
    pub fn signal_lost(&mut self) -> Option<Duration> {
        if self.closed {
            return None;
        }
        let delay = self.backoff.next_delay();
        tracing::info!(delay_ms = delay.as_millis() as u64, "Signaling lost, reconnect scheduled");
        self.events.push(NetplayEvent::ReconnectScheduled { delay });
        Some(delay)
    }

    /// The signaling connection is (re)established
    pub fn signal_connected(&mut self) {
        self.backoff.reset();
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Take every event raised since the last call
    pub fn drain_events(&mut self) -> Vec<NetplayEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn config(&self) -> &NetplayConfig {
        &self.config
    }

    pub fn state(&self) -> &NetplaySessionState<S> {
        &self.state
    }

    pub fn session(&self) -> &S {
        self.state.session()
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn lobby(&self) -> &Lobby {
        &self.lobby
    }

    pub fn stats(&self) -> &NetplayStats {
        &self.state.stats
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn host_id(&self) -> PlayerId {
        self.host_id
    }

    /// Snapshot received for a stage that is not loaded yet
    pub fn pending_snapshot(&self) -> Option<&PendingSnapshot> {
        self.pending_snapshot.as_ref()
    }

    /// Whether a kick ended this session
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), NetplayError> {
        if self.closed {
            return Err(NetplayError::Closed);
        }
        Ok(())
    }

    /// Tear down, closing every channel. The lobby keeps its room, profiles
    /// and chat only when `preserve_lobby` is set.
    pub fn into_parts(mut self, preserve_lobby: bool) -> NetplayParts<S, T> {
        self.transport.close_all();
        if !preserve_lobby {
            self.lobby.clear_room();
        }
        tracing::info!(role = self.state.role().as_str(), preserve_lobby, "Netplay session closed");
        NetplayParts {
            session: self.state.into_session(),
            transport: self.transport,
            lobby: self.lobby,
        }
    }
}
