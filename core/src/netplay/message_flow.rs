//! Message handling for both roles
//!
//! Every stage-scoped message carries a `stage_seq`. Anything stamped with an
//! epoch other than the current one is dropped before it can touch state,
//! except `start` (which announces the new epoch) and roster changes.

use std::time::Instant;

use smallvec::SmallVec;

use crate::input::{PlayerId, QuantizedInput};
use crate::net::messages::{
    ClientMessage, FrameBundle, HostMessage, PlayerJoin, PlayerProfile, RoomInfo,
    SnapshotPayload, SnapshotReason, StageId, StageSync, StartMatch,
};
use crate::net::transport::Transport;
use crate::rollback::{Frame, GameStateSnapshot, SimulationSession};

use super::lobby::{cooled_down, sanitize_chat};
use super::state::PendingSnapshot;
use super::{Netplay, NetplayEvent, Role};

/// Effect of a run of host bundles on already simulated frames
#[derive(Default)]
struct FrameUpdate {
    /// Earliest simulated frame whose inputs changed
    rollback_from: Option<Frame>,
    /// Frames the host stamped with an authoritative hash
    hash_frames: SmallVec<[Frame; 4]>,
}

impl<S: SimulationSession, T: Transport> Netplay<S, T> {
    // ========================================================================
    // Connection events
    // ========================================================================

    pub(super) fn on_peer_connected(&mut self, peer: PlayerId, now: Instant) {
        match self.state.role() {
            Role::Host => self.host_accept_connection(peer, now),
            Role::Client => {
                if peer != self.host_id {
                    return;
                }
                tracing::info!(host = peer, "Connected to host");
                self.backoff.reset();
                let profile = self.lobby.local_profile().clone();
                self.outbox.to_host(ClientMessage::PlayerProfile { profile });
            }
        }
    }

    pub(super) fn on_peer_disconnected(&mut self, peer: PlayerId) {
        match self.state.role() {
            Role::Host => self.host_remove_player(peer),
            Role::Client => {
                if peer != self.host_id {
                    return;
                }
                tracing::info!(host = peer, "Host disconnected");
                self.events.push(NetplayEvent::HostDisconnected);
            }
        }
    }

    /// Admit a new connection and bring it up to date (host)
    fn host_accept_connection(&mut self, player: PlayerId, now: Instant) {
        if player == self.state.local_player() {
            return;
        }
        if !self.roster.contains(player) && !self.admit_player(player, now) {
            return;
        }
        let stage_seq = self.state.stage_seq;
        let Some(entry) = self.roster.get(player) else {
            return;
        };
        tracing::info!(player, spectator = entry.spectator, "Player joined");

        // Existing roster, including the newcomer's own entry
        let roster: Vec<_> = self.roster.iter().collect();
        for (id, roster_entry) in &roster {
            let join = PlayerJoin {
                player: *id,
                stage_seq: Some(self.roster.pending_spawn_seq(*id).unwrap_or(stage_seq)),
                spectator: roster_entry.spectator,
                pending_spawn: roster_entry.pending_spawn,
            };
            self.outbox.to_client(player, HostMessage::PlayerJoin(join));
        }

        let announce = PlayerJoin {
            player,
            stage_seq: Some(self.roster.pending_spawn_seq(player).unwrap_or(stage_seq)),
            spectator: entry.spectator,
            pending_spawn: entry.pending_spawn,
        };
        for (id, _) in &roster {
            if *id != player && *id != self.state.local_player() {
                self.outbox.to_client(*id, HostMessage::PlayerJoin(announce));
            }
        }

        self.broadcast_room_update();
        let profiles: Vec<(PlayerId, PlayerProfile)> = self
            .lobby
            .profiles()
            .into_iter()
            .map(|(id, profile)| (id, profile.clone()))
            .collect();
        for (id, profile) in profiles {
            self.outbox
                .to_client(player, HostMessage::PlayerProfile { player: id, profile });
        }

        if let Some(start) = self.state.current_start.clone() {
            let start = StartMatch {
                late_join: true,
                ..start
            };
            self.outbox
                .to_client(player, HostMessage::Start { stage_seq, start });
            if self.state.current_stage_id.is_some() {
                self.send_snapshot_to_client(player, None);
            }
        }

        self.events.push(NetplayEvent::PlayerJoined {
            player,
            spectator: entry.spectator,
        });
    }

    /// Put an unknown player on the roster, or turn them away when the room
    /// is full (host). Players arriving mid-stage wait as spectators.
    fn admit_player(&mut self, player: PlayerId, now: Instant) -> bool {
        if self.roster.len() >= self.max_players() {
            self.state.client_states.remove(&player);
            self.reject_player(player, "Room is full", now);
            return false;
        }
        let late = self.match_in_progress();
        self.roster.add(player, late);
        if late {
            self.roster.mark_pending_spawn(player, self.state.stage_seq);
        }
        self.state.client_state_mut(player);
        self.lobby.ensure_profile(player);
        true
    }

    /// Kick `player` and close their channel shortly after (host)
    pub(super) fn reject_player(&mut self, player: PlayerId, reason: &str, now: Instant) {
        tracing::warn!(player, reason, "Rejecting player");
        self.outbox.to_client(
            player,
            HostMessage::Kick {
                reason: Some(reason.to_string()),
            },
        );
        let at = now + self.config.lobby.kick_disconnect_delay();
        self.outbox.disconnect_at(at, player);
    }

    fn host_remove_player(&mut self, player: PlayerId) {
        let state = &mut self.state;
        state.client_states.remove(&player);
        state.ready_players.remove(&player);
        state.pending_host_rollback_players.remove(&player);
        if self.roster.remove(player).is_none() {
            return;
        }
        self.lobby.remove_player(player);
        tracing::info!(player, "Player left");
        self.outbox.broadcast(HostMessage::PlayerLeave { player });
        self.broadcast_room_update();
        self.maybe_send_stage_sync();
        self.events.push(NetplayEvent::PlayerLeft { player });
    }

    // ========================================================================
    // Host -> Client
    // ========================================================================

    pub(super) fn handle_host_message(&mut self, msg: HostMessage, now: Instant) {
        if let Some(stage_seq) = msg.stage_seq()
            && stage_seq != self.state.stage_seq
            && !msg.bypasses_fence()
        {
            tracing::trace!(
                kind = msg.kind(),
                stage_seq,
                current = self.state.stage_seq,
                "Dropping message from another stage epoch"
            );
            return;
        }

        match msg {
            HostMessage::Kick { reason } => {
                tracing::info!(?reason, "Kicked by host");
                self.closed = true;
                self.outbox.clear();
                self.events.push(NetplayEvent::Kicked { reason });
            }
            HostMessage::Pong { id } => {
                if let Some(sent_at) = self.state.pending_pings.remove(&id) {
                    self.state.rtt = Some(now.saturating_duration_since(sent_at));
                }
            }
            HostMessage::StageSync(sync) => self.handle_stage_sync(sync, now),
            HostMessage::Frame(bundle) => {
                if !self.accepting_frames() {
                    return;
                }
                let mut update = FrameUpdate::default();
                self.apply_frame_bundle(bundle, &mut update, now);
                self.finish_frame_updates(update, now);
            }
            HostMessage::FrameBatch(batch) => {
                if !self.accepting_frames() {
                    return;
                }
                let mut update = FrameUpdate::default();
                for bundle in batch.frames {
                    let bundle = FrameBundle {
                        last_ack: Some(batch.last_ack),
                        ..bundle
                    };
                    self.apply_frame_bundle(bundle, &mut update, now);
                }
                self.finish_frame_updates(update, now);
            }
            HostMessage::Snapshot(payload) => self.handle_snapshot(payload, now),
            HostMessage::Start { stage_seq, start } => self.handle_start(stage_seq, start),
            HostMessage::PlayerJoin(join) => self.handle_player_join(join),
            HostMessage::PlayerLeave { player } => {
                if player == self.state.local_player() {
                    return;
                }
                self.roster.remove(player);
                self.lobby.remove_player(player);
                self.state.last_inputs.remove(&player);
                tracing::info!(player, "Player left");
                self.events.push(NetplayEvent::PlayerLeft { player });
            }
            HostMessage::PlayerProfile { player, profile } => {
                self.lobby.set_profile(player, &profile);
                self.events.push(NetplayEvent::ProfileUpdated { player });
            }
            HostMessage::Chat { player, text } => {
                if let Some(text) = self.lobby.push_chat(player, &text) {
                    self.events.push(NetplayEvent::Chat { player, text });
                }
            }
            HostMessage::RoomUpdate(room) => self.handle_room_update(room),
            HostMessage::MatchEnd { reason } => {
                tracing::info!(?reason, "Match ended by host");
                self.state.current_start = None;
                self.events.push(NetplayEvent::MatchEnded { reason });
            }
        }
    }

    /// Frames only apply once a stage is loaded and released
    fn accepting_frames(&self) -> bool {
        self.state.current_stage_id.is_some() && !self.state.awaiting_stage_sync
    }

    fn handle_stage_sync(&mut self, sync: StageSync, now: Instant) {
        let state = &mut self.state;
        if state.current_stage_id.is_none() {
            state.current_stage_id = Some(sync.stage_id);
        }
        if state.current_stage_id != Some(sync.stage_id) {
            tracing::debug!(
                stage_id = sync.stage_id,
                current = ?state.current_stage_id,
                "Ignoring stage sync for another stage"
            );
            return;
        }
        state.awaiting_stage_sync = false;
        state.stage_ready_sent_at = None;
        // A repeated sync must not rewind progress made since the first one
        state.last_received_host_frame = state.last_received_host_frame.max(sync.frame);
        state.last_host_frame_at = Some(now);
        state.awaiting_snapshot = false;
        state.lag_behind_since = None;
        state.last_acked_local_frame = state.last_acked_local_frame.max(0);
        let current = state.session.frame();
        tracing::info!(
            stage_id = sync.stage_id,
            frame = sync.frame,
            current,
            "Stage sync received"
        );

        // Too far to fast-forward blindly
        if sync.frame > current {
            self.request_snapshot(SnapshotReason::Lag, Some(sync.frame), true, now);
        }
        self.events.push(NetplayEvent::StageSynced {
            stage_id: sync.stage_id,
            frame: sync.frame,
        });
    }

    /// Merge one host bundle into the input ledger, noting into `update`
    /// whether an already simulated frame changed and which hash it carried.
    fn apply_frame_bundle(&mut self, bundle: FrameBundle, update: &mut FrameUpdate, now: Instant) {
        let frame = bundle.frame;
        if frame < 0 {
            return;
        }
        let state = &mut self.state;
        let local = state.local_player;
        if let Some(ack) = bundle.last_ack {
            state.last_acked_local_frame = state.last_acked_local_frame.max(ack);
            state
                .pending_local_inputs
                .remove_through(state.last_acked_local_frame);
        }
        state.last_received_host_frame = state.last_received_host_frame.max(frame);
        state.last_host_frame_at = Some(now);

        // Rows this far ahead would evict the window the next rollback needs;
        // the lag check after the batch asks for a snapshot instead
        let horizon = state.session.frame() + state.input_history.capacity() as Frame
            - state.max_rollback
            - 1;
        if frame > horizon {
            tracing::debug!(frame, horizon, "Host frame beyond input window");
            return;
        }

        let mut changed = false;
        for entry in &bundle.inputs {
            if entry.player == local {
                continue;
            }
            if state.record_input(frame, entry.player, entry.input.clamped()) {
                changed = true;
            }
        }
        // The host's row is authoritative: drop predictions for players it
        // did not simulate
        if let Some(row) = state.input_history.get_mut(frame) {
            let stale: Vec<PlayerId> = row
                .iter()
                .map(|(player, _)| player)
                .filter(|player| {
                    *player != local && !bundle.inputs.iter().any(|e| e.player == *player)
                })
                .collect();
            for player in stale {
                row.remove(player);
                changed = true;
            }
        }
        tracing::trace!(frame, changed, inputs = bundle.inputs.len(), "Host frame merged");

        if let Some(stamp) = bundle.hash
            && stamp.frame >= 0
        {
            state.expected_hashes.insert(stamp.frame, stamp.hash);
            update.hash_frames.push(stamp.frame);
        }
        if changed && frame <= state.session.frame() {
            update.rollback_from = Some(update.rollback_from.map_or(frame, |f| f.min(frame)));
        }
    }

    /// Roll back once for a whole batch, then compare the hashes it carried
    fn finish_frame_updates(&mut self, update: FrameUpdate, now: Instant) {
        if let Some(frame) = update.rollback_from
            && !self.state.rollback_and_resim(frame, &self.roster)
        {
            self.request_snapshot(SnapshotReason::Lag, None, false, now);
        }
        for frame in update.hash_frames {
            let local = self.state.local_hash(frame);
            let remote = self.state.expected_hashes.get(frame).copied();
            if let (Some(local), Some(remote)) = (local, remote)
                && local != remote
            {
                self.report_desync(frame, local, remote, now);
            }
        }
        let current = self.state.session.frame();
        if self.state.last_received_host_frame - current > self.state.max_rollback {
            self.request_snapshot(SnapshotReason::Lag, None, false, now);
        }
    }

    fn handle_snapshot(&mut self, payload: SnapshotPayload, now: Instant) {
        let snapshot =
            match GameStateSnapshot::from_wire(payload.state, payload.frame, payload.checksum) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!(frame = payload.frame, error = %e, "Rejecting snapshot");
                    return;
                }
            };
        let state = &mut self.state;
        state.last_received_host_frame = state.last_received_host_frame.max(payload.frame);
        state.last_host_frame_at = Some(now);
        let loaded = state.current_stage_id;
        tracing::debug!(frame = payload.frame, stage_id = ?payload.stage_id, "Snapshot received");

        self.pending_snapshot = Some(PendingSnapshot {
            stage_seq: payload.stage_seq,
            stage_id: payload.stage_id,
            snapshot,
        });
        if payload.stage_id.is_none() || payload.stage_id == loaded {
            self.try_apply_pending_snapshot(loaded);
        }
    }

    fn handle_start(&mut self, stage_seq: u32, start: StartMatch) {
        let state = &mut self.state;
        state.stage_seq = stage_seq;
        state.current_start = Some(start.clone());
        state.awaiting_snapshot = false;
        state.expected_hashes.clear();
        state.hash_history.clear();
        let local = state.local_player;
        if start.late_join {
            self.roster.mark_pending_spawn(local, stage_seq);
        }
        let promoted = self.roster.promote_pending(stage_seq);
        self.pending_snapshot = None;
        tracing::info!(
            stage_seq,
            stage_id = start.stage_id,
            late_join = start.late_join,
            promoted = promoted.len(),
            "Stage start received"
        );
        self.events.push(NetplayEvent::LoadStage(start));
    }

    fn handle_player_join(&mut self, join: PlayerJoin) {
        let added = self.roster.add(join.player, join.spectator);
        if join.pending_spawn || join.spectator {
            let stage_seq = join.stage_seq.unwrap_or(self.state.stage_seq);
            self.roster.mark_pending_spawn(join.player, stage_seq);
        } else {
            self.roster.clear_pending_spawn(join.player);
        }
        self.lobby.ensure_profile(join.player);
        if added {
            tracing::info!(player = join.player, spectator = join.spectator, "Player joined");
        }
        self.events.push(NetplayEvent::PlayerJoined {
            player: join.player,
            spectator: join.spectator,
        });
    }

    fn handle_room_update(&mut self, mut room: RoomInfo) {
        let cap = u8::try_from(self.config.lobby.max_players).unwrap_or(u8::MAX);
        room.settings.max_players = room.settings.max_players.min(cap);
        self.lobby.set_room(room.clone());
        self.events.push(NetplayEvent::RoomUpdated(room));
    }

    // ========================================================================
    // Client -> Host
    // ========================================================================

    pub(super) fn handle_client_message(&mut self, player: PlayerId, msg: ClientMessage, now: Instant) {
        if let Some(stage_seq) = msg.stage_seq()
            && stage_seq != self.state.stage_seq
        {
            tracing::trace!(
                player,
                kind = msg.kind(),
                stage_seq,
                current = self.state.stage_seq,
                "Dropping message from another stage epoch"
            );
            return;
        }
        if player == self.state.local_player() {
            return;
        }
        if !self.roster.contains(player) && !self.admit_player(player, now) {
            return;
        }

        match msg {
            ClientMessage::Input(input) => {
                if input.player != player {
                    tracing::debug!(player, claimed = input.player, "Dropping input for another player");
                    return;
                }
                self.handle_client_input(player, input.frame, input.input, input.last_ack, now);
            }
            ClientMessage::InputBatch(batch) => {
                for entry in batch.entries {
                    self.handle_client_input(player, entry.frame, entry.input, Some(batch.last_ack), now);
                }
            }
            ClientMessage::Ack { frame, .. } => {
                let current = self.state.session.frame();
                if frame >= 0 {
                    self.state.client_state_mut(player).ack_host_frame(frame, current);
                }
            }
            ClientMessage::Ping { id } => {
                self.outbox.to_client(player, HostMessage::Pong { id });
            }
            ClientMessage::StageReady { stage_id, .. } => self.handle_stage_ready(player, stage_id),
            ClientMessage::SnapshotRequest { frame, reason, .. } => {
                self.handle_snapshot_request(player, frame, reason, now);
            }
            ClientMessage::PlayerProfile { profile } => {
                if !self.lobby.allow_remote_profile(player, now) {
                    tracing::debug!(player, "Profile update throttled");
                    return;
                }
                let profile = self.lobby.set_profile(player, &profile);
                self.outbox
                    .broadcast(HostMessage::PlayerProfile { player, profile });
                self.events.push(NetplayEvent::ProfileUpdated { player });
            }
            ClientMessage::Chat { text } => {
                let Some(text) = sanitize_chat(&text) else {
                    return;
                };
                if !self.lobby.allow_remote_chat(player, now) {
                    tracing::debug!(player, "Chat throttled");
                    return;
                }
                if let Some(text) = self.lobby.push_chat(player, &text) {
                    self.outbox.broadcast(HostMessage::Chat {
                        player,
                        text: text.clone(),
                    });
                    self.events.push(NetplayEvent::Chat { player, text });
                }
            }
        }
    }

    /// Validate and record one client input (host).
    ///
    /// Acks always count. Inputs from spectators, or outside the accepted
    /// window, are dropped; inputs older than the host's rewind bound are
    /// answered with a snapshot; the rest defer a rollback to the next tick.
    fn handle_client_input(
        &mut self,
        player: PlayerId,
        frame: Frame,
        input: QuantizedInput,
        last_ack: Option<Frame>,
        now: Instant,
    ) {
        if frame < 0 {
            return;
        }
        let input = input.clamped();
        let current = self.state.session.frame();
        let client = self.state.client_state_mut(player);
        if let Some(ack) = last_ack
            && ack >= 0
        {
            client.ack_host_frame(ack, current);
        }
        client.ack_client_input(frame);
        if !self.roster.is_active(player) {
            return;
        }

        let limits = &self.config.limits;
        let min_frame = (current - self.state.max_rollback.min(limits.max_input_behind)).max(0);
        let max_frame = current + limits.max_input_ahead;
        if frame < min_frame || frame > max_frame {
            tracing::trace!(player, frame, min_frame, max_frame, "Input outside accepted window");
            return;
        }

        if frame <= current && current - frame > limits.host_max_input_rollback {
            let cooldown = self.config.timing.host_snapshot_cooldown();
            let client = self.state.client_state_mut(player);
            if cooled_down(client.last_snapshot_at, now, cooldown) {
                client.last_snapshot_at = Some(now);
                tracing::debug!(player, frame, current, "Input too old to roll back, pushing snapshot");
                self.send_snapshot_to_client(player, Some(current));
            }
            return;
        }

        if self.state.record_input(frame, player, input) && frame <= current {
            let state = &mut self.state;
            state.pending_host_rollback_frame = Some(
                state
                    .pending_host_rollback_frame
                    .map_or(frame, |pending| pending.min(frame)),
            );
            state.pending_host_rollback_players.insert(player);
        }
    }

    fn handle_stage_ready(&mut self, player: PlayerId, stage_id: StageId) {
        let state = &mut self.state;
        if state.current_stage_id.is_none() {
            state.current_stage_id = Some(stage_id);
        }
        if state.current_stage_id != Some(stage_id) {
            tracing::debug!(player, stage_id, current = ?state.current_stage_id, "Stage ready for another stage");
            return;
        }
        state.ready_players.insert(player);
        tracing::debug!(player, stage_id, "Player ready");
        if !state.awaiting_stage_ready {
            self.send_stage_sync_to_client(player);
            return;
        }
        self.maybe_send_stage_sync();
    }

    fn handle_snapshot_request(
        &mut self,
        player: PlayerId,
        frame: Option<Frame>,
        reason: SnapshotReason,
        now: Instant,
    ) {
        let cooldown = self.config.timing.snapshot_cooldown();
        let client = self.state.client_state_mut(player);
        if !cooled_down(client.last_snapshot_request_at, now, cooldown) {
            tracing::debug!(player, ?reason, "Snapshot request throttled");
            return;
        }
        client.last_snapshot_request_at = Some(now);
        let current = self.state.session.frame();
        let min_frame = (current - self.state.max_rollback).max(0);
        let frame = frame
            .filter(|frame| *frame >= 0)
            .unwrap_or(current)
            .max(min_frame)
            .min(current);
        tracing::debug!(player, frame, ?reason, "Snapshot requested");
        self.send_snapshot_to_client(player, Some(frame));
    }
}
