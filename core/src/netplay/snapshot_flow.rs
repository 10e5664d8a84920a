//! Full-state resync
//!
//! Snapshots are the escape hatch for everything rollback cannot fix: hash
//! mismatches, inputs older than the host will rewind for, and peers that fell
//! too far behind. Requests and pushes are both cooldown-gated so a flaky peer
//! cannot trigger a snapshot storm.

use std::time::Instant;

use crate::input::PlayerId;
use crate::net::messages::{ClientMessage, HostMessage, SnapshotPayload, SnapshotReason, StageId};
use crate::net::transport::Transport;
use crate::rollback::{Frame, SimulationSession, StateHash};

use super::lobby::cooled_down;
use super::{Netplay, NetplayEvent};

impl<S: SimulationSession, T: Transport> Netplay<S, T> {
    /// Ask the host for a snapshot at `frame` (default: the current frame).
    ///
    /// Mismatch and lag requests have separate cooldowns; `force` skips them.
    /// Returns whether a request was sent.
    pub(super) fn request_snapshot(
        &mut self,
        reason: SnapshotReason,
        frame: Option<Frame>,
        force: bool,
        now: Instant,
    ) -> bool {
        let state = &mut self.state;
        if state.is_host() {
            return false;
        }
        let timing = &self.config.timing;
        let (last, cooldown) = match reason {
            SnapshotReason::Mismatch => (
                state.last_mismatch_request_at,
                timing.snapshot_mismatch_cooldown(),
            ),
            SnapshotReason::Lag => (state.last_snapshot_request_at, timing.snapshot_cooldown()),
        };
        if !force && !cooled_down(last, now, cooldown) {
            tracing::trace!(?reason, "Snapshot request cooling down");
            return false;
        }

        state.last_snapshot_request_at = Some(now);
        if reason == SnapshotReason::Mismatch {
            state.last_mismatch_request_at = Some(now);
        }
        state.awaiting_snapshot = true;
        state.stats.snapshot_requests += 1;
        let frame = frame.unwrap_or_else(|| state.session.frame());
        let stage_seq = state.stage_seq;
        tracing::debug!(?reason, frame, force, "Requesting snapshot");

        self.outbox.to_host(ClientMessage::SnapshotRequest {
            stage_seq,
            frame: Some(frame),
            reason,
        });
        true
    }

    /// Record a hash disagreement and ask for a resync
    pub(super) fn report_desync(
        &mut self,
        frame: Frame,
        local: StateHash,
        remote: StateHash,
        now: Instant,
    ) {
        self.state.stats.hash_mismatches += 1;
        tracing::warn!(
            frame,
            local = format_args!("{local:#010x}"),
            remote = format_args!("{remote:#010x}"),
            "State hash mismatch"
        );
        self.events.push(NetplayEvent::Desync {
            frame,
            local,
            remote,
        });
        self.request_snapshot(SnapshotReason::Mismatch, Some(frame), false, now);
    }

    /// Run the rollback deferred by late client inputs (host).
    ///
    /// Clients whose input caused a refused rollback get a snapshot instead.
    pub(super) fn host_apply_pending_rollback(&mut self) {
        let Some(rollback_frame) = self.state.pending_host_rollback_frame.take() else {
            return;
        };
        let players = std::mem::take(&mut self.state.pending_host_rollback_players);
        if !self.state.rollback_and_resim(rollback_frame, &self.roster) {
            tracing::debug!(rollback_frame, ?players, "Host rollback refused, pushing snapshots");
            for player in players {
                self.send_snapshot_to_client(player, Some(rollback_frame));
            }
            return;
        }
        // Every replayed bundle may differ from what clients already acked
        let current = self.state.session.frame();
        self.state.pending_host_updates.extend(rollback_frame..=current);
    }

    /// Push a snapshot to one client (host).
    ///
    /// Uses the saved state at `frame` when still held, otherwise the
    /// current state.
    pub(super) fn send_snapshot_to_client(&mut self, player: PlayerId, frame: Option<Frame>) {
        let state = &mut self.state;
        let current = state.session.frame();
        let requested = frame.unwrap_or(current).min(current);
        let Some(snapshot) = state
            .session
            .snapshot_at(requested)
            .or_else(|| state.session.snapshot_at(current))
        else {
            tracing::warn!(player, frame = requested, "No state available for snapshot");
            return;
        };
        state.stats.snapshots_sent += 1;
        // Frames up to the snapshot need no resend
        state.client_state_mut(player).ack_host_frame(snapshot.frame, current);
        tracing::debug!(
            player,
            frame = snapshot.frame,
            bytes = snapshot.len(),
            "Sending snapshot"
        );
        let payload = SnapshotPayload {
            stage_seq: state.stage_seq,
            frame: snapshot.frame,
            stage_id: state.current_stage_id,
            checksum: snapshot.checksum,
            state: snapshot.data,
        };
        self.outbox.to_client(player, HostMessage::Snapshot(payload));
    }

    /// Install the held snapshot if it belongs to `loaded_stage` (client).
    ///
    /// A snapshot from an older epoch is dropped; one for a stage that is not
    /// loaded yet stays pending.
    pub(super) fn try_apply_pending_snapshot(&mut self, loaded_stage: Option<StageId>) {
        let Some(pending) = self.pending_snapshot.take() else {
            return;
        };
        if pending.stage_seq != self.state.stage_seq {
            tracing::debug!(
                snapshot_seq = pending.stage_seq,
                stage_seq = self.state.stage_seq,
                "Discarding snapshot from another stage epoch"
            );
            return;
        }
        if pending.stage_id.is_some() && pending.stage_id != loaded_stage {
            self.pending_snapshot = Some(pending);
            return;
        }
        let frame = pending.snapshot.frame;
        match self.state.install_snapshot(&pending.snapshot, &self.roster) {
            Ok(()) => self.events.push(NetplayEvent::SnapshotApplied { frame }),
            Err(e) => tracing::warn!(frame, error = %e, "Failed to install snapshot"),
        }
    }

    /// Push snapshots to clients whose acks fell too far behind (host)
    pub(super) fn host_maybe_send_snapshots(&mut self, now: Instant) {
        let current = self.state.session.frame();
        let behind_limit = self.config.timing.host_snapshot_behind_frames;
        let cooldown = self.config.timing.host_snapshot_cooldown();
        let mut targets = Vec::new();
        for (player, client) in self.state.client_states.iter_mut() {
            let acked = client.last_acked_host_frame.min(current);
            if acked < 0 || current - acked < behind_limit {
                continue;
            }
            if !cooled_down(client.last_snapshot_at, now, cooldown) {
                continue;
            }
            client.last_snapshot_at = Some(now);
            targets.push((*player, current - acked));
        }
        targets.sort_unstable();
        for (player, behind) in targets {
            tracing::warn!(player, behind, "Client fell behind, pushing snapshot");
            self.send_snapshot_to_client(player, Some(current));
        }
    }
}
