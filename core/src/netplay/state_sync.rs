//! Stage handshake and frame targeting
//!
//! After loading a stage every peer reports ready. The host waits until all
//! non-pending players are ready (or a deadline passes), then releases the
//! stage with `stage_sync` carrying the frame everyone resumes from.

use std::time::Instant;

use crate::input::PlayerId;
use crate::net::messages::{ClientMessage, HostMessage, StageId, StageSync};
use crate::net::transport::Transport;
use crate::rollback::{Frame, SimulationSession};

use super::lobby::cooled_down;
use super::{Netplay, NetplayEvent};

impl<S: SimulationSession, T: Transport> Netplay<S, T> {
    /// Begin the ready handshake for a freshly loaded stage
    pub(super) fn init_stage_sync(&mut self, stage_id: StageId, now: Instant) {
        let state = &mut self.state;
        let is_host = state.is_host();
        state.current_stage_id = Some(stage_id);
        state.ready_players.clear();
        state.ready_players.insert(state.local_player);
        state.awaiting_stage_ready = is_host;
        state.awaiting_stage_sync = !is_host;
        state.stage_ready_sent_at = (!is_host).then_some(now);
        state.stage_ready_started_at = is_host.then_some(now);
        tracing::info!(
            stage_id,
            stage_seq = state.stage_seq,
            role = state.role.as_str(),
            "Stage loaded, awaiting sync"
        );

        if !is_host {
            let stage_seq = state.stage_seq;
            self.outbox
                .to_host(ClientMessage::StageReady { stage_seq, stage_id });
        }
        self.maybe_send_stage_sync();
    }

    /// Release the stage once every expected player is ready (host)
    pub(super) fn maybe_send_stage_sync(&mut self) {
        if !self.state.is_host() || !self.state.awaiting_stage_ready {
            return;
        }
        let all_ready = self
            .roster
            .iter()
            .filter(|(_, entry)| !entry.pending_spawn)
            .all(|(player, _)| self.state.ready_players.contains(&player));
        if all_ready {
            self.broadcast_stage_sync();
        }
    }

    fn broadcast_stage_sync(&mut self) {
        let state = &mut self.state;
        state.awaiting_stage_ready = false;
        state.stage_ready_started_at = None;
        state.stage_ready_sent_at = None;
        let sync = StageSync {
            stage_seq: state.stage_seq,
            stage_id: state.current_stage_id.unwrap_or(0),
            frame: state.session.frame(),
        };
        tracing::info!(
            stage_id = sync.stage_id,
            stage_seq = sync.stage_seq,
            frame = sync.frame,
            "Stage sync sent"
        );
        self.outbox.broadcast(HostMessage::StageSync(sync));
        self.events.push(NetplayEvent::StageSynced {
            stage_id: sync.stage_id,
            frame: sync.frame,
        });
    }

    /// Release the stage for one late-ready client (host)
    pub(super) fn send_stage_sync_to_client(&mut self, player: PlayerId) {
        let state = &self.state;
        if !state.is_host() {
            return;
        }
        let Some(stage_id) = state.current_stage_id else {
            return;
        };
        let sync = StageSync {
            stage_seq: state.stage_seq,
            stage_id,
            frame: state.session.frame(),
        };
        tracing::debug!(player, frame = sync.frame, "Stage sync sent to client");
        self.outbox.to_client(player, HostMessage::StageSync(sync));
    }

    /// Repeat `stage_ready` until the host answers (client)
    pub(super) fn maybe_resend_stage_ready(&mut self, now: Instant) {
        let state = &mut self.state;
        if state.is_host() || !state.awaiting_stage_sync {
            return;
        }
        let Some(stage_id) = state.current_stage_id else {
            return;
        };
        if !cooled_down(
            state.stage_ready_sent_at,
            now,
            self.config.timing.stage_ready_resend(),
        ) {
            return;
        }
        state.stage_ready_sent_at = Some(now);
        let stage_seq = state.stage_seq;
        tracing::trace!(stage_id, stage_seq, "Resending stage ready");
        self.outbox
            .to_host(ClientMessage::StageReady { stage_seq, stage_id });
    }

    /// Give up on stragglers once the ready deadline passes (host)
    pub(super) fn maybe_force_stage_sync(&mut self, now: Instant) {
        let state = &mut self.state;
        if !state.is_host() || !state.awaiting_stage_ready {
            return;
        }
        let started = *state.stage_ready_started_at.get_or_insert(now);
        let waited = now.saturating_duration_since(started);
        if waited < self.config.timing.stage_ready_timeout() {
            return;
        }
        let missing: Vec<PlayerId> = self
            .roster
            .iter()
            .filter(|(player, entry)| {
                !entry.pending_spawn && !self.state.ready_players.contains(player)
            })
            .map(|(player, _)| player)
            .collect();
        tracing::debug!(
            waited_ms = waited.as_millis() as u64,
            ?missing,
            "Forcing stage sync"
        );
        self.broadcast_stage_sync();
    }

    /// Newest hash frame every active client has sent input for, if the
    /// host has not announced it yet and still holds its hash.
    pub(super) fn authoritative_hash_frame(&self) -> Option<Frame> {
        let state = &self.state;
        if state.hash_interval <= 0 {
            return None;
        }
        let mut auth_frame = state.session.frame();
        for (player, entry) in self.roster.iter() {
            if !entry.is_active() || player == state.local_player {
                continue;
            }
            let client = state.client_states.get(&player)?;
            auth_frame = auth_frame.min(client.last_acked_client_input);
        }
        if auth_frame < 0 {
            return None;
        }
        let hash_frame = auth_frame - auth_frame % state.hash_interval;
        if hash_frame <= state.last_auth_hash_frame_sent || !state.hash_history.contains(hash_frame) {
            return None;
        }
        Some(hash_frame)
    }

    /// Host frame extrapolated from the last one received (client).
    ///
    /// The extrapolation is capped at the rollback window so a silent host
    /// cannot pull the client arbitrarily far ahead.
    pub(super) fn estimated_host_frame(&self, now: Instant) -> f64 {
        let state = &self.state;
        let last = f64::from(state.last_received_host_frame);
        if state.is_host() {
            return last;
        }
        let Some(at) = state.last_host_frame_at else {
            return last;
        };
        let elapsed = now.saturating_duration_since(at).as_secs_f64();
        let step = self.config.sim.step().as_secs_f64();
        let max_advance = f64::from(state.max_rollback.max(1));
        last + (elapsed / step).min(max_advance).max(0.0)
    }

    /// Frames the client runs ahead of the estimated host frame
    pub(super) fn client_lead_frames(&self) -> i32 {
        let pacing = &self.config.pacing;
        let mut lead = pacing.client_lead;
        if let Some(rtt) = self.state.rtt
            && !rtt.is_zero()
        {
            let rtt_frames = rtt.as_secs_f64() / self.config.sim.step().as_secs_f64();
            let extra = ((rtt_frames * 0.5).floor() as i32).clamp(0, pacing.client_max_extra_lead);
            lead += extra;
        }
        let scale = self.state.intro.lead_scale();
        if scale >= 1.0 {
            return lead;
        }
        ((f64::from(lead) * scale).floor() as i32).max(0)
    }

    /// Frame the local simulation should be at by `now`
    pub(super) fn target_frame(&self, now: Instant) -> f64 {
        if self.state.is_host() {
            return f64::from(self.state.session.frame());
        }
        self.estimated_host_frame(now) + f64::from(self.client_lead_frames())
    }

    /// Whether a stage is running, so newcomers must wait for the next one
    pub(super) fn match_in_progress(&self) -> bool {
        let state = &self.state;
        state.current_start.is_some()
            && state.current_stage_id.is_some()
            && !state.awaiting_stage_ready
    }
}
