//! Fixed-step tick driver
//!
//! The host simulates at real time. Clients chase a target frame a few frames
//! ahead of the host's extrapolated position, speeding up or slowing down
//! inside a rate band, so their inputs reach the host before it needs them.

use std::time::{Duration, Instant};

use crate::input::QuantizedInput;
use crate::net::messages::{
    ClientMessage, FrameBatch, HashStamp, HostMessage, InputBatch, InputEntry, SnapshotReason,
};
use crate::net::transport::Transport;
use crate::rollback::{Frame, SimulationSession};

use super::lobby::cooled_down;
use super::state::IntroProgress;
use super::{Netplay, NetplayWarning, Role};

/// Per-call inputs from the application
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickContext {
    /// The stage is loaded and the game is ready to simulate
    pub stage_ready: bool,
    /// Stage intro progress
    pub intro: IntroProgress,
}

/// Source of the local player's input, sampled once per simulated frame
pub trait LocalInput {
    fn sample(&mut self, frame: Frame) -> QuantizedInput;
}

impl<F: FnMut(Frame) -> QuantizedInput> LocalInput for F {
    fn sample(&mut self, frame: Frame) -> QuantizedInput {
        self(frame)
    }
}

impl<S: SimulationSession, T: Transport> Netplay<S, T> {
    /// Advance the simulation by `dt` of wall time.
    ///
    /// Returns the number of frames simulated.
    pub fn tick(
        &mut self,
        dt: Duration,
        now: Instant,
        ctx: TickContext,
        input: &mut impl LocalInput,
    ) -> u32 {
        if self.closed || !ctx.stage_ready {
            return 0;
        }
        self.state.intro = ctx.intro;
        let ticks = self.run_tick(dt, now, input);
        self.flush();
        ticks
    }

    fn run_tick(&mut self, dt: Duration, now: Instant, input: &mut impl LocalInput) -> u32 {
        let is_host = self.state.is_host();
        if !is_host && self.state.awaiting_stage_sync {
            self.maybe_resend_stage_ready(now);
            self.state.accumulator = 0.0;
            return 0;
        }
        if is_host && self.state.awaiting_stage_ready {
            self.maybe_force_stage_sync(now);
            if self.state.awaiting_stage_ready {
                self.state.accumulator = 0.0;
                return 0;
            }
        }
        if is_host {
            self.host_apply_pending_rollback();
        }

        let step_ms = self.config.sim.step_ms();
        let current = self.state.session.frame();
        let drift =
            self.target_frame(now) - (f64::from(current) + self.state.accumulator / step_ms);

        if !is_host {
            self.client_liveness(drift, now);
            if drift < -self.config.pacing.client_ahead_slack {
                // Far enough ahead: idle, but keep the host fed
                self.client_send_input_buffer(current);
                return 0;
            }
        }

        let intro = self.state.intro.active();
        let band = if intro {
            self.config.pacing.intro
        } else {
            self.config.pacing.gameplay
        };
        let rate = if is_host { 1.0 } else { band.rate_for_drift(drift) };
        let max_acc = step_ms * f64::from(self.config.sim.max_frame_delta);
        let acc = (self.state.accumulator + dt.as_secs_f64() * 1000.0 * rate).min(max_acc);
        self.state.accumulator = acc;

        let mut ticks = (acc / step_ms).floor() as u32;
        if ticks == 0 && drift > band.force_tick {
            ticks = 1;
        }
        if drift > band.extra_ticks {
            let extra = if intro { 2 } else { 1 };
            ticks = (ticks + extra).max(1).min(band.max_ticks);
        }

        for _ in 0..ticks {
            self.step(now, input);
            self.state.accumulator -= step_ms;
        }
        self.state.accumulator = self.state.accumulator.max(0.0);

        if is_host {
            self.host_maybe_send_snapshots(now);
        }
        self.state.stats.ticks += u64::from(ticks);
        ticks
    }

    /// Pings, host-stall detection and the lag fuse (client)
    fn client_liveness(&mut self, drift: f64, now: Instant) {
        let timing = &self.config.timing;
        let state = &mut self.state;

        if cooled_down(state.last_ping_at, now, timing.ping_interval()) {
            state.ping_seq = state.ping_seq.wrapping_add(1);
            let id = state.ping_seq;
            state.pending_pings.insert(id, now);
            let stall = timing.host_stall();
            state
                .pending_pings
                .retain(|_, sent| now.saturating_duration_since(*sent) <= stall);
            state.last_ping_at = Some(now);
            self.outbox.to_host(ClientMessage::Ping { id });
        }

        let can_request = cooled_down(
            self.state.last_snapshot_request_at,
            now,
            self.config.timing.snapshot_cooldown(),
        );
        let host_age = self
            .state
            .last_host_frame_at
            .map(|at| now.saturating_duration_since(at));
        if let Some(age) = host_age
            && age >= self.config.timing.host_stall()
            && can_request
        {
            let frame = self.state.last_received_host_frame;
            tracing::warn!(
                age_ms = age.as_millis() as u64,
                frame,
                "Host frames stalled, requesting snapshot"
            );
            self.request_snapshot(SnapshotReason::Lag, Some(frame), true, now);
            return;
        }

        if drift > self.config.timing.lag_fuse_frames {
            let since = *self.state.lag_behind_since.get_or_insert(now);
            let behind_for = now.saturating_duration_since(since);
            if behind_for >= self.config.timing.lag_fuse() && can_request {
                tracing::warn!(
                    drift = format_args!("{drift:.1}"),
                    behind_ms = behind_for.as_millis() as u64,
                    "Lagging behind host, requesting snapshot"
                );
                self.state.lag_behind_since = None;
                self.request_snapshot(SnapshotReason::Lag, None, true, now);
            }
        } else {
            self.state.lag_behind_since = None;
        }
    }

    /// Simulate one frame with the local input sampled for it
    fn step(&mut self, now: Instant, input: &mut impl LocalInput) {
        let is_host = self.state.is_host();
        let current = self.state.session.frame();
        if !is_host {
            let drift = self.target_frame(now) - f64::from(current);
            if drift < -self.config.pacing.client_ahead_slack {
                self.client_send_input_buffer(current);
                return;
            }
        }

        let frame = current + 1;
        let local = self.state.local_player;
        // The host ignores spectator input, so spectators simulate neutral
        let local_input = if self.roster.is_active(local) {
            input.sample(frame).clamped()
        } else {
            QuantizedInput::NEUTRAL
        };
        self.state.record_input(frame, local, local_input);
        if !is_host {
            self.state.pending_local_inputs.insert(frame, local_input);
        }

        let inputs = self.state.build_inputs(frame, &self.roster);
        self.state.session.advance_to(frame, &inputs);

        if self.state.is_hash_frame(frame) {
            let hash = self.state.session.state_hash();
            self.state.hash_history.insert(frame, hash);
            if let Some(expected) = self.state.expected_hashes.get(frame).copied()
                && expected != hash
            {
                self.report_desync(frame, hash, expected, now);
            }
        }

        if is_host {
            let stamp = self.authoritative_hash_frame().and_then(|hash_frame| {
                let hash = self.state.local_hash(hash_frame)?;
                Some(HashStamp {
                    frame: hash_frame,
                    hash,
                })
            });
            if let Some(stamp) = stamp {
                self.state.last_auth_hash_frame_sent = stamp.frame;
            }
            let bundle = self.state.frame_bundle(frame, &inputs, stamp);
            let state = &mut self.state;
            state.host_frame_buffer.insert(frame, bundle);
            state
                .host_frame_buffer
                .trim_before(frame - state.max_rollback.max(state.max_resend));
        }
        self.state.trim_history(frame);

        match self.state.role() {
            Role::Host => self.host_resend_frames(frame),
            Role::Client => self.client_send_input_buffer(frame),
        }
    }

    /// Send each client every frame it has not acked yet, bounded by the
    /// resend window, plus frames rewritten by a rollback (host)
    fn host_resend_frames(&mut self, current: Frame) {
        let state = &mut self.state;
        let rewritten = std::mem::take(&mut state.pending_host_updates);
        let mut players: Vec<_> = state.client_states.keys().copied().collect();
        players.sort_unstable();

        for player in players {
            let Some(client) = state.client_states.get(&player) else {
                continue;
            };
            let start = (client.last_acked_host_frame + 1).max(current - state.max_resend + 1);
            let mut frames: Vec<Frame> = rewritten.iter().copied().filter(|f| *f < start).collect();
            frames.extend(start.max(0)..=current);
            let bundles: Vec<_> = frames
                .into_iter()
                .filter_map(|frame| state.host_frame_buffer.get(frame).cloned())
                .collect();
            if bundles.is_empty() {
                continue;
            }
            tracing::trace!(player, count = bundles.len(), current, "Sending frames");
            let batch = FrameBatch {
                stage_seq: state.stage_seq,
                last_ack: client.last_acked_client_input,
                frames: bundles,
            };
            self.outbox.to_client(player, HostMessage::FrameBatch(batch));
        }
    }

    /// Send every local input the host has not acked, bounded by the resend
    /// window (client)
    fn client_send_input_buffer(&mut self, current: Frame) {
        let state = &self.state;
        let start = state.last_acked_local_frame + 1;
        let from = start.max(current - state.max_resend + 1).max(0);
        let entries: Vec<InputEntry> = (from..=current)
            .filter_map(|frame| {
                let input = *state.pending_local_inputs.get(frame)?;
                Some(InputEntry { frame, input })
            })
            .collect();
        let stage_seq = state.stage_seq;
        let last_ack = state.last_received_host_frame;
        if !entries.is_empty() {
            self.outbox.to_host(ClientMessage::InputBatch(InputBatch {
                stage_seq,
                last_ack,
                entries,
            }));
        }
        if start > current {
            self.outbox.to_host(ClientMessage::Ack {
                stage_seq,
                frame: last_ack,
            });
        }
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// Human-readable status lines for a debug overlay
    pub fn debug_lines(&self, now: Instant) -> Vec<String> {
        let state = &self.state;
        let current = state.session.frame();
        let stage = state
            .current_stage_id
            .map_or_else(|| "-".to_string(), |id| id.to_string());
        let mut lines = vec![
            format!("net {} id={}", state.role.as_str(), state.local_player),
            format!("stage={stage} seq={}", state.stage_seq),
            format!(
                "frame={current} host={} ack={}",
                state.last_received_host_frame, state.last_acked_local_frame
            ),
        ];
        let drift = self.target_frame(now) - f64::from(current);
        lines.push(format!("drift={drift:.2} acc={:.3}", state.accumulator));
        lines.push(format!(
            "sync={} ready={} snap={}",
            state.awaiting_stage_sync, state.awaiting_stage_ready, state.awaiting_snapshot
        ));

        match state.role {
            Role::Client => {
                let age = state.last_host_frame_at.map_or_else(
                    || "n/a".to_string(),
                    |at| format!("{:.2}s", now.saturating_duration_since(at).as_secs_f64()),
                );
                lines.push(format!("hostAge={age}"));
            }
            Role::Host => {
                let peers = self.transport.peers();
                lines.push(format!("peers={}", peers.len()));
                let mut behind: Vec<_> = state
                    .client_states
                    .iter()
                    .map(|(player, client)| (*player, (current - client.last_acked_host_frame).max(0)))
                    .collect();
                if !behind.is_empty() {
                    behind.sort_unstable();
                    let parts: Vec<String> = behind
                        .iter()
                        .map(|(player, frames)| format!("{player}:{frames}"))
                        .collect();
                    lines.push(format!("behind={}", parts.join(" ")));
                }
            }
        }

        let entry = self.roster.get(state.local_player).unwrap_or_default();
        lines.push(format!(
            "local spec={} spawn={}",
            entry.spectator, entry.pending_spawn
        ));
        if state.intro.active() {
            lines.push(format!("intro={}", state.intro.remaining));
        }
        lines
    }

    /// Most pressing network condition to surface, if any
    pub fn warning(&self, now: Instant) -> Option<NetplayWarning> {
        let state = &self.state;
        if !state.is_host() {
            if let Some(at) = state.last_host_frame_at {
                let age = now.saturating_duration_since(at);
                if age > self.config.timing.host_stall() {
                    return Some(NetplayWarning::HostStale { age });
                }
            }
            if state.awaiting_stage_sync {
                return Some(NetplayWarning::AwaitingStageSync);
            }
        }
        let entry = self.roster.get(state.local_player)?;
        if entry.pending_spawn {
            return Some(NetplayWarning::LocalPendingSpawn);
        }
        if entry.spectator {
            return Some(NetplayWarning::LocalSpectator);
        }
        None
    }
}
