//! Per-match netplay session state
//!
//! One `NetplaySessionState` exists per active match. It owns the simulation
//! session and every history window the protocol needs. Components receive it
//! by `&mut` from the facade; none of them keeps a reference to it.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use rand::Rng;

use crate::config::NetplayConfig;
use crate::input::{FrameInputs, PlayerId, QuantizedInput};
use crate::net::messages::{FrameBundle, StageId, StageSeq, StartMatch};
use crate::rollback::{Frame, FrameWindow, GameStateSnapshot, SimulationSession, StateHash};

use super::events::NetplayStats;

/// Which side of the star topology this peer is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Authoritative peer; relays every input
    Host,
    /// Predicting peer connected to the host
    Client,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Client => "client",
        }
    }
}

/// Host-side bookkeeping for one connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientState {
    /// Newest host frame the client confirmed receiving
    pub last_acked_host_frame: Frame,
    /// Newest input frame received from the client
    pub last_acked_client_input: Frame,
    /// Last snapshot pushed to the client
    pub last_snapshot_at: Option<Instant>,
    /// Last snapshot request honoured for the client
    pub last_snapshot_request_at: Option<Instant>,
}

impl ClientState {
    pub fn new() -> Self {
        Self {
            last_acked_host_frame: -1,
            last_acked_client_input: -1,
            last_snapshot_at: None,
            last_snapshot_request_at: None,
        }
    }

    /// Raise the host-frame ack, never past `current`
    pub fn ack_host_frame(&mut self, frame: Frame, current: Frame) {
        self.last_acked_host_frame = self.last_acked_host_frame.max(frame.min(current));
    }

    /// Raise the client-input ack
    pub fn ack_client_input(&mut self, frame: Frame) {
        self.last_acked_client_input = self.last_acked_client_input.max(frame);
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

impl Default for ClientState {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot received but not yet installed
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSnapshot {
    pub stage_seq: StageSeq,
    pub stage_id: Option<StageId>,
    pub snapshot: GameStateSnapshot,
}

/// Stage intro timer, reported by the game every tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntroProgress {
    /// Intro frames left
    pub remaining: u32,
    /// Intro length in frames
    pub total: u32,
}

impl IntroProgress {
    /// Whether the intro is still playing
    pub fn active(&self) -> bool {
        self.remaining > 0
    }

    /// Fraction of the intro already played, 1.0 when none is running
    pub fn lead_scale(&self) -> f64 {
        if self.total == 0 || self.remaining == 0 {
            return 1.0;
        }
        (1.0 - f64::from(self.remaining) / f64::from(self.total)).clamp(0.0, 1.0)
    }
}

/// Everything one match needs, for one peer
pub struct NetplaySessionState<S: SimulationSession> {
    pub(super) role: Role,
    pub(super) local_player: PlayerId,
    pub(super) session: S,

    pub(super) max_rollback: i32,
    pub(super) max_resend: i32,
    pub(super) hash_interval: i32,

    // Input ledger
    pub(super) input_history: FrameWindow<FrameInputs>,
    pub(super) last_inputs: HashMap<PlayerId, QuantizedInput>,
    pub(super) pending_local_inputs: FrameWindow<QuantizedInput>,
    pub(super) last_acked_local_frame: Frame,
    pub(super) last_received_host_frame: Frame,

    // Host relay
    pub(super) host_frame_buffer: FrameWindow<FrameBundle>,
    pub(super) client_states: HashMap<PlayerId, ClientState>,
    pub(super) pending_host_updates: BTreeSet<Frame>,
    pub(super) pending_host_rollback_frame: Option<Frame>,
    pub(super) pending_host_rollback_players: BTreeSet<PlayerId>,

    // Hash authority
    pub(super) hash_history: FrameWindow<StateHash>,
    pub(super) expected_hashes: FrameWindow<StateHash>,
    pub(super) last_auth_hash_frame_sent: Frame,

    // Liveness
    pub(super) last_host_frame_at: Option<Instant>,
    pub(super) lag_behind_since: Option<Instant>,
    pub(super) last_snapshot_request_at: Option<Instant>,
    pub(super) last_mismatch_request_at: Option<Instant>,
    pub(super) awaiting_snapshot: bool,
    pub(super) rtt: Option<Duration>,
    pub(super) ping_seq: u32,
    pub(super) pending_pings: HashMap<u32, Instant>,
    pub(super) last_ping_at: Option<Instant>,

    // Stage handshake
    pub(super) stage_seq: StageSeq,
    pub(super) current_stage_id: Option<StageId>,
    pub(super) current_start: Option<StartMatch>,
    pub(super) ready_players: HashSet<PlayerId>,
    pub(super) awaiting_stage_ready: bool,
    pub(super) awaiting_stage_sync: bool,
    pub(super) stage_ready_sent_at: Option<Instant>,
    pub(super) stage_ready_started_at: Option<Instant>,

    // Tick driver
    pub(super) accumulator: f64,
    pub(super) intro: IntroProgress,

    pub(super) stats: NetplayStats,
}

impl<S: SimulationSession> NetplaySessionState<S> {
    /// Fresh state for a new role. The session is primed at its current
    /// frame and a random stage epoch is drawn.
    pub fn new(role: Role, local_player: PlayerId, mut session: S, config: &NetplayConfig) -> Self {
        let capacity = config.window_capacity();
        let frame = session.frame();
        session.prime(frame);
        Self {
            role,
            local_player,
            session,
            max_rollback: config.sim.max_rollback,
            max_resend: config.sim.max_resend,
            hash_interval: config.sim.hash_interval,
            input_history: FrameWindow::new(capacity),
            last_inputs: HashMap::new(),
            pending_local_inputs: FrameWindow::new(capacity),
            last_acked_local_frame: -1,
            last_received_host_frame: frame,
            host_frame_buffer: FrameWindow::new(capacity),
            client_states: HashMap::new(),
            pending_host_updates: BTreeSet::new(),
            pending_host_rollback_frame: None,
            pending_host_rollback_players: BTreeSet::new(),
            hash_history: FrameWindow::new(capacity),
            expected_hashes: FrameWindow::new(capacity),
            last_auth_hash_frame_sent: -1,
            last_host_frame_at: None,
            lag_behind_since: None,
            last_snapshot_request_at: None,
            last_mismatch_request_at: None,
            awaiting_snapshot: false,
            rtt: None,
            ping_seq: 0,
            pending_pings: HashMap::new(),
            last_ping_at: None,
            stage_seq: rand::rng().random(),
            current_stage_id: None,
            current_start: None,
            ready_players: HashSet::new(),
            awaiting_stage_ready: false,
            awaiting_stage_sync: false,
            stage_ready_sent_at: None,
            stage_ready_started_at: None,
            accumulator: 0.0,
            intro: IntroProgress::default(),
            stats: NetplayStats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }

    pub fn local_player(&self) -> PlayerId {
        self.local_player
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    /// Give the simulation session back
    pub fn into_session(self) -> S {
        self.session
    }

    /// Current stage epoch
    pub fn stage_seq(&self) -> StageSeq {
        self.stage_seq
    }

    pub fn current_stage_id(&self) -> Option<StageId> {
        self.current_stage_id
    }

    pub fn last_acked_local_frame(&self) -> Frame {
        self.last_acked_local_frame
    }

    pub fn last_received_host_frame(&self) -> Frame {
        self.last_received_host_frame
    }

    pub fn awaiting_stage_ready(&self) -> bool {
        self.awaiting_stage_ready
    }

    pub fn awaiting_stage_sync(&self) -> bool {
        self.awaiting_stage_sync
    }

    pub fn awaiting_snapshot(&self) -> bool {
        self.awaiting_snapshot
    }

    /// Latest measured round trip to the host
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn client_state(&self, player: PlayerId) -> Option<&ClientState> {
        self.client_states.get(&player)
    }

    /// Client bookkeeping for `player`, created on first use
    pub(super) fn client_state_mut(&mut self, player: PlayerId) -> &mut ClientState {
        self.client_states.entry(player).or_default()
    }

    /// Locally computed hash for `frame`
    pub fn local_hash(&self, frame: Frame) -> Option<StateHash> {
        self.hash_history.get(frame).copied()
    }

    /// Whether `frame` is on a hash boundary
    pub(super) fn is_hash_frame(&self, frame: Frame) -> bool {
        self.hash_interval > 0 && frame % self.hash_interval == 0
    }

    /// Clear every per-stage table and restart the session at frame 0.
    ///
    /// The stage epoch, roles and client list survive; the acks of each
    /// client start over.
    pub fn reset_for_stage(&mut self) {
        self.input_history.clear();
        self.last_inputs.clear();
        self.pending_local_inputs.clear();
        self.hash_history.clear();
        self.expected_hashes.clear();
        self.last_auth_hash_frame_sent = -1;
        self.pending_host_updates.clear();
        self.pending_pings.clear();
        self.last_ping_at = None;
        self.rtt = None;
        self.last_snapshot_request_at = None;
        self.last_mismatch_request_at = None;
        self.last_host_frame_at = None;
        self.lag_behind_since = None;
        self.awaiting_snapshot = false;
        self.pending_host_rollback_frame = None;
        self.pending_host_rollback_players.clear();
        self.current_stage_id = None;
        self.ready_players.clear();
        self.awaiting_stage_ready = false;
        self.awaiting_stage_sync = false;
        self.stage_ready_sent_at = None;
        self.stage_ready_started_at = None;
        self.last_acked_local_frame = -1;
        self.last_received_host_frame = 0;
        self.host_frame_buffer.clear();
        for client in self.client_states.values_mut() {
            client.reset();
        }
        self.session.prime(0);
        self.accumulator = 0.0;
    }
}
