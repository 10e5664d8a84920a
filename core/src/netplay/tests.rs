//! Multi-peer netplay scenarios over the loopback transport

use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;

use super::*;
use crate::input::QuantizedInput;
use crate::net::loopback::{LinkProfile, LoopbackNetwork, LoopbackTransport};
use crate::net::messages::{
    FrameBundle, HashStamp, InputFrame, PlayerInput, SnapshotReason, StageSync,
};
use crate::rollback::{Frame, RollbackSession};
use crate::test_utils::CounterSim;

type TestNetplay = Netplay<RollbackSession<CounterSim>, LoopbackTransport>;
type InputFn = Box<dyn FnMut(Frame) -> QuantizedInput>;

const HOST: PlayerId = 1;
const STAGE: StageId = 7;
const STEP: Duration = Duration::from_micros(16_667);

// ============================================================================
// Harness
// ============================================================================

fn profile(name: &str) -> PlayerProfile {
    PlayerProfile {
        name: name.to_string(),
        avatar_data: None,
    }
}

fn room() -> RoomInfo {
    RoomInfo {
        room_id: "room-1".to_string(),
        course_id: "beginner".to_string(),
        ..RoomInfo::default()
    }
}

fn start_match() -> StartMatch {
    StartMatch {
        game_source: "smb1".to_string(),
        game_mode: "race".to_string(),
        course: "beginner/1".to_string(),
        stage_id: STAGE,
        ..StartMatch::default()
    }
}

fn ready() -> TickContext {
    TickContext {
        stage_ready: true,
        ..TickContext::default()
    }
}

/// Stick pattern that changes every 20 frames, different per player
fn scripted_input(player: PlayerId) -> InputFn {
    Box::new(move |frame| {
        let phase = (frame / 20 + i32::from(player)) % 5;
        QuantizedInput::new((phase * 20) as i8, 0, 0)
    })
}

/// Held input that changes at random, like a real player
fn random_input(seed: u64) -> InputFn {
    let mut rng = Pcg32::seed_from_u64(seed);
    let mut held = QuantizedInput::NEUTRAL;
    Box::new(move |_| {
        if rng.random_bool(0.2) {
            held = QuantizedInput::new(
                rng.random_range(-127..=127),
                rng.random_range(-127..=127),
                rng.random_range(0..16),
            );
        }
        held
    })
}

struct Peer {
    netplay: TestNetplay,
    input: InputFn,
}

struct Harness {
    net: LoopbackNetwork,
    now: Instant,
    config: NetplayConfig,
    host: Peer,
    clients: Vec<Peer>,
}

impl Harness {
    fn new(num_clients: usize) -> Self {
        Self::with_config(num_clients, NetplayConfig::default(), LinkProfile::default())
    }

    fn with_config(num_clients: usize, config: NetplayConfig, link: LinkProfile) -> Self {
        let now = Instant::now();
        let net = LoopbackNetwork::new(link, 7, now);
        let netplay = Netplay::host(
            config.clone(),
            RollbackSession::new(CounterSim::default(), config.sim.max_rollback),
            net.endpoint(HOST),
            HOST,
            room(),
            &profile("host"),
        );
        let mut harness = Self {
            net,
            now,
            config,
            host: Peer {
                netplay,
                input: scripted_input(HOST),
            },
            clients: Vec::new(),
        };
        for _ in 0..num_clients {
            harness.add_client();
        }
        harness.settle();
        harness
    }

    fn add_client(&mut self) -> PlayerId {
        let id = HOST + 1 + self.clients.len() as PlayerId;
        let netplay = Netplay::client(
            self.config.clone(),
            RollbackSession::new(CounterSim::default(), self.config.sim.max_rollback),
            self.net.endpoint(id),
            id,
            HOST,
            &profile(&format!("p{id}")),
        );
        self.net.connect(HOST, id);
        self.clients.push(Peer {
            netplay,
            input: scripted_input(id),
        });
        id
    }

    fn host(&mut self) -> &mut TestNetplay {
        &mut self.host.netplay
    }

    fn client(&mut self, id: PlayerId) -> &mut TestNetplay {
        &mut self.clients[usize::from(id - HOST - 1)].netplay
    }

    fn set_input(&mut self, id: PlayerId, input: InputFn) {
        if id == HOST {
            self.host.input = input;
        } else {
            self.clients[usize::from(id - HOST - 1)].input = input;
        }
    }

    fn advance(&mut self, dt: Duration) {
        self.now += dt;
        self.net.set_now(self.now);
    }

    /// Deliver everything due by now
    fn pump(&mut self) {
        for _ in 0..4 {
            self.host.netplay.poll(self.now);
            for peer in &mut self.clients {
                peer.netplay.poll(self.now);
            }
        }
    }

    /// Let in-flight traffic land, whatever the link latency
    fn settle(&mut self) {
        self.pump();
        for _ in 0..8 {
            self.advance(Duration::from_millis(10));
            self.pump();
        }
    }

    /// Start a stage and run the ready handshake on every peer
    fn start_stage(&mut self) {
        self.host.netplay.start_stage(start_match()).unwrap();
        let now = self.now;
        self.host.netplay.stage_loaded(STAGE, now);
        self.settle();
        let now = self.now;
        for peer in &mut self.clients {
            peer.netplay.stage_loaded(STAGE, now);
        }
        self.settle();
    }

    fn run_frames(&mut self, frames: usize) {
        for _ in 0..frames {
            self.advance(STEP);
            let now = self.now;
            let host = &mut self.host;
            host.netplay.tick(STEP, now, ready(), &mut host.input);
            self.pump();
            for peer in &mut self.clients {
                peer.netplay.tick(STEP, now, ready(), &mut peer.input);
            }
            self.pump();
        }
    }

    fn peers(&self) -> impl Iterator<Item = &TestNetplay> {
        std::iter::once(&self.host.netplay).chain(self.clients.iter().map(|peer| &peer.netplay))
    }

    /// Every open peer agrees on a recent settled hash frame
    fn assert_converged(&self) {
        let interval = self.config.sim.hash_interval;
        let host_frame = self.host.netplay.session().frame();
        let hash_frame = (host_frame - 5) / interval * interval;
        let expected = self.host.netplay.state().local_hash(hash_frame);
        assert!(expected.is_some(), "host has no hash for frame {hash_frame}");
        for peer in self.peers().filter(|peer| !peer.is_closed()) {
            assert_eq!(
                peer.state().local_hash(hash_frame),
                expected,
                "player {} diverged at frame {hash_frame}",
                peer.state().local_player()
            );
            assert_eq!(peer.stats().hash_mismatches, 0);
        }
    }
}

fn has_event(events: &[NetplayEvent], pred: impl Fn(&NetplayEvent) -> bool) -> bool {
    events.iter().any(pred)
}

fn client_input(stage_seq: u32, frame: Frame, player: PlayerId, x: i8) -> ClientMessage {
    ClientMessage::Input(InputFrame {
        stage_seq,
        frame,
        player,
        input: QuantizedInput::new(x, 0, 0),
        last_ack: None,
    })
}

// ============================================================================
// Lobby and handshake
// ============================================================================

#[test]
fn test_clients_join_room() {
    let mut h = Harness::new(2);
    let host = h.host();
    assert_eq!(host.roster().len(), 3);
    assert_eq!(host.lobby().room().and_then(|room| room.player_count), Some(3));

    let client = h.client(3);
    assert!(client.roster().contains(2));
    assert!(client.roster().is_active(3));
    assert_eq!(client.lobby().profile(2).map(|p| p.name.as_str()), Some("p2"));
    assert_eq!(client.lobby().room().map(|room| room.host_id), Some(HOST));
    let events = client.drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::RoomUpdated(_))));
}

#[test]
fn test_stage_handshake_releases_every_peer() {
    let mut h = Harness::new(2);
    h.start_stage();

    assert!(!h.host().state().awaiting_stage_ready());
    let stage_seq = h.host().state().stage_seq();
    for id in [2, 3] {
        let client = h.client(id);
        assert!(!client.state().awaiting_stage_sync());
        assert_eq!(client.state().stage_seq(), stage_seq);
        assert_eq!(client.state().current_stage_id(), Some(STAGE));
        let events = client.drain_events();
        assert!(has_event(&events, |e| matches!(e, NetplayEvent::LoadStage(start) if start.stage_id == STAGE)));
        assert!(has_event(&events, |e| matches!(e, NetplayEvent::StageSynced { frame: 0, .. })));
    }
}

#[test]
fn test_start_stage_is_host_only() {
    let mut h = Harness::new(1);
    let result = h.client(2).start_stage(start_match());
    assert_eq!(result, Err(NetplayError::HostOnly("start a stage")));
}

#[test]
fn test_stage_ready_timeout_forces_sync() {
    let mut h = Harness::new(1);
    h.host().start_stage(start_match()).unwrap();
    let now = h.now;
    h.host().stage_loaded(STAGE, now);
    h.settle();

    // The client never reports ready
    let mut input = scripted_input(HOST);
    let now = h.now;
    assert_eq!(h.host().tick(STEP, now, ready(), &mut input), 0);
    assert!(h.host().state().awaiting_stage_ready());

    h.advance(Duration::from_secs(13));
    let now = h.now;
    h.host().tick(STEP, now, ready(), &mut input);
    assert!(!h.host().state().awaiting_stage_ready());
    let events = h.host().drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::StageSynced { .. })));
}

#[test]
fn test_tick_waits_for_stage() {
    let mut h = Harness::new(1);
    let mut input = scripted_input(2);
    let now = h.now;
    let ticks = h.client(2).tick(STEP, now, TickContext::default(), &mut input);
    assert_eq!(ticks, 0);
    assert_eq!(h.client(2).session().frame(), 0);
}

// ============================================================================
// Stage fencing
// ============================================================================

#[test]
fn test_stale_epoch_frames_are_dropped() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(20);

    let now = h.now;
    let client = h.client(2);
    let stale = client.state().stage_seq().wrapping_add(1);
    let received = client.state().last_received_host_frame();
    let requests = client.stats().snapshot_requests;
    let frame = received + 1;

    client.handle_host_message(
        HostMessage::Frame(FrameBundle {
            stage_seq: stale,
            frame,
            inputs: vec![PlayerInput {
                player: HOST,
                input: QuantizedInput::new(99, 0, 0),
            }],
            hash: None,
            last_ack: None,
        }),
        now,
    );
    client.handle_host_message(
        HostMessage::StageSync(StageSync {
            stage_seq: stale,
            stage_id: STAGE,
            frame: 500,
        }),
        now,
    );

    assert_eq!(client.state().last_received_host_frame(), received);
    assert_eq!(client.stats().snapshot_requests, requests);
    let held = client
        .state
        .input_history
        .get(frame)
        .and_then(|row| row.get(HOST));
    assert_ne!(held, Some(QuantizedInput::new(99, 0, 0)));
}

#[test]
fn test_start_passes_the_fence() {
    let mut h = Harness::new(1);
    h.start_stage();
    let now = h.now;
    let client = h.client(2);
    let next = client.state().stage_seq().wrapping_add(5);
    client.drain_events();

    client.handle_host_message(
        HostMessage::Start {
            stage_seq: next,
            start: start_match(),
        },
        now,
    );
    assert_eq!(client.state().stage_seq(), next);
    let events = client.drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::LoadStage(_))));
}

#[test]
fn test_host_drops_stale_client_input() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(30);

    let now = h.now;
    let host = h.host();
    let stale = host.state().stage_seq().wrapping_add(1);
    let acked = host.state().client_state(2).map(|c| c.last_acked_client_input);
    let frame = host.session().frame() - 2;
    host.handle_client_message(2, client_input(stale, frame, 2, -90), now);

    assert_eq!(host.state.pending_host_rollback_frame, None);
    assert_eq!(host.state().client_state(2).map(|c| c.last_acked_client_input), acked);
}

#[test]
fn test_duplicate_stage_sync_keeps_progress() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(60);

    let now = h.now;
    let client = h.client(2);
    let stage_seq = client.state().stage_seq();
    let received = client.state().last_received_host_frame();
    let acked = client.state().last_acked_local_frame();
    let requests = client.stats().snapshot_requests;
    assert!(received > 0 && acked > 0);

    // A resent release for the same stage arrives late
    client.handle_host_message(
        HostMessage::StageSync(StageSync {
            stage_seq,
            stage_id: STAGE,
            frame: 0,
        }),
        now,
    );
    assert_eq!(client.state().last_received_host_frame(), received);
    assert_eq!(client.state().last_acked_local_frame(), acked);
    assert_eq!(client.stats().snapshot_requests, requests);

    h.run_frames(30);
    h.assert_converged();
}

// ============================================================================
// Rollback
// ============================================================================

#[test]
fn test_late_client_input_rolls_back_host() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(100);

    let now = h.now;
    let host = h.host();
    let stage_seq = host.state().stage_seq();
    let frame = host.session().frame() - 5;
    let rollbacks = host.stats().rollback_count;

    host.handle_client_message(2, client_input(stage_seq, frame, 2, -100), now);
    assert_eq!(host.state.pending_host_rollback_frame, Some(frame));

    h.advance(STEP);
    let now = h.now;
    let mut input = scripted_input(HOST);
    let host = h.host();
    host.tick(STEP, now, ready(), &mut input);
    assert_eq!(host.stats().rollback_count, rollbacks + 1);
    assert_eq!(host.state.pending_host_rollback_frame, None);
    let bundle = host.state.host_frame_buffer.get(frame).unwrap();
    assert!(bundle.inputs.contains(&PlayerInput {
        player: 2,
        input: QuantizedInput::new(-100, 0, 0),
    }));
}

#[test]
fn test_duplicate_input_is_idempotent() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(50);

    let now = h.now;
    let host = h.host();
    let stage_seq = host.state().stage_seq();
    let frame = host.session().frame() - 3;
    host.handle_client_message(2, client_input(stage_seq, frame, 2, -60), now);
    assert_eq!(host.state.pending_host_rollback_frame, Some(frame));
    host.host_apply_pending_rollback();
    let rollbacks = host.stats().rollback_count;

    host.handle_client_message(2, client_input(stage_seq, frame, 2, -60), now);
    assert_eq!(host.state.pending_host_rollback_frame, None);
    host.host_apply_pending_rollback();
    assert_eq!(host.stats().rollback_count, rollbacks);
}

#[test]
fn test_input_outside_window_is_ignored() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(10);

    let now = h.now;
    let host = h.host();
    let stage_seq = host.state().stage_seq();
    let far = host.session().frame() + host.config().limits.max_input_ahead + 1;
    host.handle_client_message(2, client_input(stage_seq, far, 2, 10), now);
    assert!(host.state.input_history.get(far).is_none());
    assert_eq!(host.state.pending_host_rollback_frame, None);
}

#[test]
fn test_spoofed_player_input_is_ignored() {
    let mut h = Harness::new(2);
    h.start_stage();
    h.run_frames(20);

    let now = h.now;
    let host = h.host();
    let stage_seq = host.state().stage_seq();
    let frame = host.session().frame() - 2;
    host.handle_client_message(2, client_input(stage_seq, frame, 3, -120), now);
    assert_eq!(host.state.pending_host_rollback_frame, None);
}

#[test]
fn test_far_ahead_host_frame_keeps_rollback_window() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(40);

    let now = h.now;
    let client = h.client(2);
    let stage_seq = client.state().stage_seq();
    let current = client.session().frame();
    let local_held = client.state.input_history.get(current).and_then(|row| row.get(2));
    assert!(local_held.is_some());
    let requests = client.stats().snapshot_requests;

    // Same ring slot as the current frame
    let far = current + client.state.input_history.capacity() as Frame;
    client.handle_host_message(
        HostMessage::Frame(FrameBundle {
            stage_seq,
            frame: far,
            inputs: vec![PlayerInput {
                player: HOST,
                input: QuantizedInput::new(55, 0, 0),
            }],
            hash: Some(HashStamp { frame: far, hash: 1 }),
            last_ack: None,
        }),
        now,
    );

    let state = &client.state;
    assert_eq!(state.input_history.get(current).and_then(|row| row.get(2)), local_held);
    assert!(state.input_history.get(far).is_none());
    assert!(state.expected_hashes.get(far).is_none());
    assert_eq!(state.last_received_host_frame(), far);
    assert_eq!(client.stats().hash_mismatches, 0);
    assert_eq!(client.stats().snapshot_requests, requests + 1);
    assert!(client.outbox.pending().iter().any(|out| matches!(
        out,
        Outgoing::ToHost(ClientMessage::SnapshotRequest {
            reason: SnapshotReason::Lag,
            ..
        })
    )));

    // The next local frame still has a slot of its own
    let next = QuantizedInput::new(-77, 0, 0);
    assert!(client.state.record_input(current + 1, 2, next));
}

// ============================================================================
// Snapshots
// ============================================================================

#[test]
fn test_stage_sync_ahead_requests_snapshot() {
    let mut h = Harness::new(1);
    h.host().start_stage(start_match()).unwrap();
    h.settle();

    let now = h.now;
    let client = h.client(2);
    client.stage_loaded(STAGE, now);
    assert!(client.state().awaiting_stage_sync());
    assert_eq!(client.warning(now), Some(NetplayWarning::AwaitingStageSync));

    let stage_seq = client.state().stage_seq();
    client.handle_host_message(
        HostMessage::StageSync(StageSync {
            stage_seq,
            stage_id: STAGE,
            frame: 50,
        }),
        now,
    );
    assert!(!client.state().awaiting_stage_sync());
    assert!(client.state().awaiting_snapshot());
    assert_eq!(client.stats().snapshot_requests, 1);
    assert!(client.outbox.pending().iter().any(|out| matches!(
        out,
        Outgoing::ToHost(ClientMessage::SnapshotRequest {
            frame: Some(50),
            reason: SnapshotReason::Lag,
            ..
        })
    )));

    // The host answers once its own stage is loaded
    let now = h.now;
    h.host().stage_loaded(STAGE, now);
    h.client(2).flush();
    h.settle();
    let events = h.client(2).drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::SnapshotApplied { .. })));
    assert!(!h.client(2).state().awaiting_snapshot());
}

#[test]
fn test_old_input_answered_with_snapshot() {
    let mut config = NetplayConfig::default();
    config.limits.host_max_input_rollback = 10;
    let mut h = Harness::with_config(1, config, LinkProfile::default());
    h.start_stage();
    h.run_frames(60);

    let now = h.now;
    let host = h.host();
    let stage_seq = host.state().stage_seq();
    let current = host.session().frame();
    let sent = host.stats().snapshots_sent;

    host.handle_client_message(2, client_input(stage_seq, current - 15, 2, -110), now);
    assert_eq!(host.state.pending_host_rollback_frame, None);
    assert_eq!(host.stats().snapshots_sent, sent + 1);
    assert!(host.outbox.pending().iter().any(|out| matches!(
        out,
        Outgoing::ToClient(2, HostMessage::Snapshot(payload)) if payload.frame == current
    )));

    // Cooldown holds back a second push
    host.handle_client_message(2, client_input(stage_seq, current - 14, 2, -110), now);
    assert_eq!(host.stats().snapshots_sent, sent + 1);
}

#[test]
fn test_client_snapshot_request_cooldowns() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(10);

    let now = h.now;
    let client = h.client(2);
    let base = client.stats().snapshot_requests;
    assert!(client.request_snapshot(SnapshotReason::Lag, None, false, now));
    assert!(!client.request_snapshot(SnapshotReason::Lag, None, false, now));
    assert!(client.request_snapshot(SnapshotReason::Mismatch, Some(0), false, now));
    assert!(!client.request_snapshot(SnapshotReason::Mismatch, Some(0), false, now));
    assert!(client.request_snapshot(SnapshotReason::Lag, None, true, now));

    let later = now + Duration::from_millis(1001);
    assert!(client.request_snapshot(SnapshotReason::Lag, None, false, later));
    assert_eq!(client.stats().snapshot_requests, base + 4);
}

#[test]
fn test_host_clamps_and_throttles_snapshot_requests() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(60);

    let now = h.now;
    let host = h.host();
    let stage_seq = host.state().stage_seq();
    let current = host.session().frame();
    let max_rollback = host.config().sim.max_rollback;
    let sent = host.stats().snapshots_sent;
    let request = ClientMessage::SnapshotRequest {
        stage_seq,
        frame: Some(5),
        reason: SnapshotReason::Lag,
    };

    host.handle_client_message(2, request.clone(), now);
    host.handle_client_message(2, request, now);
    assert_eq!(host.stats().snapshots_sent, sent + 1);
    assert!(host.outbox.pending().iter().any(|out| matches!(
        out,
        Outgoing::ToClient(2, HostMessage::Snapshot(payload)) if payload.frame == current - max_rollback
    )));
}

#[test]
fn test_hash_mismatch_resyncs_client() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(40);

    let now = h.now;
    let host_frame = h.host().session().frame();
    let mut bundle = h.host().state.host_frame_buffer.get(host_frame).cloned().unwrap();
    let client = h.client(2);
    let local = client.state().local_hash(30).unwrap();
    bundle.hash = Some(HashStamp {
        frame: 30,
        hash: local ^ 1,
    });
    client.drain_events();
    client.handle_host_message(HostMessage::Frame(bundle), now);

    assert_eq!(client.stats().hash_mismatches, 1);
    let events = client.drain_events();
    assert!(has_event(&events, |e| matches!(
        e,
        NetplayEvent::Desync { frame: 30, local: l, remote: r } if *l == local && *r == local ^ 1
    )));
    assert!(client.outbox.pending().iter().any(|out| matches!(
        out,
        Outgoing::ToHost(ClientMessage::SnapshotRequest {
            frame: Some(30),
            reason: SnapshotReason::Mismatch,
            ..
        })
    )));

    h.client(2).flush();
    h.pump();
    let events = h.client(2).drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::SnapshotApplied { frame: 30 })));

    // Hash counters start over after the resync
    h.client(2).state.stats.hash_mismatches = 0;
    h.run_frames(60);
    h.assert_converged();
}

#[test]
fn test_host_pushes_snapshot_to_lagging_client() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(150);
    h.client(2).drain_events();

    let mut input = scripted_input(HOST);
    let behind_limit = h.config.timing.host_snapshot_behind_frames;
    let current = h.host().session().frame();
    assert!(current > behind_limit + 5);
    let sent = h.host().stats().snapshots_sent;
    {
        let client = h.host().state.client_state_mut(2);
        client.last_acked_host_frame = current - behind_limit - 5;
        client.last_snapshot_at = None;
    }

    h.advance(STEP);
    let now = h.now;
    let host = h.host();
    host.tick(STEP, now, ready(), &mut input);
    assert_eq!(host.stats().snapshots_sent, sent + 1);
    let client = host.state().client_state(2).unwrap();
    assert_eq!(client.last_snapshot_at, Some(now));
    assert!(client.last_acked_host_frame >= current);

    // Falling behind again inside the cooldown is not enough
    host.state.client_state_mut(2).last_acked_host_frame = current - behind_limit - 5;
    h.advance(STEP);
    let now = h.now;
    let host = h.host();
    host.tick(STEP, now, ready(), &mut input);
    assert_eq!(host.stats().snapshots_sent, sent + 1);

    h.pump();
    let events = h.client(2).drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::SnapshotApplied { .. })));
}

// ============================================================================
// Hash authority
// ============================================================================

#[test]
fn test_hash_stamp_waits_for_slowest_client() {
    let mut h = Harness::new(2);
    h.start_stage();
    h.run_frames(60);

    let mut input = scripted_input(HOST);
    let interval = h.config.sim.hash_interval;
    let start = h.host().session().frame();
    let held = start - 8;
    h.host().state.last_auth_hash_frame_sent = -1;

    // Player 2 keeps up while player 3's inputs stop at `held`
    for _ in 0..10 {
        h.advance(STEP);
        let now = h.now;
        let host = h.host();
        let next = host.session().frame() + 1;
        host.state.client_state_mut(2).last_acked_client_input = next;
        host.state.client_state_mut(3).last_acked_client_input = held;
        host.tick(STEP, now, ready(), &mut input);
    }
    let host = h.host();
    let end = host.session().frame();
    let stamps: Vec<Frame> = (start + 1..=end)
        .filter_map(|frame| host.state.host_frame_buffer.get(frame))
        .filter_map(|bundle| bundle.hash.as_ref().map(|stamp| stamp.frame))
        .collect();
    assert_eq!(stamps, vec![held - held % interval]);

    // Once player 3 catches up the stamp moves forward
    h.advance(STEP);
    let now = h.now;
    let host = h.host();
    let next = host.session().frame() + 1;
    host.state.client_state_mut(2).last_acked_client_input = next;
    host.state.client_state_mut(3).last_acked_client_input = next;
    host.tick(STEP, now, ready(), &mut input);
    let frame = host.session().frame();
    let stamp = host
        .state
        .host_frame_buffer
        .get(frame)
        .and_then(|bundle| bundle.hash.as_ref())
        .map(|stamp| stamp.frame)
        .unwrap();
    assert!(stamp > held && stamp <= next);
    assert_eq!(stamp % interval, 0);
}

// ============================================================================
// Pacing and liveness
// ============================================================================

#[test]
fn test_stalled_host_triggers_snapshot_request() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(30);

    let mut input = scripted_input(2);
    let requests = h.client(2).stats().snapshot_requests;
    let received = h.client(2).state().last_received_host_frame();

    // The host goes quiet
    h.advance(Duration::from_millis(3100));
    let now = h.now;
    let client = h.client(2);
    assert!(matches!(client.warning(now), Some(NetplayWarning::HostStale { .. })));
    client.tick(STEP, now, ready(), &mut input);
    assert_eq!(client.stats().snapshot_requests, requests + 1);
    assert!(client.state().awaiting_snapshot());
    assert_eq!(client.state().last_received_host_frame(), received);

    // Cooldown holds back a repeat
    h.advance(STEP);
    let now = h.now;
    let client = h.client(2);
    client.tick(STEP, now, ready(), &mut input);
    assert_eq!(client.stats().snapshot_requests, requests + 1);
}

#[test]
fn test_lag_fuse_requests_snapshot() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(20);

    let mut input = scripted_input(2);
    let now = h.now;
    let client = h.client(2);
    let requests = client.stats().snapshot_requests;
    let current = client.session().frame();
    client.state.last_received_host_frame = current + 200;
    client.state.last_host_frame_at = Some(now);

    // Behind, but not for long enough yet
    for _ in 0..29 {
        h.advance(STEP);
        let now = h.now;
        h.client(2).tick(STEP, now, ready(), &mut input);
    }
    let client = h.client(2);
    assert_eq!(client.stats().snapshot_requests, requests);
    assert!(client.state.lag_behind_since.is_some());

    for _ in 0..16 {
        h.advance(STEP);
        let now = h.now;
        h.client(2).tick(STEP, now, ready(), &mut input);
    }
    let client = h.client(2);
    assert_eq!(client.stats().snapshot_requests, requests + 1);
    assert!(client.state().awaiting_snapshot());
}

#[test]
fn test_client_idles_when_far_ahead() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(40);

    let mut input = scripted_input(2);
    let now = h.now;
    let client = h.client(2);
    let current = client.session().frame();
    let ticks = client.stats().ticks;
    client.state.last_received_host_frame = current - 40;
    client.state.last_host_frame_at = Some(now);

    h.advance(STEP);
    let now = h.now;
    let client = h.client(2);
    assert_eq!(client.tick(STEP, now, ready(), &mut input), 0);
    assert_eq!(client.session().frame(), current);
    assert_eq!(client.stats().ticks, ticks);
}

#[test]
fn test_client_catches_up_with_extra_ticks() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(40);

    let mut input = scripted_input(2);
    let max_ticks = h.config.pacing.gameplay.max_ticks;
    let now = h.now;
    let client = h.client(2);
    let current = client.session().frame();
    client.state.last_received_host_frame = current + 20;
    client.state.last_host_frame_at = Some(now);
    client.state.accumulator = 0.0;

    // Not even a step of wall time, yet far enough behind to force frames
    let ticks = client.tick(Duration::from_millis(1), now, ready(), &mut input);
    assert_eq!(ticks, 2);
    assert_eq!(client.session().frame(), current + 2);

    // A long frame is capped
    client.state.accumulator = 0.0;
    let ticks = client.tick(STEP * 4, now, ready(), &mut input);
    assert_eq!(ticks, max_ticks);
    assert_eq!(client.session().frame(), current + 2 + max_ticks as Frame);
}

// ============================================================================
// Convergence
// ============================================================================

#[test]
fn test_peers_converge_with_scripted_inputs() {
    let mut h = Harness::new(2);
    h.start_stage();
    h.run_frames(300);
    h.assert_converged();
    for peer in h.peers() {
        assert_eq!(peer.stats().snapshot_requests, 0);
        assert_eq!(peer.stats().snapshots_applied, 0);
    }
    // Host input changes force client rollbacks
    assert!(h.client(2).stats().rollback_count > 0);
}

#[test]
fn test_peers_converge_with_random_inputs_and_latency() {
    let link = LinkProfile {
        latency: Duration::from_millis(20),
        jitter: Duration::from_millis(5),
    };
    let mut h = Harness::with_config(2, NetplayConfig::default(), link);
    h.set_input(HOST, random_input(1));
    h.set_input(2, random_input(2));
    h.set_input(3, random_input(3));
    h.start_stage();
    h.run_frames(240);
    h.assert_converged();
    assert!(h.client(2).state().rtt().is_some());
}

#[test]
fn test_late_joiner_spawns_next_stage() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(30);

    let id = h.add_client();
    h.pump();
    let entry = h.host().roster().get(id).unwrap();
    assert!(entry.spectator && entry.pending_spawn);

    let late = h.client(id);
    let events = late.drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::LoadStage(start) if start.late_join)));
    assert!(late.pending_snapshot().is_some());

    let now = h.now;
    let host_frame = h.host().session().frame();
    let late = h.client(id);
    late.stage_loaded(STAGE, now);
    assert!(late.pending_snapshot().is_none());
    assert_eq!(late.session().frame(), host_frame);
    h.pump();

    let late = h.client(id);
    assert!(!late.state().awaiting_stage_sync());
    assert_eq!(late.warning(now), Some(NetplayWarning::LocalPendingSpawn));
    h.run_frames(30);
    h.assert_converged();

    // The next stage brings them into play everywhere
    h.start_stage();
    assert!(h.host().roster().is_active(id));
    assert!(h.client(2).roster().is_active(id));
    assert!(h.client(id).roster().is_active(id));
    h.run_frames(60);
    h.assert_converged();
}

// ============================================================================
// Lobby traffic
// ============================================================================

#[test]
fn test_chat_is_relayed_and_rate_limited() {
    let mut h = Harness::new(2);
    let now = h.now;
    h.client(2).send_chat("  hello   world ", now).unwrap();
    assert_eq!(
        h.client(2).send_chat("again", now),
        Err(NetplayError::ChatRateLimited)
    );
    assert_eq!(h.client(2).send_chat("   ", now), Err(NetplayError::EmptyChat));
    h.pump();

    let lines: Vec<_> = h.host().lobby().chat_log().cloned().collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].player, 2);
    for id in [2, 3] {
        let events = h.client(id).drain_events();
        assert!(has_event(&events, |e| matches!(
            e,
            NetplayEvent::Chat { player: 2, text } if *text == lines[0].text
        )));
    }
}

#[test]
fn test_profile_update_is_relayed() {
    let mut h = Harness::new(2);
    // Let the profile sent on connect cool down
    h.advance(Duration::from_secs(2));
    h.client(2).set_local_profile(&profile("Zed")).unwrap();
    h.pump();

    assert_eq!(h.host().lobby().profile(2).map(|p| p.name.as_str()), Some("Zed"));
    assert_eq!(h.client(3).lobby().profile(2).map(|p| p.name.as_str()), Some("Zed"));
    let events = h.client(3).drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::ProfileUpdated { player: 2 })));
}

#[test]
fn test_full_room_rejects_newcomer() {
    let mut config = NetplayConfig::default();
    config.lobby.max_players = 2;
    let mut h = Harness::with_config(2, config, LinkProfile::default());

    assert_eq!(h.host().roster().len(), 2);
    assert!(!h.host().roster().contains(3));
    let rejected = h.client(3);
    assert!(rejected.is_closed());
    let events = rejected.drain_events();
    assert!(has_event(&events, |e| matches!(
        e,
        NetplayEvent::Kicked { reason: Some(reason) } if reason == "Room is full"
    )));
    assert!(!h.client(2).is_closed());
}

#[test]
fn test_kick_closes_client() {
    let mut h = Harness::new(1);
    h.start_stage();
    let now = h.now;
    h.host().kick_player(2, "bye", now).unwrap();
    h.settle();

    let client = h.client(2);
    assert!(client.is_closed());
    let events = client.drain_events();
    assert!(has_event(&events, |e| matches!(
        e,
        NetplayEvent::Kicked { reason: Some(reason) } if reason == "bye"
    )));
    assert_eq!(client.send_chat("hi", now), Err(NetplayError::Closed));
    assert_eq!(client.signal_lost(), None);

    assert!(!h.host().roster().contains(2));
    let events = h.host().drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::PlayerLeft { player: 2 })));
}

#[test]
fn test_disconnect_updates_everyone() {
    let mut h = Harness::new(2);
    h.net.sever(HOST, 2);
    h.pump();

    let events = h.client(2).drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::HostDisconnected)));
    assert!(!h.host().roster().contains(2));
    assert!(h.host().lobby().profile(2).is_none());
    assert!(!h.client(3).roster().contains(2));
    let events = h.client(3).drain_events();
    assert!(has_event(&events, |e| matches!(e, NetplayEvent::PlayerLeft { player: 2 })));
}

#[test]
fn test_match_end_returns_to_lobby() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.host().end_match(Some("finished".to_string())).unwrap();
    h.pump();

    let client = h.client(2);
    assert!(client.state.current_start.is_none());
    let events = client.drain_events();
    assert!(has_event(&events, |e| matches!(
        e,
        NetplayEvent::MatchEnded { reason: Some(reason) } if reason == "finished"
    )));
}

// ============================================================================
// Signaling and diagnostics
// ============================================================================

#[test]
fn test_signal_lost_backs_off() {
    let mut h = Harness::new(1);
    let client = h.client(2);
    assert_eq!(client.signal_lost(), Some(Duration::from_secs(1)));
    assert_eq!(client.signal_lost(), Some(Duration::from_secs(2)));
    assert_eq!(client.signal_lost(), Some(Duration::from_secs(4)));
    client.signal_connected();
    assert_eq!(client.signal_lost(), Some(Duration::from_secs(1)));

    let events = client.drain_events();
    let scheduled = events
        .iter()
        .filter(|e| matches!(e, NetplayEvent::ReconnectScheduled { .. }))
        .count();
    assert_eq!(scheduled, 4);
}

#[test]
fn test_debug_lines_describe_peer() {
    let mut h = Harness::new(1);
    h.start_stage();
    h.run_frames(10);

    let now = h.now;
    let lines = h.client(2).debug_lines(now);
    assert_eq!(lines[0], "net client id=2");
    assert!(lines.iter().any(|line| line.starts_with("hostAge=")));

    let lines = h.host().debug_lines(now);
    assert_eq!(lines[0], "net host id=1");
    assert!(lines.iter().any(|line| line == "peers=1"));
    assert!(lines.iter().any(|line| line.starts_with("behind=2:")));
    assert_eq!(h.host().warning(now), None);
}

#[test]
fn test_into_parts_keeps_lobby_on_request() {
    let mut h = Harness::new(1);
    let now = h.now;
    h.host().send_chat("gg", now).unwrap();
    let host = h.host.netplay;
    let parts = host.into_parts(true);
    assert_eq!(parts.lobby.chat_log().count(), 1);
    assert!(parts.lobby.room().is_some());
    assert_eq!(parts.session.frame(), 0);
}
