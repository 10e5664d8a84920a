//! Rollnet Soak - Long-running convergence check over a simulated link
//!
//! Runs a host and several clients in one process over the loopback
//! transport, each driving random held inputs into a small marble
//! simulation, then checks that every peer agrees on the final settled
//! state hash.
//!
//! # Usage
//!
//! ```bash
//! # Three clients, 60 ms one-way latency, 20 ms jitter, one minute of play
//! rollnet-soak --clients 3 --latency-ms 60 --jitter-ms 20 --frames 3600
//!
//! # Use tuned netplay settings
//! rollnet-soak --config netplay.toml
//! ```

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::Parser;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use tracing::info;

use rollnet_core::net::messages::{PlayerProfile, RoomInfo, StartMatch};
use rollnet_core::{
    Frame, FrameInputs, LinkProfile, LoopbackNetwork, LoopbackTransport, Netplay, NetplayConfig,
    PlayerId, QuantizedInput, RollbackSession, Simulation, SimulationSession, SnapshotError,
    TickContext,
};

const HOST: PlayerId = 1;
const STAGE_ID: u32 = 1;

/// Rollnet Soak - host and clients over a simulated link
#[derive(Parser)]
#[command(name = "rollnet-soak")]
#[command(about = "Check that rollback peers converge over a simulated link")]
#[command(version)]
struct Args {
    /// Number of clients besides the host
    #[arg(short, long, default_value_t = 3)]
    clients: u16,

    /// Frames to simulate
    #[arg(short, long, default_value_t = 3600)]
    frames: u32,

    /// One-way link latency in milliseconds
    #[arg(long, default_value_t = 40)]
    latency_ms: u64,

    /// Maximum extra random delay per message in milliseconds
    #[arg(long, default_value_t = 10)]
    jitter_ms: u64,

    /// Seed for inputs and link jitter
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Netplay settings file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,
}

// ============================================================================
// Simulation
// ============================================================================

/// Marbles rolling on a flat plane, in 16.16 fixed point
#[derive(Default)]
struct MarbleSim {
    marbles: Vec<Marble>,
}

#[derive(Clone, Copy)]
struct Marble {
    player: PlayerId,
    pos: [i32; 2],
    vel: [i32; 2],
}

impl MarbleSim {
    fn marble_mut(&mut self, player: PlayerId) -> &mut Marble {
        let index = match self.marbles.binary_search_by_key(&player, |m| m.player) {
            Ok(index) => index,
            Err(index) => {
                self.marbles.insert(
                    index,
                    Marble {
                        player,
                        pos: [i32::from(player) << 16, 0],
                        vel: [0, 0],
                    },
                );
                index
            }
        };
        &mut self.marbles[index]
    }
}

impl Simulation for MarbleSim {
    fn step(&mut self, _frame: Frame, inputs: &FrameInputs) {
        for (player, input) in inputs.iter() {
            let marble = self.marble_mut(player);
            let boost = if input.buttons & 1 != 0 { 2 } else { 1 };
            marble.vel[0] += i32::from(input.x) * 64 * boost;
            marble.vel[1] += i32::from(input.y) * 64 * boost;
            for axis in 0..2 {
                // Rolling friction
                marble.vel[axis] -= marble.vel[axis] >> 5;
                marble.pos[axis] = marble.pos[axis].wrapping_add(marble.vel[axis]);
            }
        }
    }

    fn save_state(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.marbles.len() * 18);
        for marble in &self.marbles {
            data.extend_from_slice(&marble.player.to_le_bytes());
            for value in marble.pos.iter().chain(&marble.vel) {
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        data
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        if data.len() % 18 != 0 {
            return Err(SnapshotError::Invalid(format!(
                "marble state length {} is not a multiple of 18",
                data.len()
            )));
        }
        self.marbles = data
            .chunks_exact(18)
            .map(|chunk| {
                let word = |at: usize| {
                    i32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]])
                };
                Marble {
                    player: PlayerId::from_le_bytes([chunk[0], chunk[1]]),
                    pos: [word(2), word(6)],
                    vel: [word(10), word(14)],
                }
            })
            .collect();
        Ok(())
    }
}

// ============================================================================
// Peers
// ============================================================================

type SoakNetplay = Netplay<RollbackSession<MarbleSim>, LoopbackTransport>;

struct Peer {
    netplay: SoakNetplay,
    rng: Pcg32,
    held: QuantizedInput,
}

impl Peer {
    fn new(netplay: SoakNetplay, seed: u64) -> Self {
        Self {
            netplay,
            rng: Pcg32::seed_from_u64(seed),
            held: QuantizedInput::NEUTRAL,
        }
    }

    fn tick(&mut self, dt: Duration, now: Instant) -> u32 {
        let ctx = TickContext {
            stage_ready: true,
            ..TickContext::default()
        };
        let rng = &mut self.rng;
        let held = &mut self.held;
        let mut input = |_frame: Frame| {
            if rng.random_bool(0.1) {
                *held = QuantizedInput::new(
                    rng.random_range(-127..=127),
                    rng.random_range(-127..=127),
                    rng.random_range(0..4),
                );
            }
            *held
        };
        self.netplay.tick(dt, now, ctx, &mut input)
    }
}

fn profile(name: String) -> PlayerProfile {
    PlayerProfile {
        name,
        avatar_data: None,
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => NetplayConfig::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => NetplayConfig::default(),
    };

    let mut now = Instant::now();
    let link = LinkProfile {
        latency: Duration::from_millis(args.latency_ms),
        jitter: Duration::from_millis(args.jitter_ms),
    };
    let net = LoopbackNetwork::new(link, args.seed, now);

    let room = RoomInfo {
        room_id: "soak".to_string(),
        course_id: "soak".to_string(),
        ..RoomInfo::default()
    };
    let mut peers = vec![Peer::new(
        Netplay::host(
            config.clone(),
            RollbackSession::new(MarbleSim::default(), config.sim.max_rollback),
            net.endpoint(HOST),
            HOST,
            room,
            &profile("host".to_string()),
        ),
        args.seed,
    )];
    for index in 0..args.clients {
        let id = HOST + 1 + index;
        peers.push(Peer::new(
            Netplay::client(
                config.clone(),
                RollbackSession::new(MarbleSim::default(), config.sim.max_rollback),
                net.endpoint(id),
                id,
                HOST,
                &profile(format!("client {id}")),
            ),
            args.seed.wrapping_add(u64::from(id)),
        ));
        net.connect(HOST, id);
    }

    let step = config.sim.step();
    let advance = |now: &mut Instant, peers: &mut [Peer], dt: Duration| {
        *now += dt;
        net.set_now(*now);
        for peer in peers.iter_mut() {
            peer.netplay.poll(*now);
        }
    };

    // Lobby settles, then the host starts the stage
    for _ in 0..30 {
        advance(&mut now, &mut peers, step);
    }
    peers[0].netplay.start_stage(StartMatch {
        game_source: "soak".to_string(),
        game_mode: "race".to_string(),
        course: "soak/1".to_string(),
        stage_id: STAGE_ID,
        ..StartMatch::default()
    })?;
    peers[0].netplay.stage_loaded(STAGE_ID, now);
    for _ in 0..30 {
        advance(&mut now, &mut peers, step);
    }
    for peer in peers.iter_mut().skip(1) {
        peer.netplay.stage_loaded(STAGE_ID, now);
    }

    let started = Instant::now();
    let mut ticks = 0u64;
    for _ in 0..args.frames {
        advance(&mut now, &mut peers, step);
        for peer in peers.iter_mut() {
            ticks += u64::from(peer.tick(step, now));
        }
    }
    // Drain in-flight traffic so clients catch up to the host
    for _ in 0..60 {
        advance(&mut now, &mut peers, step);
        for peer in peers.iter_mut() {
            peer.tick(step, now);
        }
    }
    info!("Simulated {} ticks in {:?}", ticks, started.elapsed());

    let host = &peers[0].netplay;
    let interval = config.sim.hash_interval;
    let settled = host.session().frame() - config.sim.max_rollback / 2;
    let check_frame = settled / interval * interval;
    let Some(expected) = host.state().local_hash(check_frame) else {
        bail!("Host never reached frame {check_frame}");
    };

    println!(
        "{:<8} {:>7} {:>9} {:>10} {:>9} {:>9} {:>10}",
        "player", "frame", "rollbacks", "rb frames", "snapshots", "mismatch", "hash"
    );
    let mut diverged = 0;
    for peer in &peers {
        let state = peer.netplay.state();
        let stats = peer.netplay.stats();
        let hash = state.local_hash(check_frame);
        let marker = if hash == Some(expected) {
            "ok"
        } else {
            diverged += 1;
            "DIVERGED"
        };
        println!(
            "{:<8} {:>7} {:>9} {:>10} {:>9} {:>9} {:>10} {}",
            state.local_player(),
            peer.netplay.session().frame(),
            stats.rollback_count,
            stats.rollback_frames,
            stats.snapshots_applied + stats.snapshots_sent,
            stats.hash_mismatches,
            hash.map_or_else(|| "-".to_string(), |h| format!("{h:08x}")),
            marker,
        );
    }
    println!(
        "Network: {} messages, {} bytes",
        net.messages_sent(),
        net.bytes_sent()
    );

    if diverged > 0 {
        bail!("{diverged} peer(s) diverged at frame {check_frame}");
    }
    println!("All peers agree at frame {check_frame}");
    Ok(())
}
