//! Netplay events, warnings and counters

use std::fmt;
use std::time::Duration;

use crate::input::PlayerId;
use crate::net::messages::{RoomInfo, StageId, StartMatch};
use crate::rollback::{Frame, StateHash};

/// Application-facing outcome of netplay processing.
///
/// Drained with `Netplay::drain_events()` after `poll` or `tick`.
#[derive(Debug, Clone, PartialEq)]
pub enum NetplayEvent {
    /// Load the stage described by `StartMatch`, then call `stage_loaded`
    LoadStage(StartMatch),
    /// Host released the stage; simulation resumes from `frame`
    StageSynced { stage_id: StageId, frame: Frame },
    /// A full-state snapshot was installed
    SnapshotApplied { frame: Frame },
    /// Host hash disagreed with the local hash for `frame`
    Desync {
        frame: Frame,
        local: StateHash,
        remote: StateHash,
    },
    /// Player added to the roster
    PlayerJoined { player: PlayerId, spectator: bool },
    /// Player removed from the roster
    PlayerLeft { player: PlayerId },
    /// A player's profile changed
    ProfileUpdated { player: PlayerId },
    /// Chat line to display
    Chat { player: PlayerId, text: String },
    /// Room metadata changed
    RoomUpdated(RoomInfo),
    /// Host ended the match
    MatchEnded { reason: Option<String> },
    /// Host removed us from the room. The session is closed.
    Kicked { reason: Option<String> },
    /// Channel to the host closed
    HostDisconnected,
    /// Retry the signaling connection after `delay`
    ReconnectScheduled { delay: Duration },
}

/// Transient network condition worth showing to the player
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetplayWarning {
    /// No host frame for longer than the stall threshold
    HostStale { age: Duration },
    /// Waiting for the host to release the stage
    AwaitingStageSync,
    /// Local player is watching
    LocalSpectator,
    /// Local player spawns at the next stage
    LocalPendingSpawn,
}

impl fmt::Display for NetplayWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HostStale { age } => {
                write!(f, "NET: host frames stale {:.1}s", age.as_secs_f64())
            }
            Self::AwaitingStageSync => f.write_str("NET: awaiting stage sync"),
            Self::LocalSpectator => f.write_str("NET: local spectator"),
            Self::LocalPendingSpawn => f.write_str("NET: local pending spawn"),
        }
    }
}

/// Rollback and resync counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetplayStats {
    /// Rollbacks performed
    pub rollback_count: u64,
    /// Frames resimulated by rollbacks
    pub rollback_frames: u64,
    /// Wall time spent in rollbacks
    pub rollback_time: Duration,
    /// Snapshot resimulations performed
    pub resim_count: u64,
    /// Frames resimulated after snapshots
    pub resim_frames: u64,
    /// Wall time spent resimulating after snapshots
    pub resim_time: Duration,
    /// Rollbacks the session refused
    pub rollback_refused: u64,
    /// Snapshots installed locally
    pub snapshots_applied: u64,
    /// Snapshots sent to clients
    pub snapshots_sent: u64,
    /// Snapshot requests sent to the host
    pub snapshot_requests: u64,
    /// Hash mismatches observed
    pub hash_mismatches: u64,
    /// Simulation steps run by the tick driver
    pub ticks: u64,
}
