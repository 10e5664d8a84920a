//! Host -> Client messages

use bitcode::{Decode, Encode};

use crate::input::PlayerId;
use crate::rollback::{Frame, StateHash};

use super::shared::{PlayerInput, StageId, StageSeq};

/// Authoritative hash attached to a frame bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct HashStamp {
    pub frame: Frame,
    pub hash: StateHash,
}

/// Every player's input for one host frame
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FrameBundle {
    pub stage_seq: StageSeq,
    pub frame: Frame,
    /// Inputs ordered by player id
    pub inputs: Vec<PlayerInput>,
    /// Newest frame every active client has confirmed, with its hash
    pub hash: Option<HashStamp>,
    /// Newest input frame the host has received from the recipient
    pub last_ack: Option<Frame>,
}

/// Several buffered bundles resent to one client at once
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct FrameBatch {
    pub stage_seq: StageSeq,
    /// Newest input frame the host has received from the recipient
    pub last_ack: Frame,
    pub frames: Vec<FrameBundle>,
}

/// Full simulation state for resync
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct SnapshotPayload {
    pub stage_seq: StageSeq,
    pub frame: Frame,
    pub stage_id: Option<StageId>,
    /// Serialized simulation state
    pub state: Vec<u8>,
    /// xxHash3 checksum of `state`
    pub checksum: u64,
}

/// Host's go-ahead to start simulating a stage from `frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct StageSync {
    pub stage_seq: StageSeq,
    pub stage_id: StageId,
    pub frame: Frame,
}

/// Roster entry announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct PlayerJoin {
    pub player: PlayerId,
    /// Stage epoch the player joined during
    pub stage_seq: Option<StageSeq>,
    pub spectator: bool,
    pub pending_spawn: bool,
}
