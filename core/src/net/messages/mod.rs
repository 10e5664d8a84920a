//! Netplay wire messages
//!
//! Host and client speak two separate sum types. Messages are serialized with
//! bitcode and wrapped in a small framing header so a peer running a different
//! protocol revision is rejected up front instead of misdecoding.
//!
//! # Wire Format
//!
//! ```text
//! [RNET][version:u16][length:u32][bitcode payload...]
//! ```

use bitcode::{Decode, DecodeOwned, Encode};
use thiserror::Error;

use crate::input::PlayerId;
use crate::rollback::Frame;

mod client;
mod host;
mod shared;


pub use client::{InputBatch, InputEntry, InputFrame};
pub use host::{FrameBatch, FrameBundle, HashStamp, PlayerJoin, SnapshotPayload, StageSync};
pub use shared::{
    MAX_CHAT_LEN, MAX_PROFILE_NAME_LEN, PlayerInput, PlayerProfile, RoomInfo, RoomSettings,
    SnapshotReason, StageId, StageSeq, StartMatch,
};

/// Protocol magic bytes
pub const RNET_MAGIC: [u8; 4] = *b"RNET";

/// Current protocol version
pub const RNET_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + length (4)
pub const RNET_HEADER_SIZE: usize = 10;

// ============================================================================
// Host -> Client
// ============================================================================

/// Messages the host sends to clients
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum HostMessage {
    /// Inputs for one simulated frame
    Frame(FrameBundle),
    /// Resent frames for one client
    FrameBatch(FrameBatch),
    /// Reply to a client ping
    Pong { id: u32 },
    /// Stage handshake complete
    StageSync(StageSync),
    /// Full-state resync
    Snapshot(SnapshotPayload),
    /// Load a new stage under a new epoch
    Start {
        stage_seq: StageSeq,
        start: StartMatch,
    },
    /// Player added to the roster
    PlayerJoin(PlayerJoin),
    /// Player removed from the roster
    PlayerLeave { player: PlayerId },
    /// Room metadata changed
    RoomUpdate(RoomInfo),
    /// A player's profile changed
    PlayerProfile {
        player: PlayerId,
        profile: PlayerProfile,
    },
    /// Chat line relayed by the host
    Chat { player: PlayerId, text: String },
    /// Removal from the room
    Kick { reason: Option<String> },
    /// Match is over, return to the lobby
    MatchEnd { reason: Option<String> },
}

impl HostMessage {
    /// Stage epoch the message is scoped to, if any
    pub fn stage_seq(&self) -> Option<StageSeq> {
        match self {
            Self::Frame(bundle) => Some(bundle.stage_seq),
            Self::FrameBatch(batch) => Some(batch.stage_seq),
            Self::StageSync(sync) => Some(sync.stage_seq),
            Self::Snapshot(snapshot) => Some(snapshot.stage_seq),
            Self::Start { stage_seq, .. } => Some(*stage_seq),
            Self::PlayerJoin(join) => join.stage_seq,
            Self::Pong { .. }
            | Self::PlayerLeave { .. }
            | Self::RoomUpdate(_)
            | Self::PlayerProfile { .. }
            | Self::Chat { .. }
            | Self::Kick { .. }
            | Self::MatchEnd { .. } => None,
        }
    }

    /// Whether a stale `stage_seq` still lets the message through.
    ///
    /// `start` carries the new epoch itself and roster changes are not tied
    /// to a stage.
    pub fn bypasses_fence(&self) -> bool {
        matches!(
            self,
            Self::Start { .. } | Self::PlayerJoin(_) | Self::PlayerLeave { .. } | Self::Pong { .. }
        )
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Frame(_) => "frame",
            Self::FrameBatch(_) => "frame_batch",
            Self::Pong { .. } => "pong",
            Self::StageSync(_) => "stage_sync",
            Self::Snapshot(_) => "snapshot",
            Self::Start { .. } => "start",
            Self::PlayerJoin(_) => "player_join",
            Self::PlayerLeave { .. } => "player_leave",
            Self::RoomUpdate(_) => "room_update",
            Self::PlayerProfile { .. } => "player_profile",
            Self::Chat { .. } => "chat",
            Self::Kick { .. } => "kick",
            Self::MatchEnd { .. } => "match_end",
        }
    }

    /// Serialize with framing
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_framed(self)
    }

    /// Deserialize from framed bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_framed(bytes)
    }
}

// ============================================================================
// Client -> Host
// ============================================================================

/// Messages a client sends to the host
///
/// The sender's player id comes from the connection, not the payload, except
/// for `Input` where it is echoed for validation.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum ClientMessage {
    /// Local input for one frame
    Input(InputFrame),
    /// All unacknowledged local inputs
    InputBatch(InputBatch),
    /// Acknowledge host frames when there is no input to piggyback on
    Ack { stage_seq: StageSeq, frame: Frame },
    /// Round-trip ping
    Ping { id: u32 },
    /// Client finished loading the stage
    StageReady {
        stage_seq: StageSeq,
        stage_id: StageId,
    },
    /// Ask the host for a full-state resync
    SnapshotRequest {
        stage_seq: StageSeq,
        frame: Option<Frame>,
        reason: SnapshotReason,
    },
    /// Local profile changed
    PlayerProfile { profile: PlayerProfile },
    /// Chat line
    Chat { text: String },
}

impl ClientMessage {
    /// Stage epoch the message is scoped to, if any
    pub fn stage_seq(&self) -> Option<StageSeq> {
        match self {
            Self::Input(input) => Some(input.stage_seq),
            Self::InputBatch(batch) => Some(batch.stage_seq),
            Self::Ack { stage_seq, .. }
            | Self::StageReady { stage_seq, .. }
            | Self::SnapshotRequest { stage_seq, .. } => Some(*stage_seq),
            Self::Ping { .. } | Self::PlayerProfile { .. } | Self::Chat { .. } => None,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input(_) => "input",
            Self::InputBatch(_) => "input_batch",
            Self::Ack { .. } => "ack",
            Self::Ping { .. } => "ping",
            Self::StageReady { .. } => "stage_ready",
            Self::SnapshotRequest { .. } => "snapshot_request",
            Self::PlayerProfile { .. } => "player_profile",
            Self::Chat { .. } => "chat",
        }
    }

    /// Serialize with framing
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_framed(self)
    }

    /// Deserialize from framed bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_framed(bytes)
    }
}

// ============================================================================
// Serialization
// ============================================================================

fn encode_framed<T: Encode>(message: &T) -> Vec<u8> {
    let payload = bitcode::encode(message);
    let mut bytes = Vec::with_capacity(RNET_HEADER_SIZE + payload.len());

    bytes.extend_from_slice(&RNET_MAGIC);
    bytes.extend_from_slice(&RNET_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&payload);

    bytes
}

fn decode_framed<T: DecodeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    if bytes.len() < RNET_HEADER_SIZE {
        return Err(DecodeError::TooShort);
    }

    if bytes[0..4] != RNET_MAGIC {
        return Err(DecodeError::InvalidMagic);
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != RNET_VERSION {
        return Err(DecodeError::VersionMismatch {
            expected: RNET_VERSION,
            got: version,
        });
    }

    let length = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    if bytes.len() < RNET_HEADER_SIZE + length {
        return Err(DecodeError::IncompletePayload {
            expected: length,
            got: bytes.len() - RNET_HEADER_SIZE,
        });
    }

    let payload = &bytes[RNET_HEADER_SIZE..RNET_HEADER_SIZE + length];
    bitcode::decode(payload).map_err(|e| DecodeError::DecodeFailed(e.to_string()))
}

/// Errors that can occur when decoding a framed message
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Message too short for header
    #[error("message too short for RNET header")]
    TooShort,
    /// Invalid magic bytes
    #[error("invalid RNET magic bytes")]
    InvalidMagic,
    /// Protocol version mismatch
    #[error("RNET version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u16, got: u16 },
    /// Payload incomplete
    #[error("incomplete payload: expected {expected} bytes, got {got}")]
    IncompletePayload { expected: usize, got: usize },
    /// Bitcode decode failed
    #[error("failed to decode message: {0}")]
    DecodeFailed(String),
}
