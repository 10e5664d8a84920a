//! Types shared by host and client messages

use bitcode::{Decode, Encode};

use crate::input::{PlayerId, QuantizedInput};

/// Stage epoch identifier. Fences every stage-scoped message.
pub type StageSeq = u32;

/// Identifier of a loaded stage
pub type StageId = u32;

/// Maximum profile name length in characters
pub const MAX_PROFILE_NAME_LEN: usize = 64;

/// Maximum chat line length in characters
pub const MAX_CHAT_LEN: usize = 200;

/// One player's input inside a frame bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct PlayerInput {
    pub player: PlayerId,
    pub input: QuantizedInput,
}

/// Player display profile
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PlayerProfile {
    /// Display name (sanitized, up to 64 characters)
    pub name: String,
    /// Optional avatar image as a base64 data URL
    pub avatar_data: Option<String>,
}

impl Default for PlayerProfile {
    fn default() -> Self {
        Self {
            name: "Player".to_string(),
            avatar_data: None,
        }
    }
}

/// Room settings controlled by the host
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RoomSettings {
    /// Room capacity
    pub max_players: u8,
    /// Whether marbles collide with each other
    pub collision_enabled: bool,
    /// Whether new players may join
    pub locked: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_players: 8,
            collision_enabled: true,
            locked: false,
        }
    }
}

/// Room metadata as advertised by the lobby
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct RoomInfo {
    pub room_id: String,
    pub room_code: Option<String>,
    pub is_public: bool,
    pub host_id: PlayerId,
    pub course_id: String,
    pub settings: RoomSettings,
    pub player_count: Option<u8>,
}

/// Everything a client needs to load the stage the host is starting
#[derive(Debug, Clone, PartialEq, Eq, Default, Encode, Decode)]
pub struct StartMatch {
    /// Content pack the course comes from
    pub game_source: String,
    /// Multiplayer game mode name
    pub game_mode: String,
    /// Opaque, mode-specific options
    pub game_mode_options: Option<String>,
    /// Opaque course descriptor
    pub course: String,
    /// Asset root override for the stage
    pub stage_base_path: Option<String>,
    /// Stage id the course resolves to
    pub stage_id: StageId,
    /// Set when sent to a player joining mid-stage
    pub late_join: bool,
}

/// Why a client asked for a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Encode, Decode)]
pub enum SnapshotReason {
    /// A host hash disagreed with the local one
    Mismatch,
    /// The client fell too far behind or stalled
    Lag,
}
