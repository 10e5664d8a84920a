//! Lobby side channel
//!
//! Profiles, chat and room metadata ride the same channel as the simulation
//! traffic but never touch determinism. Everything a remote peer sends is
//! sanitized here before it is stored or relayed.

use std::collections::VecDeque;
use std::io::Cursor;
use std::time::{Duration, Instant};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hashbrown::HashMap;
use image::{ImageFormat, ImageReader};

use crate::config::LobbyConfig;
use crate::input::PlayerId;
use crate::net::messages::{MAX_CHAT_LEN, MAX_PROFILE_NAME_LEN, PlayerProfile, RoomInfo};

/// Chat lines kept in the scrollback
pub const CHAT_HISTORY_LEN: usize = 160;

/// Largest decoded avatar image
pub const MAX_AVATAR_BYTES: usize = 150 * 1024;

/// Largest avatar data URL
pub const MAX_AVATAR_DATA_URL_CHARS: usize = 220_000;

/// Largest avatar width or height in pixels
pub const MAX_AVATAR_DIMENSION: u32 = 512;

const FALLBACK_NAME: &str = "Player";

// ============================================================================
// Sanitizers
// ============================================================================

fn collapse_whitespace(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_space = false;
    for c in value.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
            }
            in_space = true;
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Clean a display name: ASCII letters, digits, space, `_`, `.` and `-` only,
/// whitespace collapsed, at most 64 characters. Falls back to `"Player"`.
pub fn sanitize_name(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .filter(|c| !c.is_ascii_control())
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '.' | '-'))
        .collect();
    let collapsed = collapse_whitespace(cleaned.trim());
    let name: String = collapsed.chars().take(MAX_PROFILE_NAME_LEN).collect();
    if name.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        name
    }
}

/// Clean a chat line. Returns `None` when nothing printable is left.
pub fn sanitize_chat(value: &str) -> Option<String> {
    let cleaned: String = value.chars().filter(|c| !c.is_ascii_control()).collect();
    let collapsed = collapse_whitespace(&cleaned);
    let text: String = collapsed.trim().chars().take(MAX_CHAT_LEN).collect();
    (!text.is_empty()).then_some(text)
}

fn avatar_format(mime: &str) -> Option<ImageFormat> {
    match mime {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
        "image/webp" => Some(ImageFormat::WebP),
        _ => None,
    }
}

/// Validate an avatar data URL (`data:image/<png|jpeg|jpg|webp>;base64,...`).
///
/// The payload must decode to an image of the declared type, at most
/// [`MAX_AVATAR_BYTES`] long and [`MAX_AVATAR_DIMENSION`] pixels on a side.
pub fn sanitize_avatar(value: &str) -> Option<String> {
    if value.is_empty() || value.len() > MAX_AVATAR_DATA_URL_CHARS {
        return None;
    }
    let (mime, payload) = value.strip_prefix("data:")?.split_once(";base64,")?;
    let declared = avatar_format(mime)?;
    let bytes = BASE64.decode(payload).ok()?;
    if bytes.is_empty() || bytes.len() > MAX_AVATAR_BYTES {
        return None;
    }
    let reader = ImageReader::new(Cursor::new(&bytes)).with_guessed_format().ok()?;
    if reader.format() != Some(declared) {
        tracing::debug!(mime, guessed = ?reader.format(), "Avatar type mismatch");
        return None;
    }
    let (width, height) = reader.into_dimensions().ok()?;
    let side = width.max(height);
    if width == 0 || height == 0 || side > MAX_AVATAR_DIMENSION {
        tracing::debug!(width, height, "Avatar dimensions rejected");
        return None;
    }
    Some(value.to_string())
}

/// Sanitize a whole profile. An invalid avatar is dropped, the name is kept.
pub fn sanitize_profile(profile: &PlayerProfile) -> PlayerProfile {
    PlayerProfile {
        name: sanitize_name(&profile.name),
        avatar_data: profile.avatar_data.as_deref().and_then(sanitize_avatar),
    }
}

/// Placeholder profile for a player we have not heard from yet
pub fn fallback_profile(player: PlayerId) -> PlayerProfile {
    let id = player.to_string();
    let suffix = &id[id.len().saturating_sub(4)..];
    PlayerProfile {
        name: format!("{FALLBACK_NAME} {suffix}"),
        avatar_data: None,
    }
}

// ============================================================================
// Lobby
// ============================================================================

/// A line of chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub player: PlayerId,
    pub text: String,
}

/// Lobby-facing state that outlives a single match
#[derive(Debug, Clone)]
pub struct Lobby {
    local_player: PlayerId,
    local_profile: PlayerProfile,
    room: Option<RoomInfo>,
    profiles: HashMap<PlayerId, PlayerProfile>,
    chat: VecDeque<ChatLine>,
    last_local_chat_at: Option<Instant>,
    remote_chat_at: HashMap<PlayerId, Instant>,
    remote_profile_at: HashMap<PlayerId, Instant>,
    chat_cooldown: Duration,
    profile_cooldown: Duration,
}

impl Lobby {
    pub fn new(local_player: PlayerId, local_profile: &PlayerProfile, config: &LobbyConfig) -> Self {
        let local_profile = sanitize_profile(local_profile);
        let mut profiles = HashMap::new();
        profiles.insert(local_player, local_profile.clone());
        Self {
            local_player,
            local_profile,
            room: None,
            profiles,
            chat: VecDeque::new(),
            last_local_chat_at: None,
            remote_chat_at: HashMap::new(),
            remote_profile_at: HashMap::new(),
            chat_cooldown: config.chat_send_cooldown(),
            profile_cooldown: config.profile_remote_cooldown(),
        }
    }

    pub fn local_player(&self) -> PlayerId {
        self.local_player
    }

    pub fn local_profile(&self) -> &PlayerProfile {
        &self.local_profile
    }

    /// Replace the local profile, returning the sanitized copy
    pub fn set_local_profile(&mut self, profile: &PlayerProfile) -> PlayerProfile {
        let profile = sanitize_profile(profile);
        self.local_profile = profile.clone();
        self.profiles.insert(self.local_player, profile.clone());
        profile
    }

    pub fn profile(&self, player: PlayerId) -> Option<&PlayerProfile> {
        self.profiles.get(&player)
    }

    /// Known profiles ordered by player id
    pub fn profiles(&self) -> Vec<(PlayerId, &PlayerProfile)> {
        let mut profiles: Vec<_> = self.profiles.iter().map(|(id, p)| (*id, p)).collect();
        profiles.sort_unstable_by_key(|(id, _)| *id);
        profiles
    }

    /// Store a remote profile, returning the sanitized copy
    pub fn set_profile(&mut self, player: PlayerId, profile: &PlayerProfile) -> PlayerProfile {
        if player == self.local_player {
            return self.set_local_profile(profile);
        }
        let profile = sanitize_profile(profile);
        self.profiles.insert(player, profile.clone());
        profile
    }

    /// Make sure `player` has at least a placeholder profile
    pub fn ensure_profile(&mut self, player: PlayerId) {
        self.profiles
            .entry(player)
            .or_insert_with(|| fallback_profile(player));
    }

    /// Forget everything about a departed player
    pub fn remove_player(&mut self, player: PlayerId) {
        if player == self.local_player {
            return;
        }
        self.profiles.remove(&player);
        self.remote_chat_at.remove(&player);
        self.remote_profile_at.remove(&player);
    }

    pub fn room(&self) -> Option<&RoomInfo> {
        self.room.as_ref()
    }

    pub fn set_room(&mut self, room: RoomInfo) {
        self.room = Some(room);
    }

    /// Chat scrollback, oldest first
    pub fn chat_log(&self) -> impl Iterator<Item = &ChatLine> {
        self.chat.iter()
    }

    /// Append a chat line, sanitizing it first. Returns the stored text.
    pub fn push_chat(&mut self, player: PlayerId, text: &str) -> Option<String> {
        let text = sanitize_chat(text)?;
        self.chat.push_back(ChatLine {
            player,
            text: text.clone(),
        });
        while self.chat.len() > CHAT_HISTORY_LEN {
            self.chat.pop_front();
        }
        Some(text)
    }

    /// Claim the local chat send slot. `false` while cooling down.
    pub fn try_local_chat(&mut self, now: Instant) -> bool {
        if !cooled_down(self.last_local_chat_at, now, self.chat_cooldown) {
            return false;
        }
        self.last_local_chat_at = Some(now);
        true
    }

    /// Claim a remote player's chat slot. `false` while cooling down.
    pub fn allow_remote_chat(&mut self, player: PlayerId, now: Instant) -> bool {
        if !cooled_down(self.remote_chat_at.get(&player).copied(), now, self.chat_cooldown) {
            return false;
        }
        self.remote_chat_at.insert(player, now);
        true
    }

    /// Claim a remote player's profile update slot. `false` while cooling
    /// down.
    pub fn allow_remote_profile(&mut self, player: PlayerId, now: Instant) -> bool {
        let last = self.remote_profile_at.get(&player).copied();
        if !cooled_down(last, now, self.profile_cooldown) {
            return false;
        }
        self.remote_profile_at.insert(player, now);
        true
    }

    /// Forget the room and everyone in it, keeping the local profile
    pub fn clear_room(&mut self) {
        self.room = None;
        self.profiles.clear();
        self.profiles
            .insert(self.local_player, self.local_profile.clone());
        self.chat.clear();
        self.remote_chat_at.clear();
        self.remote_profile_at.clear();
    }
}

/// Whether at least `cooldown` has passed since `last`
pub(super) fn cooled_down(last: Option<Instant>, now: Instant, cooldown: Duration) -> bool {
    last.is_none_or(|last| now.saturating_duration_since(last) >= cooldown)
}
