//! Netplay tuning configuration (netplay.toml)
//!
//! Every knob the rollback core consults lives here. Values are grouped into
//! sections the same way they are tuned in practice: simulation window, client
//! pacing, protocol timers, host-side input limits, lobby throttles and
//! signaling reconnect backoff.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Errors from reading or writing a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Netplay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NetplayConfig {
    /// Simulation window settings
    #[serde(default)]
    pub sim: SimConfig,
    /// Client pacing and drift correction
    #[serde(default)]
    pub pacing: PacingConfig,
    /// Handshake, snapshot and stall timers
    #[serde(default)]
    pub timing: TimingConfig,
    /// Host-side validation of client inputs
    #[serde(default)]
    pub limits: InputLimits,
    /// Lobby side channel throttles
    #[serde(default)]
    pub lobby: LobbyConfig,
    /// Signaling reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Fixed-step simulation and rollback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    /// Simulation ticks per second (default: 60)
    #[serde(default = "default_tick_rate")]
    pub tick_rate: u32,
    /// Maximum frames that can be rolled back (default: 30)
    #[serde(default = "default_max_rollback")]
    pub max_rollback: i32,
    /// Frames resent per peer on every pass (default: 8)
    #[serde(default = "default_max_resend")]
    pub max_resend: i32,
    /// Frames between state hashes (default: 15)
    #[serde(default = "default_hash_interval")]
    pub hash_interval: i32,
    /// Maximum buffered time in steps (default: 5)
    #[serde(default = "default_max_frame_delta")]
    pub max_frame_delta: u32,
}

/// Rate clamp and tick limits for one pacing regime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateBand {
    /// Lowest playback rate
    pub rate_min: f64,
    /// Highest playback rate
    pub rate_max: f64,
    /// Rate change per frame of drift
    pub drift_rate: f64,
    /// Drift above which at least one tick is forced
    pub force_tick: f64,
    /// Drift above which extra ticks are allowed
    pub extra_ticks: f64,
    /// Upper bound on ticks per call once extra ticks kick in
    pub max_ticks: u32,
}

impl RateBand {
    /// Regular gameplay band
    pub const GAMEPLAY: Self = Self {
        rate_min: 0.9,
        rate_max: 1.1,
        drift_rate: 0.05,
        force_tick: 3.0,
        extra_ticks: 6.0,
        max_ticks: 3,
    };

    /// Steeper band used while the stage intro is still playing
    pub const INTRO: Self = Self {
        rate_min: 0.85,
        rate_max: 1.35,
        drift_rate: 0.1,
        force_tick: 1.0,
        extra_ticks: 2.0,
        max_ticks: 6,
    };

    /// Playback rate for the given drift, linear and clamped.
    pub fn rate_for_drift(&self, drift: f64) -> f64 {
        (1.0 + drift * self.drift_rate).clamp(self.rate_min, self.rate_max)
    }
}

/// Client look-ahead and pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacingConfig {
    /// Base client lead in frames (default: 2)
    #[serde(default = "default_client_lead")]
    pub client_lead: i32,
    /// Cap on the RTT-derived lead (default: 12)
    #[serde(default = "default_client_max_extra_lead")]
    pub client_max_extra_lead: i32,
    /// Frames a client may run ahead of target before idling (default: 2)
    #[serde(default = "default_client_ahead_slack")]
    pub client_ahead_slack: f64,
    /// Rate band during gameplay
    #[serde(default = "default_gameplay_band")]
    pub gameplay: RateBand,
    /// Rate band during the stage intro
    #[serde(default = "default_intro_band")]
    pub intro: RateBand,
}

/// Protocol timers. All durations in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Client stage_ready resend interval (default: 2000)
    #[serde(default = "default_stage_ready_resend_ms")]
    pub stage_ready_resend_ms: u64,
    /// Host deadline before forcing stage_sync (default: 12000)
    #[serde(default = "default_stage_ready_timeout_ms")]
    pub stage_ready_timeout_ms: u64,
    /// Drift in frames that arms the lag fuse (default: 24)
    #[serde(default = "default_lag_fuse_frames")]
    pub lag_fuse_frames: f64,
    /// How long drift must stay armed before the fuse blows (default: 500)
    #[serde(default = "default_lag_fuse_ms")]
    pub lag_fuse_ms: u64,
    /// General snapshot request cooldown (default: 1000)
    #[serde(default = "default_snapshot_cooldown_ms")]
    pub snapshot_cooldown_ms: u64,
    /// Mismatch-driven snapshot request cooldown (default: 250)
    #[serde(default = "default_snapshot_mismatch_cooldown_ms")]
    pub snapshot_mismatch_cooldown_ms: u64,
    /// Client ping interval (default: 1000)
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    /// Host silence before a client declares a stall (default: 3000)
    #[serde(default = "default_host_stall_ms")]
    pub host_stall_ms: u64,
    /// Client ack lag that makes the host push a snapshot (default: 120)
    #[serde(default = "default_host_snapshot_behind_frames")]
    pub host_snapshot_behind_frames: i32,
    /// Per-client cooldown on host-pushed snapshots (default: 1500)
    #[serde(default = "default_host_snapshot_cooldown_ms")]
    pub host_snapshot_cooldown_ms: u64,
}

/// Host-side bounds on accepted client input frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputLimits {
    /// Frames ahead of the host a client input may be (default: 60)
    #[serde(default = "default_max_input_ahead")]
    pub max_input_ahead: i32,
    /// Frames behind the host a client input may be (default: 60)
    #[serde(default = "default_max_input_behind")]
    pub max_input_behind: i32,
    /// Deepest rollback the host performs for a late input (default: 16)
    #[serde(default = "default_host_max_input_rollback")]
    pub host_max_input_rollback: i32,
}

/// Lobby side channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LobbyConfig {
    /// Room capacity (default: 8)
    #[serde(default = "default_max_players")]
    pub max_players: usize,
    /// Minimum time between chat lines per player (default: 800)
    #[serde(default = "default_chat_send_cooldown_ms")]
    pub chat_send_cooldown_ms: u64,
    /// Minimum time between remote profile updates per player (default: 1500)
    #[serde(default = "default_profile_remote_cooldown_ms")]
    pub profile_remote_cooldown_ms: u64,
    /// Delay between a kick and the transport disconnect (default: 80)
    #[serde(default = "default_kick_disconnect_delay_ms")]
    pub kick_disconnect_delay_ms: u64,
}

/// Signaling reconnect backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First retry delay (default: 1000)
    #[serde(default = "default_signal_retry_initial_ms")]
    pub initial_ms: u64,
    /// Retry delay cap (default: 15000)
    #[serde(default = "default_signal_retry_max_ms")]
    pub max_ms: u64,
}

fn default_tick_rate() -> u32 {
    60
}
fn default_max_rollback() -> i32 {
    30
}
fn default_max_resend() -> i32 {
    8
}
fn default_hash_interval() -> i32 {
    15
}
fn default_max_frame_delta() -> u32 {
    5
}

fn default_client_lead() -> i32 {
    2
}
fn default_client_max_extra_lead() -> i32 {
    12
}
fn default_client_ahead_slack() -> f64 {
    2.0
}
fn default_gameplay_band() -> RateBand {
    RateBand::GAMEPLAY
}
fn default_intro_band() -> RateBand {
    RateBand::INTRO
}

fn default_stage_ready_resend_ms() -> u64 {
    2000
}
fn default_stage_ready_timeout_ms() -> u64 {
    12000
}
fn default_lag_fuse_frames() -> f64 {
    24.0
}
fn default_lag_fuse_ms() -> u64 {
    500
}
fn default_snapshot_cooldown_ms() -> u64 {
    1000
}
fn default_snapshot_mismatch_cooldown_ms() -> u64 {
    250
}
fn default_ping_interval_ms() -> u64 {
    1000
}
fn default_host_stall_ms() -> u64 {
    3000
}
fn default_host_snapshot_behind_frames() -> i32 {
    120
}
fn default_host_snapshot_cooldown_ms() -> u64 {
    1500
}

fn default_max_input_ahead() -> i32 {
    60
}
fn default_max_input_behind() -> i32 {
    60
}
fn default_host_max_input_rollback() -> i32 {
    16
}

fn default_max_players() -> usize {
    8
}
fn default_chat_send_cooldown_ms() -> u64 {
    800
}
fn default_profile_remote_cooldown_ms() -> u64 {
    1500
}
fn default_kick_disconnect_delay_ms() -> u64 {
    80
}

fn default_signal_retry_initial_ms() -> u64 {
    1000
}
fn default_signal_retry_max_ms() -> u64 {
    15000
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_rate: default_tick_rate(),
            max_rollback: default_max_rollback(),
            max_resend: default_max_resend(),
            hash_interval: default_hash_interval(),
            max_frame_delta: default_max_frame_delta(),
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            client_lead: default_client_lead(),
            client_max_extra_lead: default_client_max_extra_lead(),
            client_ahead_slack: default_client_ahead_slack(),
            gameplay: RateBand::GAMEPLAY,
            intro: RateBand::INTRO,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            stage_ready_resend_ms: default_stage_ready_resend_ms(),
            stage_ready_timeout_ms: default_stage_ready_timeout_ms(),
            lag_fuse_frames: default_lag_fuse_frames(),
            lag_fuse_ms: default_lag_fuse_ms(),
            snapshot_cooldown_ms: default_snapshot_cooldown_ms(),
            snapshot_mismatch_cooldown_ms: default_snapshot_mismatch_cooldown_ms(),
            ping_interval_ms: default_ping_interval_ms(),
            host_stall_ms: default_host_stall_ms(),
            host_snapshot_behind_frames: default_host_snapshot_behind_frames(),
            host_snapshot_cooldown_ms: default_host_snapshot_cooldown_ms(),
        }
    }
}

impl Default for InputLimits {
    fn default() -> Self {
        Self {
            max_input_ahead: default_max_input_ahead(),
            max_input_behind: default_max_input_behind(),
            host_max_input_rollback: default_host_max_input_rollback(),
        }
    }
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            max_players: default_max_players(),
            chat_send_cooldown_ms: default_chat_send_cooldown_ms(),
            profile_remote_cooldown_ms: default_profile_remote_cooldown_ms(),
            kick_disconnect_delay_ms: default_kick_disconnect_delay_ms(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_signal_retry_initial_ms(),
            max_ms: default_signal_retry_max_ms(),
        }
    }
}

impl SimConfig {
    /// Duration of one simulation step
    pub fn step(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.tick_rate.max(1)))
    }

    /// Step length in milliseconds
    pub fn step_ms(&self) -> f64 {
        1000.0 / f64::from(self.tick_rate.max(1))
    }
}

impl TimingConfig {
    pub fn stage_ready_resend(&self) -> Duration {
        Duration::from_millis(self.stage_ready_resend_ms)
    }
    pub fn stage_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_ready_timeout_ms)
    }
    pub fn lag_fuse(&self) -> Duration {
        Duration::from_millis(self.lag_fuse_ms)
    }
    pub fn snapshot_cooldown(&self) -> Duration {
        Duration::from_millis(self.snapshot_cooldown_ms)
    }
    pub fn snapshot_mismatch_cooldown(&self) -> Duration {
        Duration::from_millis(self.snapshot_mismatch_cooldown_ms)
    }
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
    pub fn host_stall(&self) -> Duration {
        Duration::from_millis(self.host_stall_ms)
    }
    pub fn host_snapshot_cooldown(&self) -> Duration {
        Duration::from_millis(self.host_snapshot_cooldown_ms)
    }
}

impl LobbyConfig {
    pub fn chat_send_cooldown(&self) -> Duration {
        Duration::from_millis(self.chat_send_cooldown_ms)
    }
    pub fn profile_remote_cooldown(&self) -> Duration {
        Duration::from_millis(self.profile_remote_cooldown_ms)
    }
    pub fn kick_disconnect_delay(&self) -> Duration {
        Duration::from_millis(self.kick_disconnect_delay_ms)
    }
}

impl NetplayConfig {
    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        Ok(config.validate())
    }

    /// Load from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Save to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Clamp nonsensical values into a usable configuration.
    pub fn validate(mut self) -> Self {
        self.sim.tick_rate = self.sim.tick_rate.max(1);
        self.sim.max_rollback = self.sim.max_rollback.max(1);
        self.sim.max_resend = self.sim.max_resend.max(1);
        self.sim.hash_interval = self.sim.hash_interval.max(1);
        self.sim.max_frame_delta = self.sim.max_frame_delta.max(1);
        self.pacing.client_lead = self.pacing.client_lead.max(0);
        self.pacing.client_max_extra_lead = self.pacing.client_max_extra_lead.max(0);
        for band in [&mut self.pacing.gameplay, &mut self.pacing.intro] {
            if band.rate_min > band.rate_max {
                std::mem::swap(&mut band.rate_min, &mut band.rate_max);
            }
            band.rate_min = band.rate_min.max(0.0);
            band.max_ticks = band.max_ticks.max(1);
        }
        self.limits.host_max_input_rollback = self
            .limits
            .host_max_input_rollback
            .clamp(0, self.sim.max_rollback);
        self.lobby.max_players = self.lobby.max_players.max(1);
        if self.reconnect.initial_ms > self.reconnect.max_ms {
            self.reconnect.max_ms = self.reconnect.initial_ms;
        }
        self
    }

    /// Capacity the per-frame windows need to cover every frame the core can
    /// still reference: the rollback window plus the look-ahead a client input
    /// may arrive with, plus the resend window.
    pub fn window_capacity(&self) -> usize {
        let frames = self.sim.max_rollback
            + self.limits.max_input_ahead.max(0)
            + self.sim.max_resend
            + 2;
        frames.max(1) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =============================================================
    // Default value tests
    // =============================================================

    #[test]
    fn test_config_default() {
        let config = NetplayConfig::default();
        assert_eq!(config.sim.tick_rate, 60);
        assert_eq!(config.sim.max_rollback, 30);
        assert_eq!(config.sim.max_resend, 8);
        assert_eq!(config.sim.hash_interval, 15);
        assert_eq!(config.pacing.client_lead, 2);
        assert_eq!(config.timing.snapshot_cooldown_ms, 1000);
        assert_eq!(config.timing.snapshot_mismatch_cooldown_ms, 250);
        assert_eq!(config.limits.host_max_input_rollback, 16);
        assert_eq!(config.lobby.kick_disconnect_delay_ms, 80);
        assert_eq!(config.reconnect.max_ms, 15000);
    }

    #[test]
    fn test_step_duration() {
        let sim = SimConfig::default();
        assert!((sim.step_ms() - 16.666_666).abs() < 0.001);
        assert_eq!(sim.step(), Duration::from_secs_f64(1.0 / 60.0));
    }

    #[test]
    fn test_rate_band_clamps() {
        let band = RateBand::GAMEPLAY;
        assert!((band.rate_for_drift(0.0) - 1.0).abs() < f64::EPSILON);
        assert!((band.rate_for_drift(1.0) - 1.05).abs() < 1e-9);
        assert!((band.rate_for_drift(100.0) - 1.1).abs() < f64::EPSILON);
        assert!((band.rate_for_drift(-100.0) - 0.9).abs() < f64::EPSILON);
    }

    // =============================================================
    // TOML serialization tests
    // =============================================================

    #[test]
    fn test_config_deserialize_empty() {
        let config = NetplayConfig::from_toml_str("").unwrap();
        assert_eq!(config, NetplayConfig::default());
    }

    #[test]
    fn test_config_deserialize_partial() {
        let toml_str = r#"
[sim]
max_rollback = 12

[timing]
stage_ready_timeout_ms = 5000
"#;
        let config = NetplayConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.sim.max_rollback, 12);
        assert_eq!(config.sim.hash_interval, 15);
        assert_eq!(config.timing.stage_ready_timeout_ms, 5000);
        assert_eq!(config.timing.stage_ready_resend_ms, 2000);
        assert_eq!(config.pacing.intro, RateBand::INTRO);
    }

    #[test]
    fn test_config_invalid_toml() {
        assert!(matches!(
            NetplayConfig::from_toml_str("[sim\nmax_rollback = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("netplay.toml");

        let mut config = NetplayConfig::default();
        config.sim.hash_interval = 10;
        config.lobby.max_players = 4;
        config.save(&path).unwrap();

        let loaded = NetplayConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = NetplayConfig::load(&dir.path().join("missing.toml"));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    // =============================================================
    // Validation tests
    // =============================================================

    #[test]
    fn test_validate_clamps_zero_values() {
        let mut config = NetplayConfig::default();
        config.sim.tick_rate = 0;
        config.sim.hash_interval = 0;
        config.lobby.max_players = 0;
        let config = config.validate();
        assert_eq!(config.sim.tick_rate, 1);
        assert_eq!(config.sim.hash_interval, 1);
        assert_eq!(config.lobby.max_players, 1);
    }

    #[test]
    fn test_validate_swaps_inverted_band() {
        let mut config = NetplayConfig::default();
        config.pacing.gameplay.rate_min = 1.5;
        config.pacing.gameplay.rate_max = 0.5;
        let config = config.validate();
        assert!((config.pacing.gameplay.rate_min - 0.5).abs() < f64::EPSILON);
        assert!((config.pacing.gameplay.rate_max - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_validate_caps_host_rollback_to_window() {
        let mut config = NetplayConfig::default();
        config.sim.max_rollback = 8;
        config.limits.host_max_input_rollback = 20;
        assert_eq!(config.validate().limits.host_max_input_rollback, 8);
    }

    #[test]
    fn test_window_capacity_covers_rollback_and_lookahead() {
        let config = NetplayConfig::default();
        assert!(config.window_capacity() > (config.sim.max_rollback + config.limits.max_input_ahead) as usize);
    }
}
