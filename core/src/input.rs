//! Quantized player input
//!
//! Every input that crosses the wire or enters the simulation is quantized
//! first: stick axes become signed bytes and buttons a 32-bit bitfield. Exact
//! equality on the quantized form is what decides whether a late input forces
//! a rollback.

use bitcode::{Decode, Encode};
use smallvec::SmallVec;

/// Player identifier assigned by the lobby service.
pub type PlayerId = u16;

/// Largest magnitude a quantized axis may take (symmetric range).
pub const AXIS_LIMIT: i8 = 127;

/// One player's input for one frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Encode, Decode)]
pub struct QuantizedInput {
    /// Stick X in [-127, 127]
    pub x: i8,
    /// Stick Y in [-127, 127]
    pub y: i8,
    /// Button bitfield
    pub buttons: i32,
}

impl QuantizedInput {
    /// Neutral input used when a player has never sent anything.
    pub const NEUTRAL: Self = Self {
        x: 0,
        y: 0,
        buttons: 0,
    };

    /// Create an input, clamping the axes to the symmetric range.
    pub fn new(x: i8, y: i8, buttons: i32) -> Self {
        Self {
            x: x.max(-AXIS_LIMIT),
            y: y.max(-AXIS_LIMIT),
            buttons,
        }
    }

    /// Normalize loosely-typed values into a quantized input.
    ///
    /// Axes are rounded and clamped to [-127, 127]; non-finite axes become 0.
    /// Buttons are truncated to a 32-bit integer; non-finite buttons become 0.
    pub fn normalize(x: f64, y: f64, buttons: f64) -> Self {
        Self {
            x: clamp_axis(x),
            y: clamp_axis(y),
            buttons: if buttons.is_finite() {
                // Wrap like a 32-bit integer coercion rather than saturating
                (buttons.trunc() as i64) as i32
            } else {
                0
            },
        }
    }

    /// Re-clamp an input that arrived over the wire.
    ///
    /// The byte encoding admits -128, which is outside the symmetric range.
    pub fn clamped(self) -> Self {
        Self::new(self.x, self.y, self.buttons)
    }

    /// Quantize an analog stick position in [-1.0, 1.0].
    pub fn from_stick(x: f32, y: f32, buttons: i32) -> Self {
        Self {
            x: clamp_axis(f64::from(x) * f64::from(AXIS_LIMIT)),
            y: clamp_axis(f64::from(y) * f64::from(AXIS_LIMIT)),
            buttons,
        }
    }
}

fn clamp_axis(value: f64) -> i8 {
    if !value.is_finite() {
        return 0;
    }
    let limit = f64::from(AXIS_LIMIT);
    value.round().clamp(-limit, limit) as i8
}

/// Inputs of every player for a single frame, ordered by player id.
///
/// Ordering is part of determinism: every peer iterates players in the same
/// order when stepping the simulation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameInputs {
    entries: SmallVec<[(PlayerId, QuantizedInput); 8]>,
}

impl FrameInputs {
    /// Create an empty row
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a player's input
    pub fn get(&self, player: PlayerId) -> Option<QuantizedInput> {
        self.entries
            .binary_search_by_key(&player, |(id, _)| *id)
            .ok()
            .map(|idx| self.entries[idx].1)
    }

    /// Whether the player has an entry
    pub fn contains(&self, player: PlayerId) -> bool {
        self.get(player).is_some()
    }

    /// Insert or replace a player's input, returning the previous value.
    pub fn insert(&mut self, player: PlayerId, input: QuantizedInput) -> Option<QuantizedInput> {
        match self.entries.binary_search_by_key(&player, |(id, _)| *id) {
            Ok(idx) => Some(std::mem::replace(&mut self.entries[idx].1, input)),
            Err(idx) => {
                self.entries.insert(idx, (player, input));
                None
            }
        }
    }

    /// Remove a player's entry
    pub fn remove(&mut self, player: PlayerId) -> Option<QuantizedInput> {
        let idx = self
            .entries
            .binary_search_by_key(&player, |(id, _)| *id)
            .ok()?;
        Some(self.entries.remove(idx).1)
    }

    /// Iterate entries in player order
    pub fn iter(&self) -> impl Iterator<Item = (PlayerId, QuantizedInput)> + '_ {
        self.entries.iter().copied()
    }

    /// Number of players with an entry
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the row is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(PlayerId, QuantizedInput)> for FrameInputs {
    fn from_iter<T: IntoIterator<Item = (PlayerId, QuantizedInput)>>(iter: T) -> Self {
        let mut inputs = Self::new();
        for (player, input) in iter {
            inputs.insert(player, input);
        }
        inputs
    }
}
