//! Simulation session
//!
//! `SimulationSession` is the contract the netplay core drives: a
//! deterministic fixed-step stepper that can rewind to a saved frame, silence
//! its visual side effects during resimulation, hash its state and exchange
//! full-state blobs. `RollbackSession` is the stock implementation that wraps
//! any `Simulation` and keeps a window of saved states.

use crate::input::FrameInputs;

use super::snapshot::{GameStateSnapshot, SnapshotError};
use super::window::FrameWindow;
use super::{Frame, StateHash};

/// Deterministic game simulation.
///
/// Stepping with identical inputs from identical state must produce identical
/// state on every peer.
pub trait Simulation {
    /// Advance one fixed step using every player's input for `frame`.
    fn step(&mut self, frame: Frame, inputs: &FrameInputs);

    /// Serialize the complete simulation state.
    fn save_state(&self) -> Vec<u8>;

    /// Replace the simulation state with a blob from `save_state`.
    fn load_state(&mut self, data: &[u8]) -> Result<(), SnapshotError>;

    /// Hash of the current state.
    ///
    /// Defaults to the low 32 bits of an xxHash3 over the serialized state.
    fn state_hash(&self) -> StateHash {
        xxhash_rust::xxh3::xxh3_64(&self.save_state()) as StateHash
    }

    /// Called when resimulation starts or stops.
    ///
    /// While suppressed the simulation should skip effects meant for the
    /// player (sounds, particles, camera cuts).
    fn set_suppress_visuals(&mut self, _suppress: bool) {}
}

/// Rollback-capable session driven by the netplay core.
pub trait SimulationSession {
    /// Most recently simulated frame
    fn frame(&self) -> Frame;

    /// Simulate `frame` with the given inputs and make it current.
    fn advance_to(&mut self, frame: Frame, inputs: &FrameInputs);

    /// Restore the state saved at `frame`. Returns `false` when that frame is
    /// no longer (or never was) in the saved window.
    fn rollback_to(&mut self, frame: Frame) -> bool;

    /// Declare the current state to be `frame` and save it.
    fn prime(&mut self, frame: Frame);

    /// Toggle visual suppression for silent resimulation
    fn set_suppress_visuals(&mut self, suppress: bool);

    /// Whether visuals are currently suppressed
    fn suppress_visuals(&self) -> bool;

    /// Hash of the current state
    fn state_hash(&self) -> StateHash;

    /// Serialized state for `frame`: the saved copy, or the live state when
    /// `frame` is current.
    fn snapshot_at(&self, frame: Frame) -> Option<GameStateSnapshot>;

    /// Install a full-state blob taken at `frame` and restart the saved
    /// window there.
    fn load_snapshot(&mut self, snapshot: &GameStateSnapshot) -> Result<(), SnapshotError>;
}

/// Stock `SimulationSession` over a `Simulation`.
///
/// A state is saved after every advance and on prime; rollback loads the
/// saved state and rewinds the frame counter. States older than
/// `max_rollback` frames behind the newest are dropped.
pub struct RollbackSession<G: Simulation> {
    game: G,
    frame: Frame,
    states: FrameWindow<GameStateSnapshot>,
    max_rollback: i32,
    suppress_visuals: bool,
}

impl<G: Simulation> RollbackSession<G> {
    /// Wrap a simulation. The session starts primed at frame 0.
    pub fn new(game: G, max_rollback: i32) -> Self {
        let max_rollback = max_rollback.max(1);
        let mut session = Self {
            game,
            frame: 0,
            states: FrameWindow::new(max_rollback as usize + 1),
            max_rollback,
            suppress_visuals: false,
        };
        session.prime(0);
        session
    }

    /// The wrapped simulation
    pub fn game(&self) -> &G {
        &self.game
    }

    /// Mutable access to the wrapped simulation
    pub fn game_mut(&mut self) -> &mut G {
        &mut self.game
    }

    /// Oldest frame that can still be rolled back to
    pub fn oldest_saved_frame(&self) -> Option<Frame> {
        self.states.min_frame()
    }

    fn save_current(&mut self) {
        let snapshot = GameStateSnapshot::from_data(self.game.save_state(), self.frame);
        self.states.insert(self.frame, snapshot);
        self.states.trim_before(self.frame - self.max_rollback);
    }
}

impl<G: Simulation> SimulationSession for RollbackSession<G> {
    fn frame(&self) -> Frame {
        self.frame
    }

    fn advance_to(&mut self, frame: Frame, inputs: &FrameInputs) {
        self.game.step(frame, inputs);
        self.frame = frame;
        self.save_current();
    }

    fn rollback_to(&mut self, frame: Frame) -> bool {
        let Some(snapshot) = self.states.get(frame) else {
            return false;
        };
        if let Err(e) = self.game.load_state(&snapshot.data) {
            tracing::warn!(frame, error = %e, "Saved state failed to load");
            return false;
        }
        self.frame = frame;
        true
    }

    fn prime(&mut self, frame: Frame) {
        self.frame = frame;
        // Saved frames past the new head belong to a discarded timeline
        self.states.remove_after(frame);
        self.save_current();
    }

    fn set_suppress_visuals(&mut self, suppress: bool) {
        self.suppress_visuals = suppress;
        self.game.set_suppress_visuals(suppress);
    }

    fn suppress_visuals(&self) -> bool {
        self.suppress_visuals
    }

    fn state_hash(&self) -> StateHash {
        self.game.state_hash()
    }

    fn snapshot_at(&self, frame: Frame) -> Option<GameStateSnapshot> {
        if frame == self.frame {
            return Some(GameStateSnapshot::from_data(self.game.save_state(), frame));
        }
        self.states.get(frame).cloned()
    }

    fn load_snapshot(&mut self, snapshot: &GameStateSnapshot) -> Result<(), SnapshotError> {
        if snapshot.is_empty() {
            return Err(SnapshotError::Empty);
        }
        self.game.load_state(&snapshot.data)?;
        self.states.clear();
        self.prime(snapshot.frame);
        Ok(())
    }
}
