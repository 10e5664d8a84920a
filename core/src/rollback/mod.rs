//! Rollback primitives
//!
//! Provides the frame-indexed window, the state snapshot and the simulation
//! session contract the netplay core drives.
//!
//! # Module Structure
//!
//! - `window`: `FrameWindow<T>` ring buffer keyed by `frame % capacity`
//! - `snapshot`: `GameStateSnapshot` blob with xxHash3 checksum
//! - `session`: `Simulation` / `SimulationSession` traits and `RollbackSession`

mod session;
mod snapshot;
mod window;

/// Simulation frame number. `-1` means "no frame".
pub type Frame = i32;

/// 32-bit state hash compared between peers
pub type StateHash = u32;

pub use session::{RollbackSession, Simulation, SimulationSession};
pub use snapshot::{GameStateSnapshot, SnapshotError};
pub use window::FrameWindow;
