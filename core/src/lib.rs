//! Rollnet Core - Host-authoritative rollback netcode
//!
//! This crate provides the networking core of a browser multiplayer
//! platformer: a host relays every player's input, clients predict ahead and
//! roll back, and full-state snapshots repair anything rollback cannot.
//!
//! # Architecture
//!
//! - [`Netplay`] - Per-connection facade driven by `poll` and `tick`
//! - [`SimulationSession`] - Contract for the deterministic, rewindable game
//! - [`RollbackSession`] - Stock session over any [`Simulation`]
//! - [`Transport`] - Ordered, reliable message channel to each peer
//! - [`NetplayConfig`] - Tunables, loadable from TOML

pub mod config;
pub mod input;
pub mod net;
pub mod netplay;
pub mod rollback;
#[cfg(test)]
pub mod test_utils;

// Re-export core types
pub use config::{ConfigError, NetplayConfig, RateBand};
pub use input::{FrameInputs, PlayerId, QuantizedInput};
pub use netplay::{
    LocalInput, Netplay, NetplayError, NetplayEvent, NetplayParts, NetplayStats, NetplayWarning,
    Role, TickContext,
};

// Re-export rollback types
pub use rollback::{
    Frame, FrameWindow, GameStateSnapshot, RollbackSession, Simulation, SimulationSession,
    SnapshotError, StateHash,
};

// Re-export transport types
pub use net::{
    ClientMessage, HostMessage, LinkProfile, LoopbackNetwork, LoopbackTransport, Transport,
    TransportError, TransportEvent,
};
