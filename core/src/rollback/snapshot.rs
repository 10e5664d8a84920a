//! Game state snapshot for rollback and resync

use thiserror::Error;

use super::Frame;

/// Errors loading or validating a serialized state blob
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// Blob was empty
    #[error("snapshot is empty")]
    Empty,
    /// Checksum did not match the blob contents
    #[error("snapshot checksum mismatch: expected {expected:#018x}, got {got:#018x}")]
    ChecksumMismatch { expected: u64, got: u64 },
    /// The simulation rejected the blob
    #[error("invalid snapshot: {0}")]
    Invalid(String),
}

/// Snapshot of simulation state
///
/// Holds the opaque blob produced by the simulation, the frame it was taken
/// at, and an xxHash3 checksum used to reject corrupted resync payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameStateSnapshot {
    /// Serialized simulation state
    pub data: Vec<u8>,
    /// xxHash3 checksum of `data`
    pub checksum: u64,
    /// Frame number this snapshot was taken at (-1 when empty)
    pub frame: Frame,
}

impl GameStateSnapshot {
    /// Create a new empty snapshot
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            checksum: 0,
            frame: -1,
        }
    }

    /// Create a snapshot from serialized data
    pub fn from_data(data: Vec<u8>, frame: Frame) -> Self {
        let checksum = Self::compute_checksum(&data);
        Self {
            data,
            checksum,
            frame,
        }
    }

    /// Rebuild a snapshot received from a peer, verifying its checksum.
    pub fn from_wire(data: Vec<u8>, frame: Frame, checksum: u64) -> Result<Self, SnapshotError> {
        if data.is_empty() {
            return Err(SnapshotError::Empty);
        }
        let got = Self::compute_checksum(&data);
        if got != checksum {
            return Err(SnapshotError::ChecksumMismatch {
                expected: checksum,
                got,
            });
        }
        Ok(Self {
            data,
            checksum,
            frame,
        })
    }

    /// Check if this snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the serialized state in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Compute the xxHash3 checksum of a state blob
    pub fn compute_checksum(data: &[u8]) -> u64 {
        xxhash_rust::xxh3::xxh3_64(data)
    }
}

impl Default for GameStateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}
