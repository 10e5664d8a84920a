//! Shared test utilities for unit and scenario tests

use crate::input::FrameInputs;
use crate::rollback::{Frame, Simulation, SnapshotError};

// ============================================================================
// Test Simulation
// ============================================================================

/// Deterministic toy simulation.
///
/// Each step folds the frame number and every player's input into a single
/// running value, so any difference in inputs shows up in the state hash.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterSim {
    pub value: u64,
    pub last_frame: Frame,
    /// Whether visual effects are currently suppressed
    pub suppressed: bool,
    /// Steps run while visuals were live
    pub visible_steps: u32,
}

impl Simulation for CounterSim {
    fn step(&mut self, frame: Frame, inputs: &FrameInputs) {
        let mut value = self.value.wrapping_mul(31).wrapping_add(frame as u64);
        for (player, input) in inputs.iter() {
            let packed = (u64::from(player) << 32)
                | (u64::from(input.x as u8) << 24)
                | (u64::from(input.y as u8) << 16)
                | u64::from(input.buttons as u16);
            value = value.rotate_left(7) ^ packed.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        }
        self.value = value;
        self.last_frame = frame;
        if !self.suppressed {
            self.visible_steps += 1;
        }
    }

    fn save_state(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(12);
        data.extend_from_slice(&self.value.to_le_bytes());
        data.extend_from_slice(&self.last_frame.to_le_bytes());
        data
    }

    fn load_state(&mut self, data: &[u8]) -> Result<(), SnapshotError> {
        let Ok(bytes) = <[u8; 12]>::try_from(data) else {
            return Err(SnapshotError::Invalid(format!(
                "expected 12 bytes, got {}",
                data.len()
            )));
        };
        let (value, frame) = bytes.split_at(8);
        self.value = u64::from_le_bytes(value.try_into().unwrap_or_default());
        self.last_frame = Frame::from_le_bytes(frame.try_into().unwrap_or_default());
        Ok(())
    }

    fn set_suppress_visuals(&mut self, suppress: bool) {
        self.suppressed = suppress;
    }
}
