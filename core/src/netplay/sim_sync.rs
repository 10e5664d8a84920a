//! Input ledger and resimulation
//!
//! Inputs are recorded per frame and player. A player with no input for a
//! frame is assumed to hold their last known input. When a late input changes
//! a frame that was already simulated, the session is rewound and replayed
//! with visuals suppressed.

use std::time::Instant;

use crate::input::{FrameInputs, PlayerId, QuantizedInput};
use crate::net::messages::{FrameBundle, HashStamp, PlayerInput};
use crate::rollback::{Frame, GameStateSnapshot, SimulationSession, SnapshotError};

use super::roster::Roster;
use super::state::NetplaySessionState;

impl<S: SimulationSession> NetplaySessionState<S> {
    /// Record `input` for `player` at `frame`.
    ///
    /// Returns `true` when the stored value changed. Replaying the same input
    /// is a no-op.
    pub fn record_input(&mut self, frame: Frame, player: PlayerId, input: QuantizedInput) -> bool {
        let Some(row) = self.input_history.get_or_insert_with(frame, FrameInputs::new) else {
            tracing::trace!(frame, player, "Input outside history window");
            return false;
        };
        if row.get(player) == Some(input) {
            return false;
        }
        row.insert(player, input);
        self.last_inputs.insert(player, input);
        true
    }

    /// Inputs for every roster player at `frame`, holding the last known
    /// input for anyone without an entry.
    pub fn build_inputs(&mut self, frame: Frame, roster: &Roster) -> FrameInputs {
        let last_inputs = &self.last_inputs;
        let fill = |row: &mut FrameInputs| {
            for player in roster.ids() {
                if !row.contains(player) {
                    let held = last_inputs.get(&player).copied().unwrap_or_default();
                    row.insert(player, held);
                }
            }
        };
        match self.input_history.get_or_insert_with(frame, FrameInputs::new) {
            Some(row) => {
                fill(row);
                row.clone()
            }
            None => {
                let mut row = FrameInputs::new();
                fill(&mut row);
                row
            }
        }
    }

    /// Drop history older than the rollback window behind `frame`.
    pub fn trim_history(&mut self, frame: Frame) {
        let min_frame = frame - self.max_rollback;
        self.input_history.trim_before(min_frame);
        self.hash_history.trim_before(min_frame);
        self.expected_hashes.trim_before(min_frame);
    }

    /// Outbound bundle for `frame`
    pub(super) fn frame_bundle(
        &self,
        frame: Frame,
        inputs: &FrameInputs,
        hash: Option<HashStamp>,
    ) -> FrameBundle {
        FrameBundle {
            stage_seq: self.stage_seq,
            frame,
            inputs: inputs
                .iter()
                .map(|(player, input)| PlayerInput { player, input })
                .collect(),
            hash,
            last_ack: None,
        }
    }

    /// Rewind to `start_frame - 1` and replay up to the current frame.
    ///
    /// Hashes on hash frames are recomputed and, on the host, the outbound
    /// buffer is rewritten for every replayed frame. Returns `false` when the
    /// session refuses the rollback.
    pub fn rollback_and_resim(&mut self, start_frame: Frame, roster: &Roster) -> bool {
        let started = Instant::now();
        let current = self.session.frame();
        let rollback_frame = (start_frame - 1).max(0);
        if !self.session.rollback_to(rollback_frame) {
            self.stats.rollback_refused += 1;
            tracing::debug!(start_frame, current, "Rollback refused");
            return false;
        }

        let prev_suppress = self.session.suppress_visuals();
        self.session.set_suppress_visuals(true);
        for frame in rollback_frame + 1..=current {
            let inputs = self.build_inputs(frame, roster);
            self.session.advance_to(frame, &inputs);
            if self.is_hash_frame(frame) {
                let hash = self.session.state_hash();
                self.hash_history.insert(frame, hash);
            }
            if self.is_host() {
                let bundle = self.frame_bundle(frame, &inputs, None);
                self.host_frame_buffer.insert(frame, bundle);
            }
            self.trim_history(frame);
        }
        self.session.set_suppress_visuals(prev_suppress);

        let frames = current - rollback_frame;
        self.stats.rollback_count += 1;
        self.stats.rollback_frames += frames.max(0) as u64;
        self.stats.rollback_time += started.elapsed();
        tracing::debug!(start_frame, frames, "Rolled back");
        true
    }

    fn resim_from_snapshot(&mut self, snapshot_frame: Frame, target_frame: Frame, roster: &Roster) {
        if target_frame <= snapshot_frame {
            return;
        }
        let started = Instant::now();
        let prev_suppress = self.session.suppress_visuals();
        self.session.set_suppress_visuals(true);
        for frame in snapshot_frame + 1..=target_frame {
            let inputs = self.build_inputs(frame, roster);
            self.session.advance_to(frame, &inputs);
            if self.is_hash_frame(frame) {
                let hash = self.session.state_hash();
                self.hash_history.insert(frame, hash);
            }
            self.trim_history(frame);
        }
        self.session.set_suppress_visuals(prev_suppress);

        self.stats.resim_count += 1;
        self.stats.resim_frames += (target_frame - snapshot_frame) as u64;
        self.stats.resim_time += started.elapsed();
    }

    /// Install a full-state snapshot and replay forward to the frame the
    /// session was at before, so the simulation does not jump backwards.
    pub fn install_snapshot(
        &mut self,
        snapshot: &GameStateSnapshot,
        roster: &Roster,
    ) -> Result<(), SnapshotError> {
        let target_frame = self.session.frame();
        let snapshot_frame = snapshot.frame;
        self.session.load_snapshot(snapshot)?;

        self.last_received_host_frame = self.last_received_host_frame.max(snapshot_frame);
        self.awaiting_snapshot = false;
        self.hash_history.clear();
        self.expected_hashes.remove_through(snapshot_frame);
        self.resim_from_snapshot(snapshot_frame, target_frame, roster);
        self.lag_behind_since = None;
        self.stats.snapshots_applied += 1;
        tracing::debug!(snapshot_frame, target_frame, "Snapshot installed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetplayConfig;
    use crate::netplay::state::Role;
    use crate::rollback::RollbackSession;
    use crate::test_utils::CounterSim;

    type TestState = NetplaySessionState<RollbackSession<CounterSim>>;

    fn state(role: Role) -> TestState {
        let config = NetplayConfig::default();
        let session = RollbackSession::new(CounterSim::default(), config.sim.max_rollback);
        NetplaySessionState::new(role, 1, session, &config)
    }

    fn roster() -> Roster {
        let mut roster = Roster::new();
        roster.add(1, false);
        roster.add(2, false);
        roster
    }

    fn input(x: i8) -> QuantizedInput {
        QuantizedInput::new(x, 0, 0)
    }

    fn step(state: &mut TestState, roster: &Roster, local: QuantizedInput) {
        let frame = state.session.frame() + 1;
        state.record_input(frame, 1, local);
        let inputs = state.build_inputs(frame, roster);
        state.session.advance_to(frame, &inputs);
        if state.is_hash_frame(frame) {
            let hash = state.session.state_hash();
            state.hash_history.insert(frame, hash);
        }
        if state.is_host() {
            let bundle = state.frame_bundle(frame, &inputs, None);
            state.host_frame_buffer.insert(frame, bundle);
        }
        state.trim_history(frame);
    }

    // ========================================================================
    // Input ledger
    // ========================================================================

    #[test]
    fn test_record_input_idempotent() {
        let mut state = state(Role::Host);
        assert!(state.record_input(5, 2, input(10)));
        assert!(!state.record_input(5, 2, input(10)));
        assert!(state.record_input(5, 2, input(11)));
        assert_eq!(state.last_inputs.get(&2), Some(&input(11)));
    }

    #[test]
    fn test_build_inputs_holds_last_input() {
        let mut state = state(Role::Host);
        let roster = roster();
        state.record_input(3, 2, input(40));
        let inputs = state.build_inputs(4, &roster);
        assert_eq!(inputs.get(2), Some(input(40)));
        assert_eq!(inputs.get(1), Some(QuantizedInput::NEUTRAL));
        assert_eq!(inputs.len(), 2);
    }

    #[test]
    fn test_trim_history_drops_old_frames() {
        let mut state = state(Role::Host);
        for frame in 0..40 {
            state.record_input(frame, 2, input(frame as i8));
        }
        state.hash_history.insert(0, 1);
        state.trim_history(40);
        assert!(state.input_history.min_frame() >= Some(40 - state.max_rollback));
        assert!(state.local_hash(0).is_none());
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    #[test]
    fn test_rollback_matches_known_inputs() {
        let roster = roster();
        let mut late = state(Role::Host);
        let mut informed = state(Role::Host);

        for frame in 1..=10 {
            if frame >= 5 {
                informed.record_input(frame, 2, input(30));
            }
            step(&mut late, &roster, input(1));
            step(&mut informed, &roster, input(1));
        }
        assert_ne!(late.session.state_hash(), informed.session.state_hash());

        // Player 2's inputs for 5..=10 arrive after the fact
        for frame in 5..=10 {
            assert!(late.record_input(frame, 2, input(30)));
        }
        assert!(late.rollback_and_resim(5, &roster));
        assert_eq!(late.session.frame(), 10);
        assert_eq!(late.session.state_hash(), informed.session.state_hash());
        assert!(!late.session.suppress_visuals());
        assert_eq!(late.stats.rollback_count, 1);
        assert_eq!(late.stats.rollback_frames, 6);
    }

    #[test]
    fn test_rollback_rewrites_host_buffer() {
        let roster = roster();
        let mut host = state(Role::Host);
        for _ in 0..6 {
            step(&mut host, &roster, input(0));
        }
        host.record_input(4, 2, input(9));
        assert!(host.rollback_and_resim(4, &roster));
        let bundle = host.host_frame_buffer.get(4).unwrap();
        assert!(bundle.inputs.contains(&PlayerInput {
            player: 2,
            input: input(9)
        }));
        assert!(bundle.hash.is_none());
    }

    #[test]
    fn test_rollback_refused_outside_window() {
        let roster = roster();
        let mut host = state(Role::Host);
        for _ in 0..60 {
            step(&mut host, &roster, input(0));
        }
        assert!(!host.rollback_and_resim(5, &roster));
        assert_eq!(host.stats.rollback_refused, 1);
        assert_eq!(host.session.frame(), 60);
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    #[test]
    fn test_install_snapshot_resims_to_previous_frame() {
        let roster = roster();
        let mut host = state(Role::Host);
        let mut client = state(Role::Client);
        for _ in 0..20 {
            step(&mut host, &roster, input(3));
        }
        for _ in 0..25 {
            step(&mut client, &roster, input(-5));
        }
        let snapshot = host.session.snapshot_at(20).unwrap();
        client.expected_hashes.insert(15, 7);
        client.expected_hashes.insert(24, 8);

        client.install_snapshot(&snapshot, &roster).unwrap();
        assert_eq!(client.session.frame(), 25);
        assert_eq!(client.last_received_host_frame, 20);
        assert!(client.expected_hashes.get(15).is_none());
        assert_eq!(client.expected_hashes.get(24), Some(&8));
        assert_eq!(client.stats.resim_frames, 5);
    }

    #[test]
    fn test_install_empty_snapshot_fails() {
        let roster = roster();
        let mut client = state(Role::Client);
        let result = client.install_snapshot(&GameStateSnapshot::new(), &roster);
        assert!(result.is_err());
        assert_eq!(client.stats.snapshots_applied, 0);
    }
}
