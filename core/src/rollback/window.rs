//! Frame-indexed sliding window
//!
//! Input history, hash history, expected hashes, saved states and the host's
//! outbound frame buffer are all sliding windows over frame numbers. Each slot
//! is addressed by `frame % capacity` and tagged with the frame it holds, so a
//! stale slot is never mistaken for a live one.

use super::Frame;

/// Fixed-capacity ring buffer keyed by frame number.
#[derive(Debug, Clone)]
pub struct FrameWindow<T> {
    slots: Vec<Option<(Frame, T)>>,
}

impl<T> FrameWindow<T> {
    /// Create a window holding `capacity` consecutive frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots }
    }

    /// Number of frames the window can hold at once
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn index(&self, frame: Frame) -> Option<usize> {
        if frame < 0 {
            return None;
        }
        Some(frame as usize % self.slots.len())
    }

    /// Get the value stored for `frame`, if that frame is still resident.
    pub fn get(&self, frame: Frame) -> Option<&T> {
        let idx = self.index(frame)?;
        match &self.slots[idx] {
            Some((tag, value)) if *tag == frame => Some(value),
            _ => None,
        }
    }

    /// Mutable access to the value stored for `frame`.
    pub fn get_mut(&mut self, frame: Frame) -> Option<&mut T> {
        let idx = self.index(frame)?;
        match &mut self.slots[idx] {
            Some((tag, value)) if *tag == frame => Some(value),
            _ => None,
        }
    }

    /// Whether `frame` is resident
    pub fn contains(&self, frame: Frame) -> bool {
        self.get(frame).is_some()
    }

    /// Store a value for `frame`.
    ///
    /// Evicts whatever older frame shared the slot. Returns `false` without
    /// storing when the slot already holds a newer frame or `frame` is negative.
    pub fn insert(&mut self, frame: Frame, value: T) -> bool {
        let Some(idx) = self.index(frame) else {
            return false;
        };
        if let Some((tag, _)) = &self.slots[idx]
            && *tag > frame
        {
            return false;
        }
        self.slots[idx] = Some((frame, value));
        true
    }

    /// Get the value for `frame`, inserting `default()` first if absent.
    ///
    /// Returns `None` when the slot is owned by a newer frame.
    pub fn get_or_insert_with(&mut self, frame: Frame, default: impl FnOnce() -> T) -> Option<&mut T> {
        if !self.contains(frame) && !self.insert(frame, default()) {
            return None;
        }
        self.get_mut(frame)
    }

    /// Remove and return the value for `frame`
    pub fn remove(&mut self, frame: Frame) -> Option<T> {
        let idx = self.index(frame)?;
        match &self.slots[idx] {
            Some((tag, _)) if *tag == frame => self.slots[idx].take().map(|(_, value)| value),
            _ => None,
        }
    }

    /// Drop every resident frame older than `min_frame`.
    pub fn trim_before(&mut self, min_frame: Frame) {
        for slot in &mut self.slots {
            if matches!(slot, Some((tag, _)) if *tag < min_frame) {
                *slot = None;
            }
        }
    }

    /// Drop every resident frame at or before `max_frame`.
    pub fn remove_through(&mut self, max_frame: Frame) {
        for slot in &mut self.slots {
            if matches!(slot, Some((tag, _)) if *tag <= max_frame) {
                *slot = None;
            }
        }
    }

    /// Drop every resident frame newer than `max_frame`.
    pub fn remove_after(&mut self, max_frame: Frame) {
        for slot in &mut self.slots {
            if matches!(slot, Some((tag, _)) if *tag > max_frame) {
                *slot = None;
            }
        }
    }

    /// Drop everything
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }

    /// Number of resident frames
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether no frame is resident
    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Oldest resident frame
    pub fn min_frame(&self) -> Option<Frame> {
        self.slots.iter().flatten().map(|(tag, _)| *tag).min()
    }

    /// Newest resident frame
    pub fn max_frame(&self) -> Option<Frame> {
        self.slots.iter().flatten().map(|(tag, _)| *tag).max()
    }

    /// Resident frames in ascending order
    pub fn frames(&self) -> Vec<Frame> {
        let mut frames: Vec<Frame> = self.slots.iter().flatten().map(|(tag, _)| *tag).collect();
        frames.sort_unstable();
        frames
    }
}
