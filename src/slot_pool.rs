use std::collections::VecDeque;

use anyhow::bail;
use tracing::trace;

use crate::frame::Frame;

/// Index of a slot within its pool. Only meaningful together with the pool it was
///  acquired from.
pub type SlotIndex = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Free,
    /// Popped off the free list but not yet enqueued - transiently owned by the
    ///  caller within a single operation.
    Leased,
    Queued,
}

/// A bounded pool of frame slots: a fixed arena plus index-based free and queued
///  lists, and the pool's phase bit. All storage is allocated once at
///  construction; afterwards slots only ever move between the two lists.
///
/// A slot stuck in `queued` forever is a protocol bug above this layer, not a pool
///  bug.
pub struct SlotPool {
    frames: Box<[Frame]>,
    states: Box<[SlotState]>,
    free: VecDeque<SlotIndex>,
    queued: VecDeque<SlotIndex>,
    phase: bool,
}

impl SlotPool {
    pub fn new(slot_count: usize) -> SlotPool {
        SlotPool {
            frames: vec![Frame::from_wire([0u8; crate::frame::FRAME_LEN]); slot_count].into_boxed_slice(),
            states: vec![SlotState::Free; slot_count].into_boxed_slice(),
            free: (0..slot_count).collect(),
            queued: VecDeque::with_capacity(slot_count),
            phase: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queued.len()
    }

    /// Pop the free-list head. `None` means exhaustion, which is a regular
    ///  condition (flow control), not a bug.
    pub fn acquire(&mut self) -> Option<SlotIndex> {
        let slot = self.free.pop_front()?;
        self.states[slot] = SlotState::Leased;
        trace!("acquired slot {}", slot);
        Some(slot)
    }

    pub fn frame(&self, slot: SlotIndex) -> &Frame {
        &self.frames[slot]
    }

    pub fn frame_mut(&mut self, slot: SlotIndex) -> &mut Frame {
        &mut self.frames[slot]
    }

    /// Move an acquired slot to the queued-list tail.
    pub fn enqueue(&mut self, slot: SlotIndex) -> anyhow::Result<()> {
        if self.states[slot] != SlotState::Leased {
            bail!("slot {} enqueued without being acquired first", slot);
        }
        self.states[slot] = SlotState::Queued;
        self.queued.push_back(slot);
        Ok(())
    }

    /// Move a queued slot back to the free list. Releasing a slot that is not
    ///  queued is a protocol-state violation.
    pub fn release(&mut self, slot: SlotIndex) -> anyhow::Result<()> {
        if self.states[slot] != SlotState::Queued {
            bail!("slot {} released without being queued", slot);
        }
        let pos = self.queued.iter().position(|&s| s == slot)
            .expect("state says queued, so the queued list must contain the slot");
        self.queued.remove(pos);
        self.states[slot] = SlotState::Free;
        self.free.push_back(slot);
        Ok(())
    }

    /// Take the queued-list head out of the pool, returning a copy of its frame;
    ///  the slot goes straight back to the free list.
    pub fn pop_queued(&mut self) -> Option<Frame> {
        let slot = self.queued.pop_front()?;
        self.states[slot] = SlotState::Free;
        self.free.push_back(slot);
        Some(self.frames[slot])
    }

    /// Force-release every queued slot. Part of a link reset.
    pub fn clear(&mut self) {
        while let Some(slot) = self.queued.pop_front() {
            self.states[slot] = SlotState::Free;
            self.free.push_back(slot);
        }
    }

    pub fn phase(&self) -> bool {
        self.phase
    }

    /// Flip the pool's phase bit, returning the previous value.
    pub fn phase_switch(&mut self) -> bool {
        let previous = self.phase;
        self.phase = !self.phase;
        previous
    }

    pub fn set_phase(&mut self, phase: bool) {
        self.phase = phase;
    }
}
