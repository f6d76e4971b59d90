//! Slot accounting for fixed buffer pools
//!
//! Kernel buffer queues hand out a small, fixed number of slots. Each slot is
//! either queued (owned by the driver or codec) or held by the application.
//! The pool tracks that state by index so a missing release shows up as a
//! refused checkout instead of a silent capture stall.

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Queued,
    Held,
}

#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<SlotState>,
    held: usize,
    /// Highest number of slots the application may hold at once
    limit: usize,
}

impl BufferPool {
    /// Pool where the kernel always keeps at least one slot to write into
    pub fn new(capacity: usize) -> Self {
        Self::with_limit(capacity, capacity.saturating_sub(1))
    }

    pub fn with_limit(capacity: usize, limit: usize) -> Self {
        Self {
            slots: vec![SlotState::Queued; capacity],
            held: 0,
            limit: limit.min(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn held(&self) -> usize {
        self.held
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn state(&self, index: usize) -> Option<SlotState> {
        self.slots.get(index).copied()
    }

    /// Whether another slot may be taken without starving the queue
    pub fn can_checkout(&self) -> bool {
        self.held < self.limit
    }

    pub fn ensure_available(&self) -> Result<()> {
        if self.can_checkout() {
            Ok(())
        } else {
            Err(Error::PoolExhausted {
                held: self.held,
                capacity: self.capacity(),
            })
        }
    }

    /// First queued slot, for pools where the application picks the slot
    pub fn first_queued(&self) -> Option<usize> {
        self.slots.iter().position(|s| *s == SlotState::Queued)
    }

    /// Mark a slot as held by the application
    pub fn checkout(&mut self, index: usize) -> Result<()> {
        self.ensure_available()?;
        match self.slots.get_mut(index) {
            Some(slot) if *slot == SlotState::Queued => {
                *slot = SlotState::Held;
                self.held += 1;
                Ok(())
            }
            Some(_) => Err(Error::Stream(format!(
                "buffer {index} handed out twice"
            ))),
            None => Err(Error::Stream(format!("buffer index {index} out of range"))),
        }
    }

    /// Mark a held slot as queued again
    pub fn checkin(&mut self, index: usize) -> Result<()> {
        match self.slots.get_mut(index) {
            Some(slot) if *slot == SlotState::Held => {
                *slot = SlotState::Queued;
                self.held -= 1;
                Ok(())
            }
            Some(_) => Err(Error::Stream(format!(
                "buffer {index} released while not held"
            ))),
            None => Err(Error::Stream(format!("buffer index {index} out of range"))),
        }
    }

    /// Take back every held slot; returns how many were outstanding
    pub fn reclaim_all(&mut self) -> usize {
        let outstanding = self.held;
        self.slots.fill(SlotState::Queued);
        self.held = 0;
        outstanding
    }
}
