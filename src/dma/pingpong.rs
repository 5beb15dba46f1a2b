//! Double buffering.
//!
//! Two equally sized slots in TCDM. In every round the DM core fills the
//! write slot for round `r + 1` while the compute cores consume the read
//! slot filled in round `r`. All participants call [`PingPong::swap`] after
//! the same barrier, so every core agrees on which slot is which without
//! further communication.
//!
//! ```text
//!   round:      0          1          2
//!   slot A:   [fill] ──► [read] ──► [fill]
//!   slot B:   [    ]     [fill] ──► [read]
//! ```
//!
//! The DM core must wait for its round's transfers before arriving at the
//! barrier; the barrier is what keeps a completion from landing in a slot
//! that is already being read.

use crate::memory::{AllocError, Scratchpad};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingPong {
    slots: [u64; 2],
    slot_size: u64,
    round: u32,
}

impl PingPong {
    /// Carve both slots out of `l1`.
    pub fn alloc(l1: &Scratchpad, slot_size: u64) -> Result<Self, AllocError> {
        let a = l1.alloc(slot_size)?;
        let b = l1.alloc(slot_size)?;
        Ok(Self::from_slots(a, b, slot_size))
    }

    /// Use two slots the caller already owns.
    pub fn from_slots(a: u64, b: u64, slot_size: u64) -> Self {
        Self {
            slots: [a, b],
            slot_size,
            round: 0,
        }
    }

    /// Slot being filled this round.
    pub fn write_slot(&self) -> u64 {
        self.slots[(self.round % 2) as usize]
    }

    /// Slot being consumed this round.
    pub fn read_slot(&self) -> u64 {
        self.slots[((self.round + 1) % 2) as usize]
    }

    pub fn slot_size(&self) -> u64 {
        self.slot_size
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    /// Advance to the next round: the slot just filled becomes readable.
    pub fn swap(&mut self) {
        self.round = self.round.wrapping_add(1);
    }
}
