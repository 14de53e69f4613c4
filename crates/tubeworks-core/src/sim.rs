//! Time-advance strategy and per-tick bookkeeping types.
//!
//! The level runs the same phase pipeline regardless of strategy; the
//! strategy only decides how many fixed steps an `advance()` call executes.

use crate::command_queue::EditOutcome;
use crate::fixed::{Fixed64, Ticks};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

/// How the level advances time. Chosen at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SimulationStrategy {
    /// One fixed step per `step()` call; the host drives the clock.
    Tick,
    /// Real-time host: `advance(dt)` accumulates elapsed ticks and runs as
    /// many fixed steps as fit, carrying the remainder.
    Delta {
        /// Length of one fixed step, in ticks.
        fixed_timestep: Ticks,
    },
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// The authoritative tick counter plus the delta-mode accumulator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimState {
    /// Current tick. Incremented exactly once per completed step.
    pub tick: Ticks,
    /// Unspent time carried between `advance()` calls in delta mode.
    pub accumulator: Ticks,
}

impl SimState {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Advance result
// ---------------------------------------------------------------------------

/// What an `advance()`/`step()` call did.
#[derive(Debug, Default)]
pub struct AdvanceResult {
    /// Completed steps.
    pub steps_run: u64,
    /// Outcomes of every structural edit applied (or rejected) during the
    /// edit phases of those steps, in application order.
    pub edits: Vec<EditOutcome>,
}

// ---------------------------------------------------------------------------
// State hash
// ---------------------------------------------------------------------------

/// FNV-1a (64-bit) accumulator for cheap divergence detection between two
/// runs of the same command stream. Not cryptographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHash(u64);

impl StateHash {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;

    pub fn new() -> Self {
        Self(Self::OFFSET)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(Self::PRIME);
        }
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.write(&v.to_le_bytes());
    }

    pub fn write_fixed64(&mut self, v: Fixed64) {
        self.write(&v.to_bits().to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for StateHash {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_state_starts_at_zero() {
        let s = SimState::new();
        assert_eq!(s.tick, 0);
        assert_eq!(s.accumulator, 0);
    }

    #[test]
    fn hash_is_deterministic() {
        let mut a = StateHash::new();
        let mut b = StateHash::new();
        a.write_u64(99);
        a.write_i32(-5);
        b.write_u64(99);
        b.write_i32(-5);
        assert_eq!(a.finish(), b.finish());
    }

    #[test]
    fn hash_differs_on_input_and_order() {
        let mut a = StateHash::new();
        let mut b = StateHash::new();
        a.write_u32(1);
        a.write_u32(2);
        b.write_u32(2);
        b.write_u32(1);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn hash_covers_fixed64_bits() {
        let mut a = StateHash::new();
        let mut b = StateHash::new();
        a.write_fixed64(Fixed64::from_num(0.5));
        b.write_fixed64(Fixed64::from_num(0.25));
        assert_ne!(a.finish(), b.finish());
    }
}
