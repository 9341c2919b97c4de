//! Deterministic random number generator
//!
//! `flag` rules draw against their probability with this generator, so a
//! simulation seeded the same way produces the same sequence of events.

use serde::{Deserialize, Serialize};

/// Seed used when the configuration does not provide `Context.seed`
pub const DEFAULT_SEED: u64 = 12345;

/// A deterministic random number generator (xorshift64)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimRng {
    state: u64,
}

impl SimRng {
    /// Create a new RNG with the given seed
    pub fn new(seed: u64) -> Self {
        // xorshift requires a non-zero state
        let state = if seed == 0 { 1 } else { seed };
        Self { state }
    }

    /// Get the current state
    pub fn state(&self) -> u64 {
        self.state
    }

    /// Generate the next raw u64 value
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    /// Generate a random f64 in range [0, 1)
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() as f64) / (u64::MAX as f64 + 1.0)
    }

    /// Generate a random f64 in range [min, max)
    pub fn range_f64(&mut self, min: f64, max: f64) -> f64 {
        min + self.next_f64() * (max - min)
    }

    /// Draw an event of the given probability.
    ///
    /// Certain events (`probability >= 1`) never consume a draw.
    pub fn chance(&mut self, probability: f64) -> bool {
        if probability >= 1.0 {
            return true;
        }
        self.next_f64() < probability
    }
}

impl Default for SimRng {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}
