//! Deterministic RNG shared between the scheduler and audited nodes.
//!
//! Challenge positions must come out identical on both sides of an audit, so
//! the generator is pinned to an explicit definition rather than any library
//! default: a 64-bit linear congruential generator with the MMIX constants,
//!
//! ```text
//! state' = state × 6364136223846793005 + 1442695040888963407   (mod 2^64)
//! output = state' >> 33
//! draw(max) = output % max
//! ```
//!
//! Node implementations in any language reproduce the stream from the round
//! seed alone. The test vectors below are the cross-implementation contract.

const MULTIPLIER: u64 = 6_364_136_223_846_793_005;
const INCREMENT: u64 = 1_442_695_040_888_963_407;

/// Seeded deterministic generator. Cheap to construct; not cryptographic.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Advances the state and returns the next raw output.
    pub fn next_value(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT);
        self.state >> 33
    }

    /// Draws a value in `[0, max)`. A `max` of zero returns zero without
    /// advancing the state.
    pub fn draw(&mut self, max: u64) -> u64 {
        if max == 0 {
            return 0;
        }
        self.next_value() % max
    }

    /// Fisher–Yates shuffle driven by this generator.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.draw(i as u64 + 1) as usize;
            items.swap(i, j);
        }
    }
}
