//! Payload byte sources.
//!
//! The benchmark fills its source buffer from a `ByteSource` so tests can
//! swap the process-wide RNG for a seeded one.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Fills payload buffers with bytes.
pub trait ByteSource: Send {
    fn fill(&mut self, buf: &mut [u8]);
}

/// Thread-local RNG. Not reproducible across runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngSource;

impl ByteSource for ThreadRngSource {
    fn fill(&mut self, buf: &mut [u8]) {
        rand::rng().fill_bytes(buf);
    }
}

/// Seeded `StdRng`, reproducible for a given seed.
#[derive(Debug, Clone)]
pub struct SeededSource {
    rng: StdRng,
}

impl SeededSource {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl ByteSource for SeededSource {
    fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }
}
