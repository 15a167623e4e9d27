//! Secure random number generation.
//!
//! Randomness is injected through the [`Prng`] trait so that concurrent
//! sessions never share hidden global state and tests can run with a
//! deterministic source.

use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use rand_core::OsRng;

/// Source of random bytes for session ids, handshake randoms and IVs.
pub trait Prng: Send + Sync {
    /// Fill a buffer with random bytes.
    fn fill(&self, dest: &mut [u8]);

    /// Generate `length` random bytes.
    fn data(&self, length: usize) -> Vec<u8> {
        let mut buf = vec![0u8; length];
        self.fill(&mut buf);
        buf
    }
}

/// Cryptographically secure random number generator.
///
/// Wraps the OS-provided entropy source (e.g., /dev/urandom on Unix,
/// BCryptGenRandom on Windows).
#[derive(Debug, Clone, Copy, Default)]
pub struct SecureRandom;

impl SecureRandom {
    /// Shared handle suitable for passing to constructors.
    pub fn shared() -> Arc<dyn Prng> {
        Arc::new(SecureRandom)
    }
}

impl Prng for SecureRandom {
    fn fill(&self, dest: &mut [u8]) {
        OsRng.fill_bytes(dest);
    }
}

/// Deterministic generator seeded from a fixed value.
///
/// Not for production traffic: intended for reproducible tests and
/// benchmarks.
pub struct SeededRandom {
    rng: Mutex<StdRng>,
}

impl SeededRandom {
    /// Create a generator from a 64-bit seed.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Prng for SeededRandom {
    fn fill(&self, dest: &mut [u8]) {
        self.rng.lock().fill_bytes(dest);
    }
}
