//! Seeded RNG wrapper for reproducible behavior.
//!
//! Thread-safe ChaCha8 generator shared by error injection and chaos-mode
//! timing jitter. Fix the seed to make a failing run repeatable.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seeded RNG wrapper for reproducible random behavior
pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG with optional seed.
    /// If seed is None, uses a random seed from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// `true` with probability `rate` (clamped to `[0, 1]`).
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().r#gen::<f64>() < rate
    }

    /// Generate a random value in the given range
    pub fn gen_range<T, R>(&self, range: R) -> T
    where
        T: rand::distributions::uniform::SampleUniform,
        R: rand::distributions::uniform::SampleRange<T>,
    {
        self.inner.lock().gen_range(range)
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}
