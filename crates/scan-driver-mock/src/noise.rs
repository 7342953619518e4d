//! Seeded sensor noise, so a simulated run can be replayed exactly.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Uniform noise drawn from one seeded generator.
pub struct SensorNoise {
    rng: Mutex<ChaCha8Rng>,
}

impl SensorNoise {
    /// Generator seeded with `seed`, or from the OS when `None`.
    #[must_use]
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Uniform value in `[-amplitude, amplitude]`.
    pub fn sample(&self, amplitude: f64) -> f64 {
        if amplitude <= 0.0 {
            return 0.0;
        }
        self.rng.lock().gen_range(-amplitude..=amplitude)
    }
}
