//! Smearer: randomizes a nominal delay by ±p% so a fleet of clients
//! desynchronizes its periodic network traffic.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

/// Source of the uniform draw the smearer needs. Injectable so tests can
/// pin the draw and assert the exact smeared value, and so a fleet can
/// seed it independently per instance from config.
pub trait SmearRng: Send + Sync {
    /// A fresh draw from `Uniform[-1, +1]`.
    fn signed_unit(&self) -> f64;
}

/// Production RNG: a `StdRng` seeded once at construction.
pub struct SeededRng(Mutex<StdRng>);

impl SeededRng {
    pub fn from_seed(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    pub fn from_entropy() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }
}

impl SmearRng for SeededRng {
    fn signed_unit(&self) -> f64 {
        let mut rng = self.0.lock().expect("smear rng mutex poisoned");
        rng.gen_range(-1.0..=1.0)
    }
}

/// Generates the single-use nonces and application client ids used to
/// correlate an Initialize with its TokenControl response.
pub trait NonceSource: Send + Sync {
    fn generate(&self) -> Vec<u8>;
}

impl NonceSource for SeededRng {
    fn generate(&self) -> Vec<u8> {
        let mut rng = self.0.lock().expect("smear rng mutex poisoned");
        (0..16).map(|_| rng.gen::<u8>()).collect()
    }
}

/// Randomizes nominal periodic delays by a fixed fraction.
pub struct Smearer {
    /// Smear fraction `p`, in `(0, 1]`.
    fraction: f64,
    rng: Box<dyn SmearRng>,
}

impl Smearer {
    pub fn new(fraction: f64, rng: Box<dyn SmearRng>) -> Self {
        assert!(fraction > 0.0 && fraction <= 1.0, "smear fraction must be in (0, 1]");
        Self { fraction, rng }
    }

    /// `smear(delay) = delay + delay * u * p`, rounded up to the next
    /// millisecond. `delay = 0` always returns `0` without drawing from
    /// the RNG.
    pub fn smear(&self, delay: Duration) -> Duration {
        if delay.is_zero() {
            return Duration::ZERO;
        }
        let u = self.rng.signed_unit();
        let nominal_ms = delay.as_secs_f64() * 1000.0;
        let smeared_ms = nominal_ms + nominal_ms * u * self.fraction;
        let rounded_ms = smeared_ms.max(0.0).ceil() as u64;
        Duration::from_millis(rounded_ms)
    }
}
