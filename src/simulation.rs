//! Synthetic readings for running without hardware.
//!
//! When a controller runs in simulation mode it never opens a transport. Its
//! read cycle asks a [`TestSignalSource`] for a plausible value per channel
//! instead. Each controller owns its own source seeded from the configured
//! base seed and the controller id, so two controllers never produce the same
//! sequence while a fixed base seed still makes runs reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;

/// Ambient temperature the simulated thermometers relax toward, in Kelvin.
pub const AMBIENT_KELVIN: f64 = 293.15;

/// Seeded generator of physically plausible instrument values.
#[derive(Debug)]
pub struct TestSignalSource {
    rng: StdRng,
    started: Instant,
    phase: f64,
    omega: f64,
    offset: f64,
}

impl TestSignalSource {
    /// Creates a source for one controller.
    ///
    /// `base_seed` of `None` draws a fresh seed, so unseeded runs vary.
    pub fn new(base_seed: Option<u64>, controller_key: u64) -> Self {
        let base = base_seed.unwrap_or_else(rand::random);
        let mut rng =
            StdRng::seed_from_u64(base ^ controller_key.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let phase = rng.gen::<f64>() * 10.0;
        let omega = rng.gen::<f64>();
        let offset = rng.gen::<f64>() * 10.0;
        Self {
            rng,
            started: Instant::now(),
            phase,
            omega,
            offset,
        }
    }

    /// Next pressure in mbar.
    ///
    /// Without a previous value a fresh log-uniform value between 1e-12 and
    /// 1e2 is drawn; otherwise the previous value fluctuates by at most 1 %.
    pub fn pressure(&mut self, previous: f64) -> f64 {
        if previous.is_finite() && previous > 0.0 {
            previous * self.jitter()
        } else {
            let exponent = self.rng.gen_range(-11..3);
            let significand = 0.9 * self.rng.gen::<f64>() + 0.1;
            significand * 10f64.powi(exponent)
        }
    }

    /// Next temperature in Kelvin.
    ///
    /// Without a previous value a random start between 1 K and 300 K is drawn;
    /// otherwise the value jitters by at most 1 % and relaxes slightly toward
    /// [`AMBIENT_KELVIN`].
    pub fn temperature(&mut self, previous: f64) -> f64 {
        if previous.is_finite() {
            let jittered = previous * self.jitter();
            jittered + 0.02 * (AMBIENT_KELVIN - jittered)
        } else {
            f64::from(self.rng.gen_range(1..300))
        }
    }

    /// Current in pA: a slow sinusoid with noise and a per-source offset.
    pub fn current(&mut self) -> f64 {
        let t = self.started.elapsed().as_secs_f64();
        (self.omega * t / 5.0 + self.phase).sin() * 10.0 + self.rng.gen::<f64>() + self.offset
    }

    fn jitter(&mut self) -> f64 {
        self.rng.gen_range(0.99..1.01)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pressure_range() {
        let mut source = TestSignalSource::new(Some(7), 1);
        for _ in 0..1000 {
            let p = source.pressure(f64::NAN);
            assert!(p >= 1e-12 && p < 1e3, "pressure {p} out of range");
        }
    }

    #[test]
    fn test_pressure_fluctuates_around_previous() {
        let mut source = TestSignalSource::new(Some(7), 1);
        for _ in 0..100 {
            let p = source.pressure(1e-6);
            assert!((p / 1e-6 - 1.0).abs() <= 0.0101);
        }
    }

    #[test]
    fn test_temperature_bounded_walk() {
        let mut source = TestSignalSource::new(Some(11), 2);
        let mut t = source.temperature(f64::NAN);
        assert!((1.0..300.0).contains(&t));
        for _ in 0..10_000 {
            t = source.temperature(t);
            assert!(t.is_finite());
        }
        assert!((150.0..450.0).contains(&t), "temperature {t} drifted away from ambient");
    }

    #[test]
    fn test_current_is_bounded() {
        let mut source = TestSignalSource::new(Some(3), 4);
        for _ in 0..100 {
            let i = source.current();
            assert!((-10.0..=21.0).contains(&i));
        }
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = TestSignalSource::new(Some(42), 5);
        let mut b = TestSignalSource::new(Some(42), 5);
        let mut c = TestSignalSource::new(Some(42), 6);
        let seq_a: Vec<f64> = (0..5).map(|_| a.pressure(f64::NAN)).collect();
        let seq_b: Vec<f64> = (0..5).map(|_| b.pressure(f64::NAN)).collect();
        let seq_c: Vec<f64> = (0..5).map(|_| c.pressure(f64::NAN)).collect();
        assert_eq!(seq_a, seq_b);
        assert_ne!(seq_a, seq_c);
    }
}
