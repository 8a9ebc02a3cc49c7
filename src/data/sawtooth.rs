//! Random sawtooth waves.

use ndarray::Array1;
use rand::Rng;
use rand::RngCore;

use super::StochasticProcess;

/// A sawtooth wave with random frequency, phase and direction.
///
/// `y(x) = A * frac(f * (d * x + s)) - A / 2`, with frequency `f` drawn
/// uniformly from `freq_range`, shift `s` uniform over one period, and
/// direction `d` a random sign.
pub struct Sawtooth {
    pub amplitude: f64,
    pub freq_range: (f64, f64),
}

impl Default for Sawtooth {
    fn default() -> Self {
        Self {
            amplitude: 1.0,
            freq_range: (3.0, 5.0),
        }
    }
}

impl StochasticProcess for Sawtooth {
    fn sample_joint(&self, x: &Array1<f64>, rng: &mut dyn RngCore) -> Array1<f64> {
        let freq = rng.gen_range(self.freq_range.0..self.freq_range.1);
        let shift = rng.gen_range(0.0..1.0 / freq);
        let direction = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };

        x.mapv(|xi| {
            let phase = freq * (direction * xi + shift);
            self.amplitude * (phase - phase.floor()) - self.amplitude / 2.0
        })
    }

    fn name(&self) -> &'static str {
        "sawtooth"
    }
}
