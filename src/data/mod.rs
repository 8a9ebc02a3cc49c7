//! Synthetic data generation: stochastic processes and the task sampler.

pub mod generator;
pub mod gp;
pub mod sawtooth;
pub mod task;

pub use generator::TaskGenerator;
pub use gp::{GaussianProcess, Kernel};
pub use sawtooth::Sawtooth;
pub use task::Task;

use ndarray::Array1;
use rand::prelude::*;
use rand::RngCore;

use crate::config::DataName;

/// A source of sample paths over 1-D input locations.
///
/// One joint draw per task keeps context and target values consistent with a
/// single underlying function.
pub trait StochasticProcess {
    /// Draw one sample path jointly at the given input locations.
    fn sample_joint(&self, x: &Array1<f64>, rng: &mut dyn RngCore) -> Array1<f64>;

    /// Closed-form posterior mean and variance at `xs` given observations,
    /// when the process admits one. Used for ground-truth overlays.
    fn posterior(
        &self,
        _xc: &Array1<f64>,
        _yc: &Array1<f64>,
        _xs: &Array1<f64>,
    ) -> Option<(Array1<f64>, Array1<f64>)> {
        None
    }

    fn name(&self) -> &'static str;
}

/// Uniform mixture over component processes, chosen independently per task.
pub struct Mixture {
    components: Vec<Box<dyn StochasticProcess>>,
}

impl Mixture {
    pub fn new(components: Vec<Box<dyn StochasticProcess>>) -> Self {
        Self { components }
    }
}

impl StochasticProcess for Mixture {
    fn sample_joint(&self, x: &Array1<f64>, rng: &mut dyn RngCore) -> Array1<f64> {
        let idx = rng.gen_range(0..self.components.len());
        self.components[idx].sample_joint(x, rng)
    }

    fn name(&self) -> &'static str {
        "mixture"
    }
}

/// Construct the stochastic process for a dataset name.
pub fn build_process(data: DataName) -> Box<dyn StochasticProcess> {
    match data {
        DataName::Eq => Box::new(GaussianProcess::new(Kernel::Eq { scale: 0.25 })),
        DataName::Matern => Box::new(GaussianProcess::new(Kernel::Matern52 { scale: 0.25 })),
        DataName::WeaklyPeriodic => Box::new(GaussianProcess::new(Kernel::WeaklyPeriodic {
            period: 1.0,
            decay: 4.0,
        })),
        DataName::Sawtooth => Box::new(Sawtooth::default()),
        DataName::Mixture => Box::new(Mixture::new(vec![
            Box::new(GaussianProcess::new(Kernel::Eq { scale: 0.25 })),
            Box::new(GaussianProcess::new(Kernel::Matern52 { scale: 0.25 })),
            Box::new(GaussianProcess::new(Kernel::WeaklyPeriodic {
                period: 1.0,
                decay: 4.0,
            })),
            Box::new(Sawtooth::default()),
        ])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_mixture_samples_have_right_length() {
        let mut rng = StdRng::seed_from_u64(7);
        let process = build_process(DataName::Mixture);
        let x = Array1::linspace(-2.0, 2.0, 30);
        for _ in 0..10 {
            let y = process.sample_joint(&x, &mut rng);
            assert_eq!(y.len(), 30);
            assert!(y.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_build_process_names() {
        assert_eq!(build_process(DataName::Eq).name(), "eq");
        assert_eq!(build_process(DataName::Sawtooth).name(), "sawtooth");
        assert_eq!(build_process(DataName::Mixture).name(), "mixture");
    }
}
