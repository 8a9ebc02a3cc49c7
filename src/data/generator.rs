//! Batch task sampler.

use ndarray::{Array1, Array3};
use rand::Rng;

use super::{StochasticProcess, Task};
use crate::config::GeneratorConfig;

/// Samples batches of tasks from a stochastic process.
///
/// Context and target counts are drawn once per batch and shared across the
/// batch, so every batch is rectangular without padding. Each task in the
/// batch is an independent joint draw from the process over the concatenated
/// context and target locations, split afterwards.
pub struct TaskGenerator {
    process: Box<dyn StochasticProcess>,
    config: GeneratorConfig,
}

impl TaskGenerator {
    pub fn new(process: Box<dyn StochasticProcess>, config: GeneratorConfig) -> Self {
        Self { process, config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    pub fn process(&self) -> &dyn StochasticProcess {
        self.process.as_ref()
    }

    /// Draw one batch of tasks.
    pub fn sample_batch(&self, rng: &mut impl Rng) -> Task {
        let b = self.config.batch_size;
        let (lo, hi) = self.config.x_range;

        // Counts shared across the batch.
        let num_context = rng.gen_range(self.config.num_context.0..=self.config.num_context.1);
        let num_target = rng.gen_range(self.config.num_target.0..=self.config.num_target.1);

        let mut xc = Array3::zeros((b, num_context, 1));
        let mut yc = Array3::zeros((b, num_context, 1));
        let mut xt = Array3::zeros((b, num_target, 1));
        let mut yt = Array3::zeros((b, num_target, 1));

        for bi in 0..b {
            // One joint set of locations so the process is drawn consistently
            // across context and target.
            let total = num_context + num_target;
            let x = Array1::from_shape_fn(total, |_| rng.gen_range(lo..hi));
            let y = self.process.sample_joint(&x, rng);

            for i in 0..num_context {
                xc[[bi, i, 0]] = x[i];
                yc[[bi, i, 0]] = y[i];
            }
            for i in 0..num_target {
                xt[[bi, i, 0]] = x[num_context + i];
                yt[[bi, i, 0]] = y[num_context + i];
            }
        }

        let task = Task { xc, yc, xt, yt };
        debug_assert!(task.validate());
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataName;
    use crate::data::build_process;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn generator(data: DataName) -> TaskGenerator {
        TaskGenerator::new(build_process(data), GeneratorConfig::default())
    }

    #[test]
    fn test_batch_shape_invariants() {
        let mut rng = StdRng::seed_from_u64(11);
        for data in [DataName::Eq, DataName::Sawtooth, DataName::Mixture] {
            let gen = generator(data);
            for _ in 0..5 {
                let task = gen.sample_batch(&mut rng);
                assert!(task.validate());
                assert_eq!(task.batch_size(), 16);
                assert_eq!(task.xc.shape()[1], task.yc.shape()[1]);
                assert_eq!(task.xt.shape()[1], task.yt.shape()[1]);
            }
        }
    }

    #[test]
    fn test_counts_within_configured_ranges() {
        let mut rng = StdRng::seed_from_u64(12);
        let gen = generator(DataName::Eq);
        for _ in 0..20 {
            let task = gen.sample_batch(&mut rng);
            assert!((3..=50).contains(&task.num_context()));
            assert_eq!(task.num_target(), 50);
        }
    }

    #[test]
    fn test_locations_within_range() {
        let mut rng = StdRng::seed_from_u64(13);
        let gen = generator(DataName::Eq);
        let task = gen.sample_batch(&mut rng);
        for &v in task.xc.iter().chain(task.xt.iter()) {
            assert!((-2.0..2.0).contains(&v));
        }
    }

    #[test]
    fn test_context_and_target_from_same_draw() {
        // A GP with a long length scale produces nearly constant sample
        // paths, so context and target values of one task must be close.
        use crate::data::{GaussianProcess, Kernel};
        let gen = TaskGenerator::new(
            Box::new(GaussianProcess::new(Kernel::Eq { scale: 100.0 })),
            GeneratorConfig {
                batch_size: 2,
                ..Default::default()
            },
        );
        let mut rng = StdRng::seed_from_u64(14);
        let task = gen.sample_batch(&mut rng);
        for bi in 0..2 {
            let c = task.yc[[bi, 0, 0]];
            let t = task.yt[[bi, 0, 0]];
            assert!((c - t).abs() < 0.1, "context {} target {}", c, t);
        }
    }
}
