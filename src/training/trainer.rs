//! The training loop: epochs of gradient steps with held-out evaluation and
//! checkpointing after every epoch.

use std::path::Path;

use anyhow::{ensure, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use crate::config::ExperimentConfig;
use crate::data::{build_process, TaskGenerator};
use crate::model::NeuralProcess;
use crate::nn::{Adam, Optimizer, Parameterized};

use super::checkpoint::{Checkpoint, CheckpointStore, EpochRecord};
use super::evaluate::{evaluate, EvalResult};
use super::loss::{compute_loss, LossSettings};
use super::plot::render_fit;

pub struct Trainer {
    config: ExperimentConfig,
    model: NeuralProcess,
    optimizer: Adam,
    generator: TaskGenerator,
    store: CheckpointStore,
    history: Vec<EpochRecord>,
    best_eval: f64,
    start_epoch: usize,
}

impl Trainer {
    pub fn new(config: ExperimentConfig, root: &Path) -> Result<Self> {
        let model = NeuralProcess::build(config.model, &config.model_cfg);
        let optimizer = Adam::new(config.training.learning_rate);
        let generator = TaskGenerator::new(build_process(config.data), config.generator.clone());
        let store = CheckpointStore::new(root, &config.key())?;
        Ok(Self {
            config,
            model,
            optimizer,
            generator,
            store,
            history: Vec::new(),
            best_eval: f64::INFINITY,
            start_epoch: 0,
        })
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn model_mut(&mut self) -> &mut NeuralProcess {
        &mut self.model
    }

    pub fn generator(&self) -> &TaskGenerator {
        &self.generator
    }

    /// Last completed epoch, zero before any training or resume.
    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    fn restore(&mut self, checkpoint: Checkpoint) -> Result<()> {
        ensure!(
            checkpoint.parameters.len() == self.model.num_parameters(),
            "checkpoint has {} parameters but the model expects {}",
            checkpoint.parameters.len(),
            self.model.num_parameters()
        );
        self.model
            .load_parameters(&mut checkpoint.parameters.iter().copied());
        self.best_eval = checkpoint.best_eval;
        self.start_epoch = checkpoint.epoch;
        self.history = checkpoint.history;
        Ok(())
    }

    /// Pick up from the latest checkpoint if one exists. Returns whether a
    /// checkpoint was loaded.
    pub fn resume(&mut self) -> Result<bool> {
        if !self.store.exists("latest") {
            return Ok(false);
        }
        let checkpoint = self.store.load("latest")?;
        info!(
            epoch = checkpoint.epoch,
            best_eval = checkpoint.best_eval,
            "resuming from latest checkpoint"
        );
        self.restore(checkpoint)?;
        Ok(true)
    }

    /// Load the best checkpoint, for evaluation runs.
    pub fn load_best(&mut self) -> Result<()> {
        let checkpoint = self.store.load("best")?;
        info!(epoch = checkpoint.epoch, "loaded best checkpoint");
        self.restore(checkpoint)
    }

    fn loss_settings(&self, epoch: usize) -> LossSettings {
        // The noise clamp steers early epochs toward fitting the mean before
        // the noise head gets a say.
        let noise = if epoch <= self.config.training.fix_noise_epochs {
            Some(self.config.training.fixed_noise)
        } else {
            None
        };
        LossSettings {
            num_samples: self.config.training.num_samples,
            noise,
        }
    }

    fn snapshot(&self, epoch: usize) -> Checkpoint {
        let mut parameters = Vec::with_capacity(self.model.num_parameters());
        self.model.collect_parameters(&mut parameters);
        Checkpoint {
            epoch,
            best_eval: self.best_eval,
            parameters,
            history: self.history.clone(),
        }
    }

    pub fn train(&mut self) -> Result<()> {
        let mut rng = rand::thread_rng();
        let epochs = self.config.training.epochs;
        let batches = self.config.training.batches_per_epoch;

        for epoch in (self.start_epoch + 1)..=epochs {
            let settings = self.loss_settings(epoch);
            let bar = ProgressBar::new(batches as u64);
            bar.set_style(
                ProgressStyle::with_template("{prefix} [{bar:40}] {pos}/{len} ({eta})")
                    .expect("valid progress template")
                    .progress_chars("=>-"),
            );
            bar.set_prefix(format!("epoch {}/{}", epoch, epochs));

            let mut epoch_loss = 0.0;
            let mut steps = 0usize;
            for batch in 0..batches {
                let task = self.generator.sample_batch(&mut rng);
                let value = compute_loss(
                    &mut self.model,
                    self.config.loss,
                    &task,
                    &settings,
                    true,
                    &mut rng,
                );
                bar.inc(1);

                if !value.is_finite() {
                    warn!(epoch, batch, "non-finite loss, skipping optimizer step");
                    continue;
                }

                let mut params = Vec::with_capacity(self.model.num_parameters());
                self.model.collect_parameters(&mut params);
                let mut grads = Vec::with_capacity(params.len());
                self.model.collect_gradients(&mut grads);
                self.optimizer.step(&mut params, &grads);
                self.model.load_parameters(&mut params.into_iter());

                epoch_loss += value;
                steps += 1;
            }
            bar.finish_and_clear();

            let train_loss = epoch_loss / steps.max(1) as f64;
            let eval_settings = LossSettings {
                num_samples: self.config.training.num_samples,
                noise: None,
            };
            let eval = evaluate(
                &mut self.model,
                self.config.loss,
                &self.generator,
                &eval_settings,
                self.config.training.eval_batches,
                &mut rng,
            );
            info!(
                epoch,
                train_loss,
                eval_loss = eval.mean,
                eval_stderr = eval.stderr,
                "epoch complete"
            );

            self.history.push(EpochRecord {
                epoch,
                train_loss,
                eval_loss: eval.mean,
                eval_error: eval.stderr,
            });

            let improved = eval.mean < self.best_eval;
            if improved {
                self.best_eval = eval.mean;
            }
            let checkpoint = self.snapshot(epoch);
            self.store.save("latest", &checkpoint)?;
            if improved {
                info!(epoch, best_eval = self.best_eval, "new best model");
                self.store.save("best", &checkpoint)?;
            }

            // Diagnostic fit of one fresh task.
            let task = self.generator.sample_batch(&mut rng);
            let plot_path = self.store.dir().join(format!("epoch-{:03}.png", epoch));
            if let Err(err) = render_fit(
                &mut self.model,
                self.generator.process(),
                &task,
                0,
                3,
                &mut rng,
                &plot_path,
            ) {
                warn!(epoch, %err, "failed to render diagnostic plot");
            }
        }
        Ok(())
    }

    /// Evaluate the current model on every held-out regime.
    pub fn evaluate_regimes(&mut self) -> Result<Vec<(String, EvalResult)>> {
        let mut rng = rand::thread_rng();
        let settings = LossSettings {
            num_samples: self.config.training.num_samples,
            noise: None,
        };

        let mut results = Vec::new();
        for regime in self.config.eval_regimes() {
            let generator =
                TaskGenerator::new(build_process(self.config.data), regime.generator.clone());
            let result = evaluate(
                &mut self.model,
                self.config.loss,
                &generator,
                &settings,
                self.config.training.final_eval_batches,
                &mut rng,
            );
            info!(
                regime = %regime.name,
                mean = result.mean,
                stderr = result.stderr,
                "held-out evaluation"
            );
            results.push((regime.name, result));
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataName, LossName, ModelConfig, ModelName};

    fn tiny_experiment() -> ExperimentConfig {
        let mut config =
            ExperimentConfig::build(DataName::Eq, ModelName::Np, LossName::Loglik).unwrap();
        config.generator.batch_size = 2;
        config.generator.num_context = (3, 5);
        config.generator.num_target = (5, 5);
        config.model_cfg = ModelConfig {
            dim_r: 4,
            dim_z: 2,
            hidden: 6,
            num_layers: 1,
            ..ModelConfig::default()
        };
        config.training.epochs = 1;
        config.training.batches_per_epoch = 3;
        config.training.eval_batches = 2;
        config.training.final_eval_batches = 2;
        config.training.num_samples = 2;
        config
    }

    #[test]
    fn test_one_epoch_writes_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_experiment(), tmp.path()).unwrap();
        trainer.train().unwrap();

        assert!(trainer.store().exists("latest"));
        assert!(trainer.store().exists("best"));

        let latest = trainer.store().load("latest").unwrap();
        assert_eq!(latest.epoch, 1);
        assert_eq!(latest.history.len(), 1);
        assert!(latest.history[0].train_loss.is_finite());
        assert!(latest.parameters.iter().all(|p| p.is_finite()));
    }

    #[test]
    fn test_resume_continues_from_latest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_experiment(), tmp.path()).unwrap();
        assert!(!trainer.resume().unwrap());
        trainer.train().unwrap();

        let mut resumed = Trainer::new(tiny_experiment(), tmp.path()).unwrap();
        assert!(resumed.resume().unwrap());
        assert_eq!(resumed.start_epoch, 1);
        assert_eq!(resumed.history.len(), 1);
        // Nothing left to do; train() should be a no-op.
        resumed.train().unwrap();
        assert_eq!(resumed.store().load("latest").unwrap().epoch, 1);
    }

    #[test]
    fn test_evaluate_regimes_covers_all_three() {
        let tmp = tempfile::tempdir().unwrap();
        let mut trainer = Trainer::new(tiny_experiment(), tmp.path()).unwrap();
        let results = trainer.evaluate_regimes().unwrap();
        assert_eq!(results.len(), 3);
        for (name, result) in &results {
            assert!(result.mean.is_finite(), "{} produced {}", name, result.mean);
        }
    }
}
