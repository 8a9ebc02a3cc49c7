//! Experiment configuration.
//!
//! All hyperparameters other than the command-line surface (dataset, model,
//! loss, epochs) are hard-coded per dataset/model combination here.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Synthetic dataset selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum DataName {
    /// Gaussian process with an exponentiated-quadratic kernel
    Eq,
    /// Gaussian process with a Matern-5/2 kernel
    Matern,
    /// Gaussian process with a weakly periodic kernel
    WeaklyPeriodic,
    /// Random sawtooth waves
    Sawtooth,
    /// Uniform mixture of the above
    Mixture,
}

impl DataName {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataName::Eq => "eq",
            DataName::Matern => "matern",
            DataName::WeaklyPeriodic => "weakly-periodic",
            DataName::Sawtooth => "sawtooth",
            DataName::Mixture => "mixture",
        }
    }
}

/// Model selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ModelName {
    /// Convolutional conditional neural process (deterministic)
    Convcnp,
    /// Convolutional latent neural process
    Convnp,
    /// Attentive neural process
    Anp,
    /// Neural process
    Np,
}

impl ModelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelName::Convcnp => "convcnp",
            ModelName::Convnp => "convnp",
            ModelName::Anp => "anp",
            ModelName::Np => "np",
        }
    }

    /// Whether the model carries a latent variable.
    pub fn has_latent(&self) -> bool {
        !matches!(self, ModelName::Convcnp)
    }
}

/// Training objective selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum LossName {
    /// Monte-Carlo log-likelihood (samples from the prior)
    Loglik,
    /// Importance-weighted log-likelihood (samples from a posterior proposal)
    LoglikIw,
    /// Evidence lower bound
    Elbo,
}

impl LossName {
    pub fn as_str(&self) -> &'static str {
        match self {
            LossName::Loglik => "loglik",
            LossName::LoglikIw => "loglik-iw",
            LossName::Elbo => "elbo",
        }
    }

    /// Whether the objective needs a latent variable in the model.
    pub fn needs_latent(&self) -> bool {
        !matches!(self, LossName::Loglik)
    }
}

/// Task generation settings for one regime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Input location range (inclusive bounds)
    pub x_range: (f64, f64),
    /// Context count range (inclusive)
    pub num_context: (usize, usize),
    /// Target count range (inclusive)
    pub num_target: (usize, usize),
    /// Tasks per batch
    pub batch_size: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            x_range: (-2.0, 2.0),
            num_context: (3, 50),
            num_target: (50, 50),
            batch_size: 16,
        }
    }
}

/// Held-out evaluation regime: a named generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalRegime {
    pub name: String,
    pub generator: GeneratorConfig,
}

/// Model architecture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Input dimensionality
    pub dim_x: usize,
    /// Output dimensionality
    pub dim_y: usize,
    /// Deterministic representation width (also the attention model width)
    pub dim_r: usize,
    /// Latent variable width (global for np/anp, per grid point for convnp)
    pub dim_z: usize,
    /// Hidden width of the MLPs
    pub hidden: usize,
    /// Hidden layer count of the MLPs
    pub num_layers: usize,
    /// Attention heads (anp only)
    pub num_heads: usize,
    /// Grid resolution in points per unit (conv models only)
    pub points_per_unit: f64,
    /// Grid margin beyond the data range (conv models only)
    pub grid_margin: f64,
    /// CNN channel width (conv models only)
    pub cnn_channels: usize,
    /// CNN depth (conv models only)
    pub cnn_layers: usize,
    /// CNN kernel size, must be odd (conv models only)
    pub kernel_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dim_x: 1,
            dim_y: 1,
            dim_r: 128,
            dim_z: 64,
            hidden: 128,
            num_layers: 3,
            num_heads: 8,
            points_per_unit: 32.0,
            grid_margin: 0.1,
            cnn_channels: 32,
            cnn_layers: 4,
            kernel_size: 5,
        }
    }
}

/// Training loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub batches_per_epoch: usize,
    /// Held-out batches for the per-epoch evaluation pass
    pub eval_batches: usize,
    /// Held-out batches for the final per-regime evaluation (about 10k tasks
    /// at the default batch size)
    pub final_eval_batches: usize,
    pub learning_rate: f64,
    /// Monte-Carlo samples of the latent variable per loss evaluation
    pub num_samples: usize,
    /// Clamp the decoder noise to this value for the first `fix_noise_epochs`
    pub fixed_noise: f64,
    pub fix_noise_epochs: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 100,
            batches_per_epoch: 256,
            eval_batches: 64,
            final_eval_batches: 640,
            learning_rate: 3e-4,
            num_samples: 16,
            fixed_noise: 1e-2,
            fix_noise_epochs: 3,
        }
    }
}

/// Full experiment configuration for one (data, model, loss) triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub data: DataName,
    pub model: ModelName,
    pub loss: LossName,
    pub generator: GeneratorConfig,
    pub model_cfg: ModelConfig,
    pub training: TrainingConfig,
}

impl ExperimentConfig {
    /// Build the hard-coded configuration for a (data, model, loss) triple.
    ///
    /// Incompatible combinations are fatal configuration errors.
    pub fn build(data: DataName, model: ModelName, loss: LossName) -> Result<Self, ConfigError> {
        if loss.needs_latent() && !model.has_latent() {
            return Err(ConfigError::IncompatibleLoss {
                model: model.as_str().to_string(),
                loss: loss.as_str().to_string(),
            });
        }

        let mut generator = GeneratorConfig::default();
        // Sawtooth tasks carry more structure per unit length, so both set
        // sizes are drawn from larger ranges.
        if matches!(data, DataName::Sawtooth | DataName::Mixture) {
            generator.num_context = (3, 100);
            generator.num_target = (100, 100);
        }

        let mut model_cfg = ModelConfig::default();
        if matches!(model, ModelName::Np | ModelName::Anp) {
            model_cfg.dim_r = 128;
            model_cfg.hidden = 128;
        }

        let mut training = TrainingConfig::default();
        if !model.has_latent() {
            training.num_samples = 1;
        }

        if model_cfg.kernel_size % 2 == 0 {
            return Err(ConfigError::InvalidHyperparameter(format!(
                "kernel_size must be odd, got {}",
                model_cfg.kernel_size
            )));
        }
        if model_cfg.dim_r % model_cfg.num_heads != 0 {
            return Err(ConfigError::InvalidHyperparameter(format!(
                "dim_r ({}) must be divisible by num_heads ({})",
                model_cfg.dim_r, model_cfg.num_heads
            )));
        }

        Ok(Self {
            data,
            model,
            loss,
            generator,
            model_cfg,
            training,
        })
    }

    /// Identifier used for checkpoint and output paths.
    pub fn key(&self) -> String {
        format!(
            "{}_{}_{}",
            self.model.as_str(),
            self.loss.as_str(),
            self.data.as_str()
        )
    }

    /// Held-out evaluation regimes.
    ///
    /// `interpolation` matches the training range. `interpolation-beyond`
    /// draws both context and target locations from a shifted range of the
    /// same width that the model never saw during training.
    /// `extrapolation-half-context` additionally halves both set-size ranges.
    pub fn eval_regimes(&self) -> Vec<EvalRegime> {
        let train = self.generator.clone();
        let beyond = GeneratorConfig {
            x_range: (2.0, 6.0),
            ..train.clone()
        };
        let half = GeneratorConfig {
            x_range: (2.0, 6.0),
            num_context: (train.num_context.0 / 2, (train.num_context.1 / 2).max(1)),
            num_target: ((train.num_target.0 / 2).max(1), (train.num_target.1 / 2).max(1)),
            ..train.clone()
        };
        vec![
            EvalRegime {
                name: "interpolation".to_string(),
                generator: train,
            },
            EvalRegime {
                name: "interpolation-beyond".to_string(),
                generator: beyond,
            },
            EvalRegime {
                name: "extrapolation-half-context".to_string(),
                generator: half,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convcnp_rejects_latent_losses() {
        assert!(ExperimentConfig::build(DataName::Eq, ModelName::Convcnp, LossName::Elbo).is_err());
        assert!(
            ExperimentConfig::build(DataName::Eq, ModelName::Convcnp, LossName::LoglikIw).is_err()
        );
        assert!(
            ExperimentConfig::build(DataName::Eq, ModelName::Convcnp, LossName::Loglik).is_ok()
        );
    }

    #[test]
    fn test_all_latent_combinations_build() {
        for model in [ModelName::Convnp, ModelName::Anp, ModelName::Np] {
            for loss in [LossName::Loglik, LossName::LoglikIw, LossName::Elbo] {
                assert!(ExperimentConfig::build(DataName::Eq, model, loss).is_ok());
            }
        }
    }

    #[test]
    fn test_eval_regimes() {
        let cfg = ExperimentConfig::build(DataName::Eq, ModelName::Np, LossName::Loglik).unwrap();
        let regimes = cfg.eval_regimes();
        assert_eq!(regimes.len(), 3);
        assert_eq!(regimes[0].generator.x_range, (-2.0, 2.0));
        assert_eq!(regimes[1].generator.x_range, (2.0, 6.0));
        assert!(regimes[2].generator.num_context.1 <= cfg.generator.num_context.1 / 2);
    }

    #[test]
    fn test_key() {
        let cfg =
            ExperimentConfig::build(DataName::Sawtooth, ModelName::Convnp, LossName::Elbo).unwrap();
        assert_eq!(cfg.key(), "convnp_elbo_sawtooth");
    }
}
