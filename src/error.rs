//! Error types for configuration and checkpoint handling.

use thiserror::Error;

/// Fatal configuration errors, raised at startup before any training happens.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("loss `{loss}` requires a latent variable, but model `{model}` has none")]
    IncompatibleLoss { model: String, loss: String },

    #[error("invalid hyperparameter: {0}")]
    InvalidHyperparameter(String),
}
