//! Meta-learning for 1-D regression with neural processes.
//!
//! Models are trained on synthetic tasks drawn from Gaussian processes,
//! sawtooth waves and mixtures thereof: each task is a context set to
//! condition on and a target set to predict, and the models learn to map
//! context sets directly to predictive distributions. Four architectures
//! (convolutional conditional, convolutional latent, attentive and vanilla
//! neural processes) train against three objectives (Monte-Carlo
//! log-likelihood, its importance-weighted variant, and the ELBO).
//!
//! All gradients are computed by hand-written backward passes over
//! `ndarray` buffers; see [`nn`] for the layer library and [`training`] for
//! the objectives and the loop.

pub mod config;
pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod nn;
pub mod training;

pub use config::{DataName, ExperimentConfig, LossName, ModelName};
pub use model::NeuralProcess;
pub use training::Trainer;
