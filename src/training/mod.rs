//! Objectives, the training loop, evaluation, checkpointing and plots.

pub mod checkpoint;
pub mod evaluate;
pub mod loss;
pub mod plot;
pub mod trainer;

pub use checkpoint::{Checkpoint, CheckpointStore, EpochRecord};
pub use evaluate::{evaluate, EvalResult};
pub use loss::{compute_loss, LossSettings};
pub use trainer::Trainer;
