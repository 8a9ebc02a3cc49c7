//! Checkpoint persistence.
//!
//! One directory per experiment key, holding a `latest` checkpoint written
//! every epoch and a `best` checkpoint written whenever held-out evaluation
//! improves. Checkpoints are JSON: a flat parameter vector plus the training
//! history.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// One epoch's summary in the training history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub eval_loss: f64,
    pub eval_error: f64,
}

/// A saved model state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last completed epoch (1-based).
    pub epoch: usize,
    /// Best held-out loss seen so far.
    pub best_eval: f64,
    pub parameters: Vec<f64>,
    pub history: Vec<EpochRecord>,
}

/// Filesystem layout for one experiment's checkpoints and outputs.
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: &Path, key: &str) -> Result<Self> {
        let dir = root.join(key);
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating checkpoint directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("model-{}.json", name))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    pub fn save(&self, name: &str, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.path(name);
        let file = File::create(&path)
            .with_context(|| format!("creating checkpoint {}", path.display()))?;
        serde_json::to_writer(BufWriter::new(file), checkpoint)
            .with_context(|| format!("writing checkpoint {}", path.display()))?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<Checkpoint> {
        let path = self.path(name);
        let file = File::open(&path)
            .with_context(|| format!("opening checkpoint {}", path.display()))?;
        let checkpoint = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing checkpoint {}", path.display()))?;
        Ok(checkpoint)
    }
}
