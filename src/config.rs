//! # Run Configuration
//!
//! Options controlling a single discovery training run: data split,
//! iteration budget, validation cadence, and the sparsity / fitting-only
//! toggles. Convergence options are grouped in [`ConvergenceConfig`] and
//! forwarded unchanged to the convergence monitor.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options forwarded to the convergence monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceConfig {
    /// Number of iterations the monitored statistic may plateau before
    /// training is considered converged.
    pub patience: usize,
    /// Minimum change in the monitored statistic that counts as progress.
    pub delta: f64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            patience: 200,
            delta: 1e-5,
        }
    }
}

/// Complete training run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    /// Fraction of the data used for training (remainder is held out).
    pub split: f64,
    /// Optional run identifier; used to name the log directory.
    pub run_id: Option<String>,
    /// Base directory for logs and checkpoints.
    pub output_dir: Option<PathBuf>,
    /// Upper bound on training iterations.
    pub max_iterations: usize,
    /// Validation / logging / sparsity / convergence cadence, in iterations.
    pub write_iterations: usize,
    /// Whether sparsity masks may be updated during the run.
    pub sparsity_update: bool,
    /// Train the function approximator only, without the
    /// physics-consistency term.
    pub only_fitting: bool,
    /// Convergence monitor options (opaque to the training loop).
    pub convergence: ConvergenceConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            split: 0.8,
            run_id: None,
            output_dir: None,
            max_iterations: 10_000,
            write_iterations: 25,
            sparsity_update: true,
            only_fitting: false,
            convergence: ConvergenceConfig::default(),
        }
    }
}

impl TrainConfig {
    /// Configuration for quick experiments and tests
    pub fn quick() -> Self {
        Self {
            max_iterations: 100,
            write_iterations: 10,
            convergence: ConvergenceConfig {
                patience: 50,
                delta: 1e-4,
            },
            ..Self::default()
        }
    }

    /// Validate settings that can be checked before training starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.write_iterations == 0 {
            return Err("write_iterations must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.split) {
            return Err(format!("split must be in [0, 1], got {}", self.split));
        }
        Ok(())
    }
}
