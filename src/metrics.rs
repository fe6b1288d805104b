//! # Training Metrics and Logging
//!
//! Tensorboard-compatible logging of checkpoint data: epoch losses,
//! held-out MSE, and the constraint / estimator coefficient vectors.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pde_discovery::metrics::MetricsLogger;
//!
//! let mut logger = MetricsLogger::new(None, Some("burgers"))?;
//! logger.log_scalar("loss/total", 1.5, 100)?;
//! logger.close()?;
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use tensorboard_rs::summary_writer::SummaryWriter;

use crate::DiscoveryResult;

/// Metrics logger with Tensorboard support
pub struct MetricsLogger {
    /// Tensorboard summary writer (None if disabled)
    writer: Option<SummaryWriter>,
    /// Run directory for this training run
    log_dir: PathBuf,
    /// Whether logging is enabled
    enabled: bool,
}

impl MetricsLogger {
    /// Create a new metrics logger.
    ///
    /// The run directory is `<output_dir>/<run_id>`, defaulting to a
    /// timestamped name under `runs/` when either part is absent.
    pub fn new(output_dir: Option<&Path>, run_id: Option<&str>) -> DiscoveryResult<Self> {
        let base = output_dir.unwrap_or_else(|| Path::new("runs"));
        let name = match run_id {
            Some(id) => id.to_string(),
            None => format!("run_{}", chrono::Local::now().format("%Y%m%d-%H%M%S")),
        };
        let run_dir = base.join(name);
        fs::create_dir_all(&run_dir)?;

        let writer = SummaryWriter::new(&run_dir);

        log::info!("Tensorboard logs: {:?}", run_dir);
        log::info!("View with: tensorboard --logdir {:?}", base);

        Ok(Self {
            writer: Some(writer),
            log_dir: run_dir,
            enabled: true,
        })
    }

    /// Create a disabled logger (for when logging is not wanted)
    pub fn disabled() -> Self {
        Self {
            writer: None,
            log_dir: PathBuf::new(),
            enabled: false,
        }
    }

    /// Log a scalar value
    pub fn log_scalar(&mut self, tag: &str, value: f64, step: usize) -> DiscoveryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.add_scalar(tag, value as f32, step);
        }
        Ok(())
    }

    /// Log an F-length vector as one scalar per feature.
    pub fn log_vector(&mut self, prefix: &str, values: &[f64], step: usize) -> DiscoveryResult<()> {
        for (i, &value) in values.iter().enumerate() {
            self.log_scalar(&format!("{}/output_{}", prefix, i), value, step)?;
        }
        Ok(())
    }

    /// Log per-feature coefficient vectors, one scalar per entry.
    pub fn log_coeff_vectors(
        &mut self,
        prefix: &str,
        coeffs: &[Vec<f64>],
        step: usize,
    ) -> DiscoveryResult<()> {
        for (f, vector) in coeffs.iter().enumerate() {
            for (j, &value) in vector.iter().enumerate() {
                self.log_scalar(&format!("{}/output_{}/term_{}", prefix, f, j), value, step)?;
            }
        }
        Ok(())
    }

    /// Log one full validation checkpoint.
    #[allow(clippy::too_many_arguments)]
    pub fn log_checkpoint(
        &mut self,
        iteration: usize,
        mean_total: f64,
        mse: &[f64],
        regularization: &[f64],
        coeffs_scaled: &[Vec<f64>],
        coeffs_unscaled: &[Vec<f64>],
        estimator_coeffs: &[Vec<f64>],
        test_mse: &[f64],
    ) -> DiscoveryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.log_scalar("loss/total", mean_total, iteration)?;
        self.log_vector("loss/mse", mse, iteration)?;
        self.log_vector("loss/regularization", regularization, iteration)?;
        self.log_vector("test/mse", test_mse, iteration)?;
        self.log_coeff_vectors("coeffs/scaled", coeffs_scaled, iteration)?;
        self.log_coeff_vectors("coeffs/unscaled", coeffs_unscaled, iteration)?;
        self.log_coeff_vectors("coeffs/estimator", estimator_coeffs, iteration)?;
        self.flush()
    }

    /// Flush the writer
    pub fn flush(&mut self) -> DiscoveryResult<()> {
        if !self.enabled {
            return Ok(());
        }
        if let Some(ref mut writer) = self.writer {
            writer.flush();
        }
        Ok(())
    }

    /// Flush and finish the run.
    pub fn close(&mut self) -> DiscoveryResult<()> {
        self.flush()
    }

    /// Get the run directory
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Check if logging is enabled
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl Drop for MetricsLogger {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.flush();
        }
    }
}
