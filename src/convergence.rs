//! # Convergence Monitoring
//!
//! The training loop monitors the L1 norm of the scaled coefficient
//! vectors at every checkpoint and stops once the norm has stopped moving.
//! The policy behind that decision is swappable; [`L1Plateau`] is the
//! default patience-based implementation.

use crate::error::DiscoveryError;
use crate::DiscoveryResult;

/// Termination policy consulted once per checkpoint with the monitored
/// statistic. Returning true terminates the run immediately.
pub trait ConvergencePolicy {
    fn converged(&mut self, iteration: usize, statistic: f64) -> DiscoveryResult<bool>;
}

/// Plateau detector: converged once the statistic has moved by less than
/// `delta` between consecutive checkpoints for `patience` iterations.
#[derive(Debug)]
pub struct L1Plateau {
    patience: usize,
    delta: f64,
    /// (iteration, statistic) record, appended at every call.
    history: Vec<(usize, f64)>,
    /// Iteration at which the current plateau started.
    stall_start: Option<usize>,
}

impl L1Plateau {
    pub fn new(patience: usize, delta: f64) -> Self {
        Self {
            patience,
            delta,
            history: Vec::new(),
            stall_start: None,
        }
    }

    /// Monitored history so far.
    pub fn history(&self) -> &[(usize, f64)] {
        &self.history
    }
}

impl ConvergencePolicy for L1Plateau {
    fn converged(&mut self, iteration: usize, statistic: f64) -> DiscoveryResult<bool> {
        if let Some(&(last_iteration, last_value)) = self.history.last() {
            if iteration <= last_iteration {
                return Err(DiscoveryError::Contract(format!(
                    "convergence monitor called with non-increasing iteration {} after {}",
                    iteration, last_iteration
                )));
            }
            if (statistic - last_value).abs() < self.delta {
                let start = *self.stall_start.get_or_insert(last_iteration);
                if iteration - start >= self.patience {
                    self.history.push((iteration, statistic));
                    return Ok(true);
                }
            } else {
                self.stall_start = None;
            }
        }
        self.history.push((iteration, statistic));
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_convergence_while_moving() {
        let mut monitor = L1Plateau::new(50, 1e-3);
        for i in 0..10 {
            let iteration = i * 25;
            let statistic = 10.0 - i as f64;
            assert!(!monitor.converged(iteration, statistic).unwrap());
        }
    }

    #[test]
    fn test_converges_on_plateau() {
        let mut monitor = L1Plateau::new(50, 1e-3);
        let mut converged = false;
        for i in 0..10 {
            if monitor.converged(i * 25, 1.0).unwrap() {
                converged = true;
                break;
            }
        }
        assert!(converged);
    }

    #[test]
    fn test_plateau_resets_on_movement() {
        let mut monitor = L1Plateau::new(100, 1e-3);
        assert!(!monitor.converged(0, 1.0).unwrap());
        assert!(!monitor.converged(50, 1.0).unwrap());
        // Movement resets the stall window.
        assert!(!monitor.converged(100, 2.0).unwrap());
        assert!(!monitor.converged(150, 2.0).unwrap());
        assert!(!monitor.converged(175, 2.0).unwrap());
        // Plateau since 100, patience met at 200.
        assert!(monitor.converged(200, 2.0).unwrap());
    }

    #[test]
    fn test_non_increasing_iteration_rejected() {
        let mut monitor = L1Plateau::new(50, 1e-3);
        monitor.converged(10, 1.0).unwrap();
        assert!(monitor.converged(10, 1.0).is_err());
        assert!(monitor.converged(5, 1.0).is_err());
    }

    #[test]
    fn test_history_grows_monotonically() {
        let mut monitor = L1Plateau::new(1000, 1e-9);
        for i in 0..5 {
            let _ = monitor.converged(i * 25, i as f64).unwrap();
        }
        let history = monitor.history();
        assert_eq!(history.len(), 5);
        assert!(history.windows(2).all(|w| w[0].0 < w[1].0));
    }
}
