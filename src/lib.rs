//! # PDE Discovery
//!
//! Joint neural function approximation and sparse discovery of governing
//! equations, driven by an iterative training controller.
//!
//! A neural network fits observed field data; alongside the fit, a library
//! of candidate terms (polynomials of the output and its spatial
//! derivatives) is regressed against the time derivative, and a physics
//! regularization term pulls the network toward solutions consistent with
//! the currently active candidate terms. A scheduled estimator periodically
//! prunes the library down to a sparse mask, and the run terminates once
//! the masked coefficient vector stops moving.
//!
//! ## Features
//! - MLP function approximator with automatic differentiation via candle
//! - Polynomial-derivative candidate libraries of configurable order
//! - Alternating train / sparsify loop with swappable update schedules
//! - L1-plateau convergence monitoring
//! - Tensorboard logging and end-of-run CSV export
//!
//! ## Training loop
//!
//! ```text
//! RUNNING ──(every write_iterations)──► VALIDATING
//!    ▲                                      │
//!    │                                      ▼
//!    │                              SPARSITY_DECIDING
//!    │                                      │
//!    └───────────── CONVERGENCE_CHECKING ◄──┘
//!                           │
//!                           ▼
//!                      TERMINATED
//! ```

// Core modules
pub mod config;
pub mod convergence;
pub mod data;
pub mod error;
pub mod library;
pub mod loss;
pub mod model;
pub mod sparsity;

// Training infrastructure
pub mod export;
pub mod metrics;
pub mod trainer;


// Re-exports from core modules
pub use config::{ConvergenceConfig, TrainConfig};
pub use convergence::{ConvergencePolicy, L1Plateau};
pub use data::{BatchLoader, FieldBatch, FieldDataset};
pub use error::DiscoveryError;
pub use library::LibrarySpec;
pub use loss::{BatchLossRecord, EpochSummary, LossComponents, LossComposer};
pub use model::{DiscoveryModel, ModelConfig, Regressor, RegressorOutput};
pub use sparsity::{PeriodicSchedule, SparsityPolicy, TrainTestSchedule};

// Re-exports from training infrastructure
pub use metrics::MetricsLogger;
pub use trainer::{TrainReport, Trainer};

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        BatchLoader,
        ConvergenceConfig,
        DiscoveryError,
        DiscoveryModel,
        DiscoveryResult,
        FieldDataset,
        L1Plateau,
        LibrarySpec,
        MetricsLogger,
        ModelConfig,
        PeriodicSchedule,
        Regressor,
        TrainConfig,
        TrainReport,
        TrainTestSchedule,
        Trainer,
    };
}
