//! # Equation Discovery Training CLI
//!
//! Command-line interface for the discovery training loop.
//!
//! ## Usage
//!
//! ```bash
//! # Fit exponential decay and recover du/dt = -u
//! discover_train --problem decay --decay-rates 1.0 --max-iterations 5000
//!
//! # Advected wave on a (t, x) grid with spatial derivative terms
//! discover_train --problem advection --deriv-order 2 --poly-order 2
//!
//! # Function approximation only, no physics term
//! discover_train --problem decay --only-fitting
//! ```

use candle_core::Device;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use pde_discovery::config::{ConvergenceConfig, TrainConfig};
use pde_discovery::convergence::L1Plateau;
use pde_discovery::data::FieldDataset;
use pde_discovery::library::LibrarySpec;
use pde_discovery::model::{DiscoveryModel, ModelConfig, Regressor};
use pde_discovery::sparsity::{PeriodicSchedule, SparsityPolicy, TrainTestSchedule};
use pde_discovery::trainer::Trainer;

/// Built-in synthetic problems.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Problem {
    /// Exponential decay, du/dt = -rate * u
    Decay,
    /// Damped advected wave on a (t, x) grid
    Advection,
}

/// Sparsity update schedules.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum Schedule {
    /// Fixed cadence after a burn-in
    Periodic,
    /// Validation-plateau with best-weight restore
    TrainTest,
}

/// Joint function approximation and sparse equation discovery
#[derive(Parser, Debug)]
#[command(name = "discover_train")]
#[command(about = "Train a neural network while discovering the governing equation")]
#[command(version)]
struct Args {
    /// Synthetic problem to train on
    #[arg(long, value_enum, default_value = "decay")]
    problem: Problem,

    /// Number of samples (decay) or time steps (advection)
    #[arg(long, default_value = "2000")]
    n_samples: usize,

    /// Spatial grid points (advection only)
    #[arg(long, default_value = "50")]
    nx: usize,

    /// Decay rates, one feature per rate (decay only)
    #[arg(long, value_delimiter = ',', default_value = "1.0")]
    decay_rates: Vec<f64>,

    /// Advection speed (advection only)
    #[arg(long, default_value = "1.0")]
    speed: f64,

    /// Damping coefficient (advection only)
    #[arg(long, default_value = "0.1")]
    damping: f64,

    /// Noise amplitude added to the synthetic targets
    #[arg(long, default_value = "0.01")]
    noise: f64,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Train fraction of the data
    #[arg(long, default_value = "0.8")]
    split: f64,

    /// Batch size
    #[arg(short, long, default_value = "256")]
    batch_size: usize,

    /// Hidden layer widths
    #[arg(long, value_delimiter = ',', default_value = "32,32")]
    hidden: Vec<usize>,

    /// Polynomial order of the candidate library
    #[arg(long, default_value = "2")]
    poly_order: usize,

    /// Spatial derivative order of the candidate library
    #[arg(long, default_value = "0")]
    deriv_order: usize,

    /// Magnitude threshold of the sparse estimator
    #[arg(long, default_value = "0.1")]
    threshold: f64,

    /// Learning rate
    #[arg(long, default_value = "1e-3")]
    learning_rate: f64,

    /// Maximum training iterations
    #[arg(long, default_value = "10000")]
    max_iterations: usize,

    /// Validation / logging cadence, in iterations
    #[arg(long, default_value = "25")]
    write_iterations: usize,

    /// Disable sparsity mask updates
    #[arg(long)]
    no_sparsity_update: bool,

    /// Train the function approximator only
    #[arg(long)]
    only_fitting: bool,

    /// Sparsity update schedule
    #[arg(long, value_enum, default_value = "train-test")]
    schedule: Schedule,

    /// Burn-in iterations before periodic updates
    #[arg(long, default_value = "1000")]
    burn_in: usize,

    /// Update period of the periodic schedule, in iterations
    #[arg(long, default_value = "500")]
    period: usize,

    /// Patience of the train-test schedule, in iterations
    #[arg(long, default_value = "200")]
    schedule_patience: usize,

    /// Improvement threshold of the train-test schedule
    #[arg(long, default_value = "1e-5")]
    schedule_delta: f64,

    /// Convergence patience, in iterations
    #[arg(long, default_value = "200")]
    patience: usize,

    /// Convergence threshold on the monitored L1 norm
    #[arg(long, default_value = "1e-5")]
    delta: f64,

    /// Run identifier; names the log directory
    #[arg(long)]
    run_id: Option<String>,

    /// Base directory for logs and checkpoints
    #[arg(long, default_value = "runs")]
    output_dir: PathBuf,

    /// Use CUDA if available
    #[arg(long)]
    cuda: bool,
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    log::info!("Equation Discovery Training");
    log::info!("===========================");

    let device = if args.cuda {
        Device::cuda_if_available(0)?
    } else {
        Device::Cpu
    };
    log::info!("Using device: {:?}", device);

    let dataset = match args.problem {
        Problem::Decay => FieldDataset::synthetic_decay(
            args.n_samples,
            &args.decay_rates,
            args.noise,
            args.seed,
        ),
        Problem::Advection => FieldDataset::synthetic_advection(
            args.n_samples / args.nx.max(1),
            args.nx,
            args.speed,
            args.damping,
            args.noise,
            args.seed,
        ),
    };
    log::info!(
        "Dataset: {} samples, {} coordinate dims, {} features",
        dataset.len(),
        dataset.n_dims(),
        dataset.n_features()
    );

    let (train_set, test_set) = dataset.train_test_split(args.split);
    let mut train = train_set.loader(args.batch_size, device.clone());
    let mut test = test_set.loader(args.batch_size, device.clone());

    let model_config = ModelConfig {
        n_dims: dataset.n_dims(),
        n_features: dataset.n_features(),
        hidden: args.hidden.clone(),
        library: LibrarySpec::new(args.poly_order, args.deriv_order),
        threshold: args.threshold,
        ..ModelConfig::default()
    };
    let library = model_config.library;
    let model = DiscoveryModel::new(model_config, &device)?;
    log::info!(
        "Library: {} candidate terms: {:?}",
        library.width(),
        library.term_names()
    );

    let optimizer = AdamW::new(
        model.trainable_vars(),
        ParamsAdamW {
            lr: args.learning_rate,
            ..ParamsAdamW::default()
        },
    )?;

    let sparsity: Box<dyn SparsityPolicy> = match args.schedule {
        Schedule::Periodic => Box::new(PeriodicSchedule::new(args.burn_in, args.period)),
        Schedule::TrainTest => Box::new(TrainTestSchedule::new(
            args.schedule_patience,
            args.schedule_delta,
        )),
    };
    let convergence = L1Plateau::new(args.patience, args.delta);

    let config = TrainConfig {
        split: args.split,
        run_id: args.run_id.clone(),
        output_dir: Some(args.output_dir.clone()),
        max_iterations: args.max_iterations,
        write_iterations: args.write_iterations,
        sparsity_update: !args.no_sparsity_update,
        only_fitting: args.only_fitting,
        convergence: ConvergenceConfig {
            patience: args.patience,
            delta: args.delta,
        },
    };

    let mut trainer = Trainer::new(model, optimizer, sparsity, convergence, config)?;
    let report = trainer.run(&mut train, &mut test)?;

    log::info!(
        "Finished after {} iterations ({})",
        report.iterations_run,
        if report.converged {
            "converged"
        } else {
            "iteration budget exhausted"
        }
    );
    if let Some(summary) = &report.final_summary {
        log::info!("Final mean loss: {:.6e}", summary.mean_total());
    }

    let model = trainer.model();
    let names = library.term_names();
    for (f, coeffs) in model.constraint_coeffs(false, true).iter().enumerate() {
        let terms: Vec<String> = coeffs
            .iter()
            .zip(names.iter())
            .filter(|(c, _)| c.abs() > 0.0)
            .map(|(c, name)| format!("{:+.4} {}", c, name))
            .collect();
        log::info!("d(u_{})/dt = {}", f + 1, terms.join(" "));
    }
    log::info!("Logs: {:?}", report.log_dir);

    Ok(())
}
