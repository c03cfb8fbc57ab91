use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use nystrom_krr::data::{load_prediction_data, load_training_data, write_predictions};
use nystrom_krr::estimate::{FitSession, fit_with_session};
use nystrom_krr::hooks::{EvaluationHook, rmse};
use nystrom_krr::progress::{FitProgressObserver, FitProgressStage};
use nystrom_krr::solver::IterationRecord;
use nystrom_krr::{KernelSpec, KrrConfig, ModelArtifact, Precision};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(
    name = "krr",
    about = "Fit and apply Nystrom kernel ridge regression models",
    long_about = "Fits kernel ridge regression on a subset of landmark points with a \
                 preconditioned conjugate-gradient solver, and applies saved models to new data."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum KernelArg {
    Gaussian,
    Laplacian,
}

#[derive(Subcommand)]
enum Commands {
    /// Fit a model from a CSV/TSV table
    #[command(about = "Fit a model (outputs: model.toml)")]
    Train {
        /// Training table with a header row
        training_data: PathBuf,

        /// Response columns; every other column except sample_id is a feature
        #[arg(long, value_delimiter = ',', default_value = "target")]
        targets: Vec<String>,

        /// TOML configuration file; overrides the kernel and solver flags below
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "gaussian")]
        kernel: KernelArg,

        /// Kernel bandwidth
        #[arg(long, default_value = "5.0")]
        sigma: f64,

        /// Regularization strength
        #[arg(long, default_value = "1e-5")]
        penalty: f64,

        /// Number of landmarks; defaults to every training point
        #[arg(long)]
        centers: Option<usize>,

        #[arg(long, default_value = "20")]
        maxiter: usize,

        #[arg(long, default_value = "0")]
        seed: u64,

        /// Evaluate kernels in single precision
        #[arg(long)]
        single: bool,

        /// Held-out table evaluated with RMSE during the solve
        #[arg(long)]
        validation: Option<PathBuf>,

        /// Where to write the fitted model
        #[arg(long, default_value = "model.toml")]
        output: PathBuf,
    },

    /// Apply a saved model to new data
    #[command(about = "Apply a trained model (outputs: predictions.csv)")]
    Infer {
        /// Table with the model's feature columns
        test_data: PathBuf,

        /// Path to the fitted model (.toml)
        #[arg(long)]
        model: PathBuf,

        #[arg(long, default_value = "predictions.csv")]
        output: PathBuf,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train {
            training_data,
            targets,
            config,
            kernel,
            sigma,
            penalty,
            centers,
            maxiter,
            seed,
            single,
            validation,
            output,
        } => {
            let args = TrainArgs {
                training_data,
                targets,
                config,
                kernel,
                sigma,
                penalty,
                centers,
                maxiter,
                seed,
                single,
                validation,
                output,
            };
            train_command(args)
        }
        Commands::Infer {
            test_data,
            model,
            output,
        } => infer_command(&test_data, &model, &output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

struct TrainArgs {
    training_data: PathBuf,
    targets: Vec<String>,
    config: Option<PathBuf>,
    kernel: KernelArg,
    sigma: f64,
    penalty: f64,
    centers: Option<usize>,
    maxiter: usize,
    seed: u64,
    single: bool,
    validation: Option<PathBuf>,
    output: PathBuf,
}

/// Progress bar over the solver iterations.
struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(0), draw_target);
        let style = ProgressStyle::with_template(
            "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar());
        bar.set_style(style);
        Self { bar }
    }
}

impl FitProgressObserver for BarProgress {
    fn on_stage_start(&mut self, stage: FitProgressStage, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(0);
        self.bar.set_message(stage.to_string());
    }

    fn on_iteration(&mut self, record: &IterationRecord) {
        self.bar.set_position(record.iteration as u64);
        self.bar
            .set_message(format!("residual {:.3e}", record.residual_norm));
    }

    fn on_stage_finish(&mut self, stage: FitProgressStage) {
        if stage == FitProgressStage::ConjugateGradient {
            self.bar.finish_and_clear();
        }
    }
}

fn train_command(args: TrainArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading training data from: {}", args.training_data.display());
    let data = load_training_data(&args.training_data, &args.targets)?;
    println!(
        "Loaded {} samples with {} features and {} targets",
        data.x.nrows(),
        data.x.ncols(),
        data.y.ncols()
    );

    let config = match &args.config {
        Some(path) => KrrConfig::load(path)?,
        None => {
            let kernel = match args.kernel {
                KernelArg::Gaussian => KernelSpec::Gaussian { sigma: args.sigma },
                KernelArg::Laplacian => KernelSpec::Laplacian { sigma: args.sigma },
            };
            let precision = if args.single {
                Precision::Single
            } else {
                Precision::Double
            };
            KrrConfig::new(kernel, args.penalty, args.centers.unwrap_or(data.x.nrows()))?
                .with_maxiter(args.maxiter)
                .with_seed(args.seed)
                .with_precision(precision)
        }
    };

    let mut session = FitSession::detect().with_progress(Box::new(BarProgress::new()));
    if let Some(path) = &args.validation {
        let held_out = load_training_data(path, &args.targets)?;
        session = session.with_evaluation(EvaluationHook::rmse(held_out.x, held_out.y));
    }

    let outcome = fit_with_session(data.x.view(), data.y.view(), &config, &mut session)?;
    println!(
        "Solver finished with status {:?} after {} iterations (preconditioner {:?}, {:.2?} total solve time)",
        outcome.report.status,
        outcome.report.iterations,
        outcome.preconditioner_residency,
        outcome.timings.solver
    );

    let mut model = outcome.model;
    model.feature_names = data.feature_names;
    model.target_names = data.target_names;

    let fitted = model.predict(data.x.view())?;
    println!("Training RMSE: {:.6}", rmse(data.y.view(), fitted.view()));

    model.save(&args.output)?;
    println!("Model saved to: {}", args.output.display());
    Ok(())
}

fn infer_command(
    test_data: &PathBuf,
    model_path: &PathBuf,
    output: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", model_path.display());
    let model = ModelArtifact::load(model_path)?;
    println!(
        "Model has {} centers, {} features and {} targets",
        model.num_centers(),
        model.num_features(),
        model.num_targets()
    );

    let data = load_prediction_data(test_data, &model.feature_names)?;
    let predictions = model.predict(data.x.view())?;
    write_predictions(output, &data.sample_ids, predictions.view(), &model.target_names)?;
    println!(
        "Wrote {} predictions to: {}",
        predictions.nrows(),
        output.display()
    );
    Ok(())
}
