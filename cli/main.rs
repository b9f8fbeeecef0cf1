#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use histosurv::config::TrainingConfig;
use histosurv::data::BinBoundaries;
use histosurv::metrics::{MetricInputs, MetricSummary, calculate_metrics};
use histosurv::progress::{FoldStage, fold_end_line};
use histosurv::tables::{load_predictions, load_reference};

#[derive(Args)]
pub struct EvaluateArgs {
    /// Path to predictions TSV with event_time, censorship, risk and surv_* columns
    pub predictions: PathBuf,

    /// Path to reference TSV with event_time and censorship columns; defines the censoring distribution
    #[arg(long)]
    pub reference: PathBuf,

    /// Comma-separated time-bin boundaries (at least 3)
    #[arg(long, value_delimiter = ',', num_args = 1.., required = true)]
    pub bins: Vec<f64>,

    /// Write the metric summary to this TSV file
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Args)]
pub struct BinsArgs {
    /// Path to TSV with event_time and censorship columns
    pub data: PathBuf,

    /// Number of time bins
    #[arg(long, default_value = "4")]
    pub n_bins: usize,

    /// Margin added below the smallest and above the largest event time
    #[arg(long, default_value = "1e-6")]
    pub eps: f64,
}

#[derive(Parser)]
#[command(
    name = "histosurv",
    about = "Training and evaluation engine for pathology + multi-omics survival models",
    long_about = "Scores survival predictions with concordance, Brier and time-dependent AUC \
                 metrics, derives discrete time bins, and validates fold configurations."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Score a predictions table against a reference cohort
    #[command(about = "Compute c-index, IPCW c-index, Brier, IBS and cumulative AUC")]
    Evaluate(EvaluateArgs),

    /// Derive time-bin boundaries from uncensored event-time quantiles
    #[command(about = "Print quantile time-bin boundaries")]
    Bins(BinsArgs),

    /// Parse and validate a fold configuration file
    #[command(about = "Validate a fold configuration (.toml)")]
    CheckConfig {
        /// Path to the configuration file
        #[arg(value_name = "CONFIG_PATH")]
        config: PathBuf,
    },

    /// Display version information
    Version,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Evaluate(args)) => evaluate(args),
        Some(Commands::Bins(args)) => bins(args),
        Some(Commands::CheckConfig { config }) => check_config(&config),
        Some(Commands::Version) => {
            println!("histosurv {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => Cli::command()
            .print_help()
            .map(|()| println!())
            .map_err(Into::into),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

pub fn evaluate(args: EvaluateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_predictions(&args.predictions)?;
    let reference = load_reference(&args.reference)?;
    let bins = BinBoundaries::new(args.bins)?;
    println!(
        "Scoring {} predictions against {} reference outcomes",
        table.risk.len(),
        reference.len()
    );

    let metrics = calculate_metrics(MetricInputs {
        survival_train: &reference,
        risk: table.risk.view(),
        censorship: table.censorship.view(),
        event_time: table.event_time.view(),
        survival: table.survival.view(),
        dataset_event_times: table.event_time.view(),
        bins: bins.edges(),
    });
    for (name, err) in metrics.failures() {
        println!("{name}: failed ({err})");
    }
    let summary = metrics.summary();
    println!("{}", fold_end_line(FoldStage::Final, &summary));

    if let Some(output_path) = &args.output {
        save_summary(output_path, &summary)?;
        println!("Metrics saved to: {}", output_path.display());
    }
    Ok(())
}

fn save_summary(path: &Path, summary: &MetricSummary) -> Result<(), std::io::Error> {
    let mut file = std::fs::File::create(path)?;
    writeln!(file, "metric\tvalue")?;
    writeln!(file, "c_index\t{}", summary.c_index)?;
    writeln!(file, "c_index_ipcw\t{}", summary.c_index_ipcw)?;
    for (i, score) in summary.brier.iter().enumerate() {
        writeln!(file, "brier_{i}\t{score}")?;
    }
    writeln!(file, "integrated_brier\t{}", summary.integrated_brier)?;
    writeln!(file, "auc\t{}", summary.auc)?;
    Ok(())
}

pub fn bins(args: BinsArgs) -> Result<(), Box<dyn std::error::Error>> {
    let outcomes = load_reference(&args.data)?;
    let event_time = outcomes.time().to_vec();
    let censorship: Vec<f64> = outcomes
        .event()
        .iter()
        .map(|&event| if event { 0.0 } else { 1.0 })
        .collect();
    let bins =
        BinBoundaries::from_uncensored_quantiles(&event_time, &censorship, args.n_bins, args.eps)?;
    let edges: Vec<String> = bins.edges().iter().map(f64::to_string).collect();
    println!("{}", edges.join(","));
    Ok(())
}

fn check_config(path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = TrainingConfig::load(path)?;
    println!("Configuration OK: {}", path.display());
    println!(
        "  omics format: {}, loss: {}, optimizer: {} (lr {}, weight decay {})",
        config.omics_format, config.loss, config.optimizer, config.lr, config.reg
    );
    println!(
        "  pathway collection: {} for {} ({} omics features)",
        config.pathway_collection,
        config.study,
        config.omics_input_dim()
    );
    match config.missing_modality {
        Some(missing) => println!("  validation ablates modality {missing}"),
        None => println!("  no modality ablation"),
    }
    println!(
        "  {} epochs, batch size {}, results in {}",
        config.max_epochs,
        config.batch_size,
        config.results_dir.display()
    );
    Ok(())
}
