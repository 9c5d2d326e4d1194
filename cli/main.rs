// ========================================================================================
//
//                           The command-line driver: hccdist
//
// ========================================================================================
//
// Loads an allele profile, builds the worker pool, runs the distance engine and
// writes the lower-triangular matrix. All computation lives in the library; this
// file only resolves configuration and reports progress.

#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

use clap::{Args, CommandFactory, Parser, Subcommand};
use hccdist::config::RunConfig;
use hccdist::io::{read_profiles, write_distance_matrix};
use hccdist::progress::{ComputeProgressObserver, PartitionReport};
use hccdist::{ComputeOptions, Metric, compute_with};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::error::Error;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::time::Instant;

#[derive(Parser)]
#[command(
    name = "hccdist",
    version,
    about = "Parallel pairwise allele distances for cgMLST profiles."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute the distance matrix of an allele profile table
    Compute(ComputeArgs),
    /// Write a configuration file holding every default value
    Config {
        /// Where to write the TOML file
        #[arg(long)]
        output: PathBuf,
    },
    /// Print version information
    Version,
}

#[derive(Args)]
struct ComputeArgs {
    /// Allele profile table (first column = sample id); `.gz` is decompressed
    #[arg(long)]
    profile: PathBuf,

    /// Destination of the distance table; `.gz` is compressed
    #[arg(long)]
    output: PathBuf,

    /// TOML run configuration; command-line flags take precedence over it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Distance metric: synchronized, asynchronous or probabilistic
    #[arg(long)]
    metric: Option<Metric>,

    /// Number of worker threads (defaults to the number of logical CPUs)
    #[arg(long)]
    threads: Option<usize>,

    /// Skip rows below this sample index
    #[arg(long)]
    start: Option<usize>,

    /// Fraction of loci a sample may leave uncalled without penalty
    #[arg(long)]
    allowed_missing: Option<f64>,

    /// Give up waiting for workers after this many seconds
    #[arg(long)]
    timeout_secs: Option<u64>,

    /// Field delimiter of the profile and of the output table
    #[arg(long)]
    delimiter: Option<char>,
}

impl ComputeArgs {
    /// Built-in defaults, then the config file, then explicit flags.
    fn resolve(&self) -> Result<RunConfig, Box<dyn Error + Send + Sync>> {
        let mut config = match &self.config {
            Some(path) => RunConfig::load(path)?,
            None => RunConfig::default(),
        };
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if let Some(threads) = self.threads {
            config.threads = Some(threads);
        }
        if let Some(start) = self.start {
            config.start = start;
        }
        if let Some(allowed_missing) = self.allowed_missing {
            config.allowed_missing = allowed_missing;
        }
        if let Some(timeout_secs) = self.timeout_secs {
            config.timeout_secs = Some(timeout_secs);
        }
        if let Some(delimiter) = self.delimiter {
            config.delimiter = delimiter;
        }
        config.validate()?;
        Ok(config)
    }
}

// ========================================================================================
//                                  Progress reporting
// ========================================================================================

struct ProgressBarObserver {
    bar: Option<ProgressBar>,
}

impl ProgressBarObserver {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl ComputeProgressObserver for ProgressBarObserver {
    fn on_start(&mut self, total_comparisons: u64, partitions: usize) {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(Some(total_comparisons), draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} pairs ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        bar.set_message(format!("0/{partitions} partitions"));
        self.bar = Some(bar);
    }

    fn on_partition_done(&mut self, report: &PartitionReport) {
        if let Some(bar) = &self.bar {
            bar.inc(report.comparisons);
            bar.set_message(format!("partition {} done", report.index));
        }
    }

    fn on_finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}

// ========================================================================================
//                              The main orchestration logic
// ========================================================================================

fn run_compute(args: ComputeArgs) -> Result<(), Box<dyn Error + Send + Sync>> {
    let overall_start_time = Instant::now();
    let config = args.resolve()?;
    let delimiter = config.delimiter as u8;

    if args.output.exists() {
        return Err(format!(
            "Output file '{}' already exists. hccdist will not overwrite it. Please remove it or rename it before running.",
            args.output.display()
        )
        .into());
    }

    // --- Phase 1: Profile loading ---
    eprintln!("> Reading allele profiles from {}", args.profile.display());
    let table = read_profiles(&args.profile, delimiter)?;
    eprintln!(
        "> Found {} samples typed at {} loci.",
        table.n_samples(),
        table.n_loci()
    );

    // --- Phase 2: Resource allocation ---
    let threads = config.resolved_threads();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("hccdist-worker-{i}"))
        .build()?;
    eprintln!(
        "> Computing {} distances with {} workers (starting at row {}).",
        config.metric, threads, config.start
    );

    // --- Phase 3: Parallel computation ---
    let options = ComputeOptions {
        start: config.start,
        params: config.kernel_params(),
        timeout: config.timeout(),
    };
    let computation_start = Instant::now();
    let mut observer = ProgressBarObserver::new();
    let dist = compute_with(
        table.alleles.view(),
        config.metric,
        &pool,
        &options,
        &mut observer,
    )?;
    eprintln!(
        "> Computation finished in {:.2?}",
        computation_start.elapsed()
    );

    // --- Phase 4: Output ---
    write_distance_matrix(&args.output, &table.sample_ids, &dist, delimiter)?;
    dist.release();
    eprintln!("> Wrote distances to {}", args.output.display());

    eprintln!(
        "\nSuccess! Total execution time: {:.2?}",
        overall_start_time.elapsed()
    );
    Ok(())
}

fn run_write_config(output: PathBuf) -> Result<(), Box<dyn Error + Send + Sync>> {
    if output.exists() {
        return Err(format!(
            "Configuration file '{}' already exists. hccdist will not overwrite it.",
            output.display()
        )
        .into());
    }
    RunConfig::default().save(&output)?;
    eprintln!("> Wrote default configuration to {}", output.display());
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Compute(args)) => run_compute(args),
        Some(Commands::Config { output }) => run_write_config(output),
        Some(Commands::Version) => {
            println!("hccdist {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
