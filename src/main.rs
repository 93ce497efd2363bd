use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use daq2arrow::skim::skim;
use daq2arrow::{ConversionConfig, ConversionError, RunSummary, SourceSpec, StopReason, WriteMode, run_conversion};

/// Exit code of a run interrupted with Ctrl-C
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(
    name = "daq2arrow",
    version,
    about = "Convert raw digitizer DAQ packets into chunked Arrow tables",
    long_about = "Convert legacy DAQ record files and streaming recordings (or live tcp:// sources)\n\
                  into one Arrow IPC table per output stream."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Convert one or more inputs into Arrow tables
    Convert(ConvertArgs),
    /// Copy the first packets of a legacy file into a smaller file
    Skim(SkimArgs),
}

#[derive(Args)]
struct ConvertArgs {
    /// Input files, or tcp://host:port for a live server
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Output directory; one subdirectory per input when several are given
    #[arg(short, long)]
    output: PathBuf,

    /// YAML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Rows per buffer before it is flushed
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Stop after this many packets
    #[arg(long)]
    max_packets: Option<u64>,

    /// Stop at this byte offset
    #[arg(long)]
    max_bytes: Option<u64>,

    /// Replace existing output
    #[arg(long, conflicts_with = "resume")]
    overwrite: bool,

    /// Continue from the checkpoint in the output directory
    #[arg(long)]
    resume: bool,

    /// Keep undecodable packets in a garbage table
    #[arg(long)]
    keep_garbage: bool,

    /// Reconnection attempts for live sources
    #[arg(long)]
    reconnect: Option<u32>,

    /// Do not write a checkpoint
    #[arg(long)]
    no_checkpoint: bool,
}

#[derive(Args)]
struct SkimArgs {
    /// Legacy record file to read
    input: PathBuf,

    /// File to write
    output: PathBuf,

    /// Number of packets to copy
    #[arg(short = 'n', long)]
    packets: u64,
}

impl ConvertArgs {
    fn conversion_config(&self) -> Result<ConversionConfig> {
        let mut config = match &self.config {
            Some(path) => ConversionConfig::load(path)
                .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
            None => ConversionConfig::default(),
        };

        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
        if self.max_packets.is_some() {
            config.max_packets = self.max_packets;
        }
        if self.max_bytes.is_some() {
            config.max_bytes = self.max_bytes;
        }
        if self.overwrite {
            config.mode = WriteMode::Overwrite;
        } else if self.resume {
            config.mode = WriteMode::Resume;
        }
        if self.keep_garbage {
            config.keep_garbage = true;
        }
        if let Some(attempts) = self.reconnect {
            config.reconnect.attempts = attempts;
        }
        if self.no_checkpoint {
            config.checkpoint = false;
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let result = match cli.command {
        Command::Convert(args) => convert(args).await,
        Command::Skim(args) => run_skim(args).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn report(e: &anyhow::Error) {
    error!("{:#}", e);
    if let Some(conversion) = e.downcast_ref::<ConversionError>() {
        for suggestion in conversion.recovery_suggestions() {
            info!("  hint: {}", suggestion);
        }
    }
}

async fn convert(args: ConvertArgs) -> Result<ExitCode> {
    let config = args.conversion_config()?;
    let cancel = CancellationToken::new();

    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, draining buffers");
            interrupt.cancel();
        }
    });

    let specs: Vec<SourceSpec> = args.inputs.iter().map(|input| SourceSpec::parse(input)).collect();
    let multiple = specs.len() > 1;
    let out_dirs = output_dirs(&specs, &args.output)?;

    let mut tasks = JoinSet::new();
    for (spec, out_dir) in specs.into_iter().zip(out_dirs) {
        let config = config.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let result = run_conversion(&spec, &out_dir, &config, &cancel).await;
            (spec, result)
        });
    }

    let mut summaries: Vec<RunSummary> = Vec::new();
    let mut failures = 0usize;
    while let Some(joined) = tasks.join_next().await {
        let (spec, result) = joined.context("Conversion task panicked")?;
        match result {
            Ok(summary) => summaries.push(summary),
            Err(e) => {
                failures += 1;
                report(&anyhow::Error::new(e).context(format!("Failed to convert {}", spec)));
            }
        }
    }

    let failed_tables: usize = summaries.iter().map(|s| s.failed_tables.len()).sum();
    let cancelled = summaries.iter().any(|s| s.stop_reason == StopReason::Cancelled);
    if multiple {
        let rows: u64 = summaries.iter().map(RunSummary::total_rows).sum();
        info!("{} of {} inputs converted, {} rows", summaries.len(), summaries.len() + failures, rows);
    }

    if failures > 0 || failed_tables > 0 {
        if failed_tables > 0 {
            error!("{} tables were taken out of service", failed_tables);
        }
        return Ok(ExitCode::FAILURE);
    }
    if cancelled {
        return Ok(ExitCode::from(EXIT_CANCELLED));
    }
    Ok(ExitCode::SUCCESS)
}

/// Output directory of each input: `output` itself for a single input,
/// otherwise `<output>/<stem>`. Two inputs sharing a stem are refused.
fn output_dirs(specs: &[SourceSpec], output: &Path) -> Result<Vec<PathBuf>> {
    if specs.len() <= 1 {
        return Ok(specs.iter().map(|_| output.to_path_buf()).collect());
    }

    let mut seen: HashMap<String, &SourceSpec> = HashMap::new();
    let mut dirs = Vec::with_capacity(specs.len());
    for spec in specs {
        let stem = spec.stem();
        if let Some(other) = seen.insert(stem.clone(), spec) {
            anyhow::bail!("Inputs {} and {} would both write to {}", other, spec, output.join(&stem).display());
        }
        dirs.push(output.join(stem));
    }
    Ok(dirs)
}

async fn run_skim(args: SkimArgs) -> Result<ExitCode> {
    let SkimArgs { input, output, packets } = args;
    let summary = tokio::task::spawn_blocking(move || skim(&input, &output, packets))
        .await
        .context("Skim task panicked")??;

    if summary.reached_end {
        info!("Input holds only {} packets", summary.packets);
    }
    Ok(ExitCode::SUCCESS)
}
