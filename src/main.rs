use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use colored::*;
use lfds::{EliminationBackoffStack, MichaelScottQueue, StackConfig};
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod harness;

use harness::{Report, Workload};

const RULE: &str = "---------------------------------------------------";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DataStructure {
    /// Elimination-backoff stack
    #[value(name = "ebstack")]
    EbStack,
    /// Michael-Scott queue
    #[value(name = "msqueue")]
    MsQueue,
}

/// Benchmarks the lock-free stack and queue under a concurrent workload
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Data structure to benchmark
    #[arg(short, long, value_enum)]
    data_structure: DataStructure,

    /// Number of worker threads
    #[arg(short, long)]
    threads: usize,

    /// Number of items to insert and remove
    #[arg(short, long)]
    items: u32,

    /// Busy work after every operation, in microseconds
    #[arg(short, long, default_value_t = 0)]
    workload: u64,

    /// Time to wait for an elimination partner, in nanoseconds (ebstack only)
    #[arg(short, long, default_value_t = 100_000)]
    spin: u64,

    /// Randomize the elimination wait between half and all of --spin
    #[arg(long)]
    jitter: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(args.verbose);

    if args.threads == 0 {
        bail!("invalid number of threads: 0");
    }

    let workload = Workload::new(
        args.threads,
        args.items,
        Duration::from_micros(args.workload),
    );

    let errors = match args.data_structure {
        DataStructure::EbStack => {
            let config = StackConfig::new(args.threads)
                .spin_delay(Duration::from_nanos(args.spin))
                .spin_jitter(args.jitter);
            let stack = EliminationBackoffStack::with_config(config)
                .context("invalid stack configuration")?;

            print_running("StackBenchmark", "EliminationBackoffStack");
            let report = harness::run_stack(&stack, &workload)?;
            let errors = print_report("StackBenchmark", "EliminationBackoffStack", "stack", &report);
            println!("{}", stack.stats());
            errors
        }
        DataStructure::MsQueue => {
            let queue = MichaelScottQueue::new();

            print_running("QueueBenchmark", "MichaelScottQueue");
            let report = harness::run_queue(&queue, &workload)?;
            let errors = print_report("QueueBenchmark", "MichaelScottQueue", "queue", &report);
            println!("{}", queue.stats());
            errors
        }
    };

    Ok(if errors == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn print_running(benchmark: &str, structure: &str) {
    println!("{}", format!("{benchmark} [{structure}] running...").yellow().bold());
}

/// Prints the timing and invariant checks of a run. Returns the number of
/// errors found.
fn print_report(benchmark: &str, structure: &str, kind: &str, report: &Report) -> usize {
    println!("{}", format!("{benchmark} [{structure}] completed").green().bold());
    println!("{RULE}");
    println!("Elapsed time: {} milliseconds", report.elapsed.as_millis());
    println!("{RULE}");

    let errors = report.errors(kind);
    if errors.is_empty() {
        println!("Errors: {}", "none".green());
    } else {
        println!("{}", "Errors:".red().bold());
        for error in &errors {
            println!("\t{}", error.red());
        }
    }
    println!("{RULE}");

    errors.len()
}
