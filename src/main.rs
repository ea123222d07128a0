use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::ArgAction;
use clap::CommandFactory;
use clap::Parser;
use cohort::config::Config;
use cohort::exec::manager::ExecManager;
use cohort::exec::manager::Outcome;
use cohort::exec::registry;
use log::LevelFilter;
use log::error;
use log::info;

/// Command line arguments for the cohort binary.
#[derive(Parser, Debug)]
#[command(
    name = "cohort",
    about = "Benchmark execution harness",
    long_about = "This program runs a cohort of benchmarks side by side and supervises them with \
                  an execution monitor, which may keep moving them across CPUs or sample their \
                  hardware counters. The run ends as soon as the first benchmark terminates, and \
                  every other benchmark is then killed.\n\n\
                  The run is described by a JSON configuration file.",
    disable_help_flag = true
)]
struct Args {
    /// Print help.
    #[arg(long, short = 'h', action = ArgAction::SetTrue)]
    help: bool,

    /// Log debug messages.
    #[arg(long, short = 'v', action = ArgAction::SetTrue)]
    verbose: bool,

    /// List the available execution monitors.
    #[arg(long, action = ArgAction::SetTrue)]
    list_monitors: bool,

    /// Configuration file.
    config: Option<PathBuf>,
}

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();
}

fn run(config: &Path) -> Result<()> {
    let config = Config::load(config)?;
    let manager = ExecManager::new(&config).with_context(|| "unable to set up execution")?;
    match manager.run()? {
        Outcome::Completed {
            benchmark,
            pid,
            termination,
        } => info!("first to finish: {benchmark} (pid {pid}), {termination}"),
        Outcome::TimedOut => info!("time limit reached before any benchmark finished"),
    }
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    if args.list_monitors {
        for key in registry::keys() {
            println!("{key}");
        }
        return ExitCode::SUCCESS;
    }

    let Some(config) = args.config.as_ref().filter(|_| !args.help) else {
        let _ = Args::command().print_help();
        println!();
        return ExitCode::FAILURE;
    };

    init_logging(args.verbose);
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
