use anyhow::Context;
use clap::Parser;
use colored::*;
use lab_stager::cli::Args;
use lab_stager::processor::{StagingProcessor, print_discovery, print_summary};
use std::process;
use tracing::debug;

fn main() {
    let args = Args::parse();
    setup_logging(&args);

    // Create async runtime and run the staging logic
    let runtime = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("Failed to create async runtime: {}", e);
        process::exit(1);
    });

    match runtime.block_on(run(&args)) {
        Ok(code) => process::exit(code),
        Err(error) => {
            eprintln!("{} {:#}", "Error:".bright_red().bold(), error);
            process::exit(1);
        }
    }
}

async fn run(args: &Args) -> anyhow::Result<i32> {
    let config = args.to_config().context("Invalid arguments")?;
    let processor = StagingProcessor::new(config).context("Cannot start staging run")?;

    if processor.config().dry_run {
        let report = processor.discover().await.context("Discovery failed")?;
        print_discovery(&report);
        return Ok(0);
    }

    println!("{}", "Starting staging run".bright_green().bold());
    println!(
        "  {} {}",
        "Input:".bright_cyan(),
        processor.config().input_root.display()
    );
    println!(
        "  {} {}",
        "Output:".bright_cyan(),
        processor.config().dataset_path().display()
    );

    let summary = processor.process().await.context("Staging run failed")?;
    print_summary(&summary);
    Ok(summary.exit_code())
}

/// Set up structured logging on stderr
fn setup_logging(args: &Args) {
    let level = args.log_level();
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_level(true)
        .with_writer(std::io::stderr)
        .init();

    debug!("Logging initialized at level: {}", level);
}
