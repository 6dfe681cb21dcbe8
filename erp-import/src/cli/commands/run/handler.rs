//! Run command handler

use anyhow::{Context, Result};
use colored::*;
use dialoguer::Confirm;
use is_terminal::IsTerminal;
use log::warn;
use std::sync::atomic::Ordering;

use super::RunCommands;
use crate::api::ErpClient;
use crate::config::Config;
use crate::transfer::{Job, JobOptions, JobStatus, Mapping, MemoryCache, RunReport};

/// Handle the run command
pub async fn handle_run_command(args: RunCommands, config: Config) -> Result<()> {
    if args.no_color {
        colored::control::set_override(false);
    }

    let mapping = Mapping::load(&args.mapping)?;

    let input = args
        .input
        .or_else(|| config.input_path.clone())
        .context("No input file: pass --input or set input_path")?;
    if !input.exists() {
        anyhow::bail!("Input file does not exist: {}", input.display());
    }

    let dry_run = args.dry_run || config.dry_run;
    let options = JobOptions {
        input,
        output_dir: args.output_dir.unwrap_or_else(|| config.output_dir.clone()),
        dry_run,
        batch_size: args.batch_size.or(mapping.batch_size).unwrap_or(config.batch_size),
        start_index: args.start_index,
        restart: args.restart,
    };

    let credentials = config.credentials()?;

    println!(
        "{} {} -> {} on {} ({})",
        if dry_run { "Dry run".yellow().bold() } else { "Live run".green().bold() },
        options.input.display().to_string().cyan(),
        mapping.target.cyan(),
        credentials.server_url,
        credentials.database
    );

    if !dry_run && !args.yes && !confirm_live_run(&mapping)? {
        println!("Cancelled");
        return Ok(());
    }

    let resilience = config.to_resilience();
    let client = ErpClient::new(credentials, resilience.request_timeout)?;
    let job = Job::new(mapping, options, client, &resilience, Box::new(MemoryCache::new()));

    let stop = job.stop_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Stop requested; finishing the current group (press Ctrl-C again to quit now)");
            stop.store(true, Ordering::SeqCst);
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        }
    });

    let report = job.run().await?;
    print_report(&report);

    match report.status {
        JobStatus::Success => Ok(()),
        JobStatus::Stopped => {
            println!(
                "{} Run the same command again to resume.",
                "Stopped.".yellow().bold()
            );
            Ok(())
        }
        JobStatus::Aborted(kind, message) => anyhow::bail!("Run aborted ({}): {}", kind, message),
    }
}

fn confirm_live_run(mapping: &Mapping) -> Result<bool> {
    if !std::io::stdin().is_terminal() {
        anyhow::bail!("Refusing a live run without a terminal; pass --yes to confirm");
    }
    Confirm::new()
        .with_prompt(format!("Write to {} now?", mapping.target))
        .default(false)
        .interact()
        .context("Failed to read confirmation")
}

fn print_report(report: &RunReport) {
    let counters = &report.counters;
    println!();
    println!("{}", "Summary".bold());
    println!("  {:<10} {}", "created", counters.created.to_string().green());
    println!("  {:<10} {}", "updated", counters.updated.to_string().green());
    println!("  {:<10} {}", "unchanged", counters.unchanged);
    println!("  {:<10} {}", "skipped", counters.skipped.to_string().yellow());
    let failed = if counters.failed > 0 {
        counters.failed.to_string().red().bold()
    } else {
        counters.failed.to_string().normal()
    };
    println!("  {:<10} {}", "failed", failed);

    if report.start_group > 0 {
        println!(
            "  resumed at group {} of {}",
            report.start_group, report.total_groups
        );
    }
    if report.references_created > 0 {
        println!("  {} referenced records created", report.references_created);
    }
    if report.planned > 0 {
        println!("  {} operations planned (dry run)", report.planned);
    }

    if !report.warnings.is_empty() {
        println!();
        println!("{} ({})", "Warnings".yellow().bold(), report.warnings.len());
        for warning in report.warnings.iter().take(20) {
            println!("  {}", warning.dimmed());
        }
        if report.warnings.len() > 20 {
            println!("  ... see the run log for the rest");
        }
    }

    println!();
    println!(
        "{} calls ({} lookups), {} retries, {:.1}s",
        report.calls,
        report.lookups,
        report.retries,
        report.elapsed.as_secs_f64()
    );
    println!("Run log:     {}", report.log_path.display().to_string().cyan());
    if let Some(path) = &report.failed_rows_path {
        println!("Failed rows: {}", path.display().to_string().cyan());
    }
}
