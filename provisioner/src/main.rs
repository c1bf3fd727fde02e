//! Provisioner - Entry Point
//!
//! Provisions application hosts over SSH: runs the setup pipeline, recovers
//! from known failures, verifies the result and files a report when a
//! deployment cannot be completed.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;

use provisioner::app::options::{AppOptions, DeploymentJob};
use provisioner::app::run::{init_controller, run, JobResult};
use provisioner::filesys::file::File;
use provisioner::logs::{init_logging, LogLevel, LogOptions};
use provisioner::models::deployment::{Deployment, DeploymentDescriptor};
use provisioner::pipeline::outcome::{RunOutcome, RunSummary};
use provisioner::storage::layout::StorageLayout;
use provisioner::storage::settings::Settings;
use provisioner::storage::state::DeploymentStore;
use provisioner::utils::version_info;

use tracing::{error, info};

const USAGE: &str = "\
Usage:
  provisioner --descriptor=<file.json> [--settings=<file.json>] [--home=<dir>]
  provisioner --resume=<id>[,<id>...]
  provisioner --list
  provisioner --version

Options:
  --log-level=<level>   trace, debug, info, warn or error
  --json-logs           JSON log lines on stdout
  --concurrency=<n>     deployments running at once (default 4)";

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}", e),
        }
        return ExitCode::SUCCESS;
    }

    if cli_args.contains_key("help") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    match main_impl(&cli_args).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn main_impl(cli_args: &HashMap<String, String>) -> anyhow::Result<ExitCode> {
    let layout = match cli_args.get("home") {
        Some(home) => StorageLayout::new(home),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file, falling back to defaults when absent
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let mut settings = if settings_file.exists().await {
        settings_file
            .read_json::<Settings>()
            .await
            .with_context(|| format!("Unable to read settings file {}", settings_file.path().display()))?
    } else {
        Settings::default()
    };

    if let Some(level) = cli_args.get("log-level") {
        settings.log_level = level.parse::<LogLevel>().map_err(anyhow::Error::msg)?;
    }
    if cli_args.contains_key("json-logs") {
        settings.json_logs = true;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        json_format: settings.json_logs,
        log_dir: Some(layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    if cli_args.contains_key("list") {
        let store = DeploymentStore::new(layout.state_dir());
        print_deployments(&store.list().await?);
        return Ok(ExitCode::SUCCESS);
    }

    let mut jobs = Vec::new();
    if let Some(path) = cli_args.get("descriptor") {
        for descriptor in read_descriptors(PathBuf::from(path)).await? {
            jobs.push(DeploymentJob::Start(descriptor));
        }
    }
    if let Some(ids) = cli_args.get("resume") {
        jobs.extend(
            ids.split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| DeploymentJob::Resume(id.to_string())),
        );
    }
    if jobs.is_empty() {
        println!("{}", USAGE);
        return Ok(ExitCode::from(64));
    }

    let mut options = AppOptions {
        layout: layout.clone(),
        jobs,
        ..Default::default()
    };
    if let Some(n) = cli_args.get("concurrency") {
        options.max_concurrent = n.parse().with_context(|| format!("Invalid --concurrency value {:?}", n))?;
    }

    let controller = Arc::new(init_controller(settings, &layout).await?);
    info!("Running provisioner {} with {} job(s)", version_info().version, options.jobs.len());

    let results = run(controller, options, await_shutdown_signal()).await;
    Ok(print_results(&results))
}

/// A descriptor file holds one descriptor or an array of them
async fn read_descriptors(path: PathBuf) -> anyhow::Result<Vec<DeploymentDescriptor>> {
    let file = File::new(&path);
    let contents = file
        .read_string()
        .await
        .with_context(|| format!("Unable to read descriptor file {}", path.display()))?;

    if contents.trim_start().starts_with('[') {
        serde_json::from_str(&contents).with_context(|| format!("Invalid descriptor list in {}", path.display()))
    } else {
        let descriptor: DeploymentDescriptor =
            serde_json::from_str(&contents).with_context(|| format!("Invalid descriptor in {}", path.display()))?;
        Ok(vec![descriptor])
    }
}

fn print_deployments(deployments: &[Deployment]) {
    if deployments.is_empty() {
        println!("No deployments recorded");
        return;
    }
    for d in deployments {
        println!(
            "{:<40} {:<10} {:>2}/{:<2} {}@{} ({})",
            d.id,
            status_label(d.status.as_str()),
            d.current_step,
            d.total_steps,
            d.server.username,
            d.server.hostname,
            d.server.domain
        );
    }
}

fn status_label(status: &str) -> colored::ColoredString {
    match status {
        "success" => status.green(),
        "failed" => status.red(),
        "partial_success" => status.yellow(),
        "paused" | "cancelled" => status.cyan(),
        _ => status.normal(),
    }
}

fn flag(name: &str, passed: bool) -> String {
    if passed {
        format!("{} {}", "✓".green(), name)
    } else {
        format!("{} {}", "✗".red(), name)
    }
}

fn print_summary(label: &str, summary: &RunSummary) {
    println!();
    println!(
        "{} {} [{}]",
        label.bold(),
        summary.deployment_id.dimmed(),
        status_label(summary.outcome.as_str()).bold()
    );
    println!(
        "  steps {}/{}, errors {}",
        summary.steps_completed, summary.total_steps, summary.error_count
    );
    println!(
        "  {}  {}  {}",
        flag("services healthy", summary.verification.services_healthy),
        flag("domain accessible", summary.verification.domain_accessible),
        flag("critical checks", summary.verification.critical_checks_passed)
    );
    if let Some(step) = &summary.failed_step {
        println!("  failed step: {}", step.red());
    }
    if let Some(classification) = &summary.classification {
        println!("  classification: {}", classification);
    }
    if let Some(error) = &summary.last_error {
        if summary.outcome != RunOutcome::Success {
            println!("  last error: {}", error);
        }
    }
    if let Some(escalation) = &summary.escalation {
        if let Some(issue) = &escalation.issue_id {
            println!("  issue: {}", issue);
        }
        if let Some(pr) = &escalation.pr_id {
            println!("  remediation: {}", pr);
        }
    }
}

/// Print every result; the exit code is the worst outcome
fn print_results(results: &[JobResult]) -> ExitCode {
    let mut worst = 0;
    for job in results {
        match &job.result {
            Ok(summary) => {
                print_summary(&job.label, summary);
                worst = worst.max(summary.outcome.exit_code());
            }
            Err(e) => {
                println!();
                println!("{} {} {}", job.label.bold(), "error:".red().bold(), e);
                worst = worst.max(RunOutcome::Failed.exit_code());
            }
        }
    }
    ExitCode::from(worst as u8)
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) = match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received, shutting down...");
    }
}
