//! Main application run loop

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::app::options::{AppOptions, DeploymentJob};
use crate::errors::ProvisionError;
use crate::escalation::tracker::{FileTracker, LogOnlyTracker, Tracker};
use crate::pipeline::control::{control_channel, ControlSender, RunControl};
use crate::pipeline::controller::PipelineController;
use crate::pipeline::outcome::RunSummary;
use crate::remote::session::SessionConnector;
use crate::remote::ssh::SshConnector;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::storage::state::DeploymentStore;

/// Result of one job
#[derive(Debug)]
pub struct JobResult {
    pub label: String,
    pub result: Result<RunSummary, ProvisionError>,
}

/// Build a controller over the on-disk layout with the ssh connector
pub async fn init_controller(
    settings: Settings,
    layout: &StorageLayout,
) -> Result<PipelineController, ProvisionError> {
    layout.setup().await?;

    let connector: Arc<dyn SessionConnector> = Arc::new(SshConnector::new(settings.ssh.clone()));
    let tracker: Arc<dyn Tracker> = if settings.escalation.write_reports {
        Arc::new(FileTracker::new(layout.reports_dir()))
    } else {
        Arc::new(LogOnlyTracker)
    };
    let store = DeploymentStore::new(layout.state_dir());

    Ok(PipelineController::new(settings, connector, store, tracker)?
        .with_journal_file(layout.journal_file()))
}

/// Run every job concurrently until all finish.
///
/// When `shutdown_signal` resolves, running deployments are cancelled and
/// given `max_shutdown_delay` to persist their state; jobs still queued are
/// cancelled before their first step.
pub async fn run(
    controller: Arc<PipelineController>,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Vec<JobResult> {
    let AppOptions {
        jobs: queued,
        max_concurrent,
        max_shutdown_delay,
        ..
    } = options;

    let (control_tx, control_rx) = control_channel();
    let permits = Arc::new(Semaphore::new(max_concurrent.max(1)));
    let mut jobs = JoinSet::new();

    info!("Running {} deployment(s)", queued.len());

    for job in queued {
        let controller = controller.clone();
        let control = control_rx.clone();
        let permits = permits.clone();

        jobs.spawn(async move {
            let label = job.label();
            let result = match permits.acquire_owned().await {
                Ok(_permit) => match &job {
                    DeploymentJob::Start(descriptor) => controller.start(descriptor, control).await,
                    DeploymentJob::Resume(id) => controller.resume(id, control).await,
                },
                Err(e) => Err(ProvisionError::Internal(format!("Job queue closed: {}", e))),
            };
            JobResult { label, result }
        });
    }
    drop(control_rx);

    let mut results = Vec::new();
    tokio::pin!(shutdown_signal);
    let mut shutting_down = false;

    while !jobs.is_empty() {
        tokio::select! {
            joined = jobs.join_next() => {
                if let Some(joined) = joined {
                    collect(joined, &mut results);
                }
            }
            _ = &mut shutdown_signal, if !shutting_down => {
                info!("Shutdown signal received, cancelling deployments...");
                shutting_down = true;
                cancel(&control_tx);
                if !drain(&mut jobs, &mut results, max_shutdown_delay).await {
                    break;
                }
            }
        }
    }

    results
}

fn cancel(control_tx: &ControlSender) {
    if control_tx.send(RunControl::Cancel).is_err() {
        warn!("No deployment left to cancel");
    }
}

/// Wait for cancelled jobs; abort whatever outlives the shutdown delay
async fn drain(jobs: &mut JoinSet<JobResult>, results: &mut Vec<JobResult>, max_delay: Duration) -> bool {
    let deadline = tokio::time::sleep(max_delay);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = jobs.join_next() => match joined {
                Some(joined) => collect(joined, results),
                None => return true,
            },
            _ = &mut deadline => {
                error!(
                    "Shutdown timed out after {:?}, aborting {} deployment(s)",
                    max_delay,
                    jobs.len()
                );
                jobs.abort_all();
                return false;
            }
        }
    }
}

fn collect(joined: Result<JobResult, tokio::task::JoinError>, results: &mut Vec<JobResult>) {
    match joined {
        Ok(job) => {
            match &job.result {
                Ok(summary) => info!("{}: {} ({})", job.label, summary.outcome, summary.deployment_id),
                Err(e) => error!("{}: {}", job.label, e),
            }
            results.push(job);
        }
        Err(e) => error!("Deployment task failed: {}", e),
    }
}
