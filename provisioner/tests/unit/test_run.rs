//! Runner tests: concurrency limit and shutdown

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use provisioner::app::options::{AppOptions, DeploymentJob};
use provisioner::app::run::{run, JobResult};
use provisioner::models::deployment::DeploymentStatus;
use provisioner::pipeline::outcome::{RunOutcome, RunSummary};

use crate::support::{descriptor, Harness, Reply, ScriptedSession};

/// First command of the standard pipeline
const FIRST_COMMAND: &str = "apt-get update";

fn options(jobs: usize, max_concurrent: usize) -> AppOptions {
    AppOptions {
        jobs: (0..jobs).map(|_| DeploymentJob::Start(descriptor())).collect(),
        max_concurrent,
        max_shutdown_delay: Duration::from_secs(5),
        ..Default::default()
    }
}

fn summaries(results: Vec<JobResult>) -> Vec<RunSummary> {
    results
        .into_iter()
        .map(|job| job.result.expect("job should produce a summary"))
        .collect()
}

#[tokio::test]
async fn test_jobs_run_to_completion() {
    let Harness {
        dir: _dir,
        session,
        controller,
        ..
    } = Harness::new(ScriptedSession::serving());
    let store = controller.store().clone();
    let controller = Arc::new(controller);

    let results = run(controller, options(2, 1), std::future::pending::<()>()).await;
    let summaries = summaries(results);

    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.outcome == RunOutcome::Success));
    assert_ne!(summaries[0].deployment_id, summaries[1].deployment_id);
    assert_eq!(store.list().await.unwrap().len(), 2);
    assert_eq!(session.count(FIRST_COMMAND), 2);
}

#[tokio::test]
async fn test_shutdown_cancels_running_deployment() {
    let Harness {
        dir: _dir,
        session,
        controller,
        ..
    } = Harness::new(ScriptedSession::serving().on(FIRST_COMMAND, Reply::Hang));
    let store = controller.store().clone();
    let controller = Arc::new(controller);

    let shutdown = tokio::time::sleep(Duration::from_millis(200));
    let results = run(controller, options(1, 4), shutdown).await;
    let summaries = summaries(results);

    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].outcome, RunOutcome::Cancelled);
    assert_eq!(summaries[0].steps_completed, 0);

    let stored = store.load(&summaries[0].deployment_id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::Cancelled);
    assert_eq!(session.count(FIRST_COMMAND), 1);
    assert_eq!(session.closes(), 1);
}

#[tokio::test]
async fn test_concurrency_limit_holds_queued_jobs() {
    let Harness {
        dir: _dir,
        session,
        connector,
        controller,
        ..
    } = Harness::new(ScriptedSession::serving().on(FIRST_COMMAND, Reply::Hang));
    let store = controller.store().clone();
    let controller = Arc::new(controller);

    // connections made by the time shutdown is requested
    let connected = Arc::new(AtomicUsize::new(0));
    let observed = connected.clone();
    let shutdown = async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        observed.store(connector.connects.load(Ordering::SeqCst), Ordering::SeqCst);
    };

    let results = run(controller, options(2, 1), shutdown).await;

    assert_eq!(connected.load(Ordering::SeqCst), 1);
    assert_eq!(session.count(FIRST_COMMAND), 1);

    let summaries = summaries(results);
    assert_eq!(summaries.len(), 2);
    assert!(summaries.iter().all(|s| s.outcome == RunOutcome::Cancelled));

    let stored = store.list().await.unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|d| d.status == DeploymentStatus::Cancelled));
}
