//! Step pipeline controller
//!
//! Drives one deployment through its pipeline: connects, runs the steps in
//! order with bounded retries and recovery between attempts, verifies the
//! result and escalates fatal failures. The deployment record is persisted
//! after every transition so an interrupted run can be resumed from the step
//! it stopped at.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use crate::classify::engine::ErrorClassifier;
use crate::classify::patterns::{default_patterns, Classification, ErrorPattern};
use crate::errors::ProvisionError;
use crate::escalation::report::FailureReport;
use crate::escalation::reporter::EscalationReporter;
use crate::escalation::tracker::Tracker;
use crate::filesys::file::File;
use crate::journal::{Journal, JournalSink};
use crate::models::deployment::{
    Deployment, DeploymentDescriptor, DeploymentStatus, VerificationFlags,
};
use crate::models::step::PipelineStep;
use crate::pipeline::control::{cancel_requested, ControlReceiver, RunControl};
use crate::pipeline::fsm::{StepEvent, StepFsm};
use crate::pipeline::outcome::{RunOutcome, RunSummary};
use crate::pipeline::plan::{standard_pipeline, Pipeline};
use crate::recovery::actions::{default_step_recovery, RecoveryAction, StepRecoveryMap};
use crate::recovery::dispatcher::RecoveryDispatcher;
use crate::remote::session::{CommandOutput, RemoteSession, SessionConnector};
use crate::remote::stream::OutputSink;
use crate::storage::settings::Settings;
use crate::storage::state::DeploymentStore;
use crate::utils::{calc_exp_backoff, CooldownOptions};
use crate::verify::verifier::{VerificationReport, Verifier, VERIFICATION_STEP};

/// Step name used for a failed connection
pub const CONNECT_STEP: &str = "connect";

/// Why a single attempt of a step failed
enum AttemptError {
    /// The session is gone; retrying cannot help
    Connection(ProvisionError),

    /// A command exited non-zero, timed out or could not run
    Command { command: String, output: CommandOutput },
}

impl AttemptError {
    fn describe(&self) -> String {
        match self {
            AttemptError::Connection(e) => e.to_string(),
            AttemptError::Command { command, output } => {
                let text = output.failure_text().trim();
                if text.is_empty() {
                    format!("`{}` exited {}", command, output.exit_code)
                } else {
                    format!("`{}` exited {}: {}", command, output.exit_code, text)
                }
            }
        }
    }
}

/// A step that will not be retried again
#[derive(Debug, Clone)]
struct StepFailure {
    step: String,
    error: String,
    classification: Option<Classification>,
    attempts: u32,
}

enum StepOutcome {
    Succeeded,
    Failed(StepFailure),
    Cancelled,
}

/// How the pipeline part of a run ended
enum Ending {
    Verified(VerificationReport),
    Failed(StepFailure),
    Paused,
    Cancelled,
}

/// Runs deployments
pub struct PipelineController {
    settings: Settings,
    connector: Arc<dyn SessionConnector>,
    store: DeploymentStore,
    patterns: Vec<ErrorPattern>,
    dispatcher: RecoveryDispatcher,
    step_recovery: StepRecoveryMap,
    verifier: Verifier,
    reporter: EscalationReporter,
    journal_file: Option<File>,
}

impl PipelineController {
    pub fn new(
        settings: Settings,
        connector: Arc<dyn SessionConnector>,
        store: DeploymentStore,
        tracker: Arc<dyn Tracker>,
    ) -> Result<Self, ProvisionError> {
        Ok(Self {
            patterns: default_patterns()?,
            dispatcher: RecoveryDispatcher::with_defaults(settings.ssh.command_timeout()),
            step_recovery: default_step_recovery(),
            verifier: Verifier::new(settings.verification.clone()),
            reporter: EscalationReporter::new(tracker, settings.escalation.clone()),
            journal_file: None,
            connector,
            store,
            settings,
        })
    }

    /// Append every deployment's log entries to `file`
    pub fn with_journal_file(mut self, file: File) -> Self {
        self.journal_file = Some(file);
        self
    }

    pub fn with_patterns(mut self, patterns: Vec<ErrorPattern>) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: RecoveryDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn with_step_recovery(mut self, step_recovery: StepRecoveryMap) -> Self {
        self.step_recovery = step_recovery;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn store(&self) -> &DeploymentStore {
        &self.store
    }

    /// The standard pipeline for a target
    pub fn pipeline_for(&self, deployment: &Deployment) -> Pipeline {
        standard_pipeline(&deployment.server, deployment.mode, &self.settings.app)
    }

    /// Start a new deployment with the standard pipeline
    pub async fn start(
        &self,
        descriptor: &DeploymentDescriptor,
        control: ControlReceiver,
    ) -> Result<RunSummary, ProvisionError> {
        let pipeline = standard_pipeline(&descriptor.server, descriptor.mode, &self.settings.app);
        self.start_with(descriptor, pipeline, control).await
    }

    /// Start a new deployment running `pipeline`
    pub async fn start_with(
        &self,
        descriptor: &DeploymentDescriptor,
        pipeline: Pipeline,
        control: ControlReceiver,
    ) -> Result<RunSummary, ProvisionError> {
        if pipeline.is_empty() {
            return Err(ProvisionError::ValidationError("Pipeline has no steps".to_string()));
        }

        descriptor.validate()?;

        let mut deployment = Deployment::new(descriptor, pipeline.len(), Utc::now());
        self.store.create(&mut deployment).await?;
        info!("Created deployment {} for {}", deployment.id, deployment.server.hostname);
        self.drive(deployment, pipeline, control).await
    }

    /// Continue a persisted deployment with the standard pipeline
    pub async fn resume(&self, id: &str, control: ControlReceiver) -> Result<RunSummary, ProvisionError> {
        let deployment = self.store.load(id).await?;
        let pipeline = self.pipeline_for(&deployment);
        self.resume_with(id, pipeline, control).await
    }

    /// Continue a persisted deployment from its current step.
    ///
    /// Steps before the current one are assumed applied and never re-run.
    pub async fn resume_with(
        &self,
        id: &str,
        pipeline: Pipeline,
        control: ControlReceiver,
    ) -> Result<RunSummary, ProvisionError> {
        let deployment = self.store.load(id).await?;
        deployment.server.validate()?;
        if deployment.status.is_terminal() {
            return Err(ProvisionError::StateError(format!(
                "Deployment {} is {} and cannot be resumed",
                deployment.id, deployment.status
            )));
        }
        info!(
            "Resuming deployment {} ({}) at step {}/{}",
            deployment.id, deployment.status, deployment.current_step, deployment.total_steps
        );
        self.drive(deployment, pipeline, control).await
    }

    fn journal(&self, deployment_id: &str) -> Journal {
        let journal = match &self.journal_file {
            Some(file) => Journal::new(deployment_id, file.clone()),
            None => Journal::in_memory(deployment_id),
        };
        journal.with_capacity(self.settings.escalation.log_tail_lines.max(500))
    }

    /// Point the record at the right step of `pipeline`.
    ///
    /// A stored step name that no longer sits at the stored index is looked up
    /// by name, so pipelines that gained or lost conditional steps resume at
    /// the same logical step.
    async fn align(
        &self,
        deployment: &mut Deployment,
        pipeline: &Pipeline,
        journal: &Journal,
    ) -> Result<(), ProvisionError> {
        let mut index = deployment.current_step;

        if let Some(name) = deployment.current_step_name.clone() {
            let at_index = pipeline.step(index).map(|s| s.name() == name).unwrap_or(false);
            if !at_index {
                match pipeline.position(&name) {
                    Some(position) => {
                        journal
                            .warn(
                                None,
                                format!("Step {} moved from index {} to {}", name, index, position),
                            )
                            .await;
                        index = position;
                    }
                    None => {
                        return Err(ProvisionError::StateError(format!(
                            "Step {} of deployment {} is not part of the pipeline",
                            name, deployment.id
                        )));
                    }
                }
            }
        }

        deployment.total_steps = pipeline.len();
        let index = index.min(pipeline.len());
        let name = pipeline.step(index).map(|s| s.name());
        deployment.set_current_step(index, name)
    }

    async fn drive(
        &self,
        mut deployment: Deployment,
        pipeline: Pipeline,
        mut control: ControlReceiver,
    ) -> Result<RunSummary, ProvisionError> {
        let journal = self.journal(&deployment.id);
        self.align(&mut deployment, &pipeline, &journal).await?;

        deployment.transition(DeploymentStatus::Running)?;
        deployment.verification = VerificationFlags::default();
        self.store.save(&deployment).await?;

        journal
            .info(
                None,
                format!(
                    "Deploying to {}@{}:{} ({}) from step {}/{}",
                    deployment.server.username,
                    deployment.server.hostname,
                    deployment.server.port,
                    deployment.server.domain,
                    deployment.current_step,
                    deployment.total_steps
                ),
            )
            .await;

        let connected = tokio::select! {
            result = self.connector.connect(&deployment.server) => Some(result),
            _ = cancel_requested(&mut control) => None,
        };

        let ending = match connected {
            None => Ending::Cancelled,
            Some(Err(e)) => {
                journal.error(Some(CONNECT_STEP), format!("Connection failed: {}", e)).await;
                let error = e.to_string();
                deployment.record_error(format!("{}: {}", CONNECT_STEP, error));
                Ending::Failed(StepFailure {
                    step: CONNECT_STEP.to_string(),
                    error,
                    classification: None,
                    attempts: 1,
                })
            }
            Some(Ok(session)) => {
                let ending = self
                    .execute(&mut deployment, &pipeline, session.as_ref(), &journal, &mut control)
                    .await;
                if let Err(e) = session.close().await {
                    journal.warn(None, format!("Failed to close session: {}", e)).await;
                }
                ending?
            }
        };

        self.finish(deployment, ending, &journal).await
    }

    /// Run the remaining steps and verification on an open session
    async fn execute(
        &self,
        deployment: &mut Deployment,
        pipeline: &Pipeline,
        session: &dyn RemoteSession,
        journal: &Journal,
        control: &mut ControlReceiver,
    ) -> Result<Ending, ProvisionError> {
        let mut classifier = ErrorClassifier::new(self.patterns.clone());

        while let Some(step) = pipeline.step(deployment.current_step) {
            let signal = *control.borrow();
            match signal {
                RunControl::Pause => return Ok(Ending::Paused),
                RunControl::Cancel => return Ok(Ending::Cancelled),
                RunControl::Continue => {}
            }

            let index = deployment.current_step;
            match self
                .run_step(step, session, &mut classifier, deployment, journal, control)
                .await?
            {
                StepOutcome::Succeeded => {
                    let next = index + 1;
                    deployment.set_current_step(next, pipeline.step(next).map(|s| s.name()))?;
                    self.store.save(deployment).await?;
                }
                StepOutcome::Failed(failure) => return Ok(Ending::Failed(failure)),
                StepOutcome::Cancelled => return Ok(Ending::Cancelled),
            }
        }

        let report = tokio::select! {
            report = self.verifier.verify(session, &deployment.server, deployment.mode, journal) => report,
            _ = cancel_requested(control) => return Ok(Ending::Cancelled),
        };
        Ok(Ending::Verified(report))
    }

    /// Run one step until it succeeds or its attempts are exhausted
    async fn run_step(
        &self,
        step: &PipelineStep,
        session: &dyn RemoteSession,
        classifier: &mut ErrorClassifier,
        deployment: &mut Deployment,
        journal: &Journal,
        control: &mut ControlReceiver,
    ) -> Result<StepOutcome, ProvisionError> {
        let name = step.name();
        let mut fsm = StepFsm::new(self.settings.pipeline.max_retries);

        fsm.process(StepEvent::Start).map_err(ProvisionError::StateError)?;

        loop {
            journal
                .info(
                    Some(name),
                    format!(
                        "Running {} (attempt {}/{}): {}",
                        name,
                        fsm.attempts(),
                        fsm.max_attempts(),
                        step.descriptor.description
                    ),
                )
                .await;

            let attempt = tokio::select! {
                result = self.attempt(step, session, journal) => result,
                _ = cancel_requested(control) => {
                    journal.warn(Some(name), "Cancelled while running").await;
                    return Ok(StepOutcome::Cancelled);
                }
            };

            let failure = match attempt {
                Ok(()) => {
                    fsm.process(StepEvent::Succeed).map_err(ProvisionError::StateError)?;
                    journal.info(Some(name), format!("Step {} succeeded", name)).await;
                    return Ok(StepOutcome::Succeeded);
                }
                Err(failure) => failure,
            };

            let error = failure.describe();
            fsm.process(StepEvent::Fail(error.clone()))
                .map_err(ProvisionError::StateError)?;
            deployment.record_error(format!("{}: {}", name, error));
            self.store.save(deployment).await?;

            let output = match failure {
                AttemptError::Connection(e) => {
                    journal
                        .error(Some(name), format!("Connection lost during {}: {}", name, e))
                        .await;
                    fsm.process(StepEvent::GiveUp).map_err(ProvisionError::StateError)?;
                    return Ok(StepOutcome::Failed(StepFailure {
                        step: name.to_string(),
                        error,
                        classification: None,
                        attempts: fsm.attempts(),
                    }));
                }
                AttemptError::Command { output, .. } => output,
            };
            journal.warn(Some(name), format!("Attempt {} failed: {}", fsm.attempts(), error)).await;

            // Only failed commands reach the classifier
            let text = output.failure_text();
            for pattern in classifier.classify(text) {
                journal
                    .warn(Some(name), format!("Detected: {}", pattern.summary()))
                    .await;
            }
            let matched: Vec<ErrorPattern> = classifier.matches(text).into_iter().cloned().collect();
            // Describes this attempt's failure only
            let classification: Option<Classification> = matched.first().map(ErrorPattern::summary);
            for pattern in &matched {
                fsm.limit_attempts(pattern.max_retry_hint);
            }

            if !fsm.can_retry() {
                fsm.process(StepEvent::GiveUp).map_err(ProvisionError::StateError)?;
                journal
                    .error(
                        Some(name),
                        format!("Step {} failed after {} attempts", name, fsm.attempts()),
                    )
                    .await;
                return Ok(StepOutcome::Failed(StepFailure {
                    step: name.to_string(),
                    error,
                    classification,
                    attempts: fsm.attempts(),
                }));
            }

            if deployment.auto_recovery {
                fsm.process(StepEvent::Recover).map_err(ProvisionError::StateError)?;

                let actions = recovery_plan(&matched, self.step_recovery.actions_for(name));
                if actions.is_empty() {
                    journal.warn(Some(name), "No recovery routine applies").await;
                } else {
                    let recovered = tokio::select! {
                        recovered = self.dispatcher.recover_chain(&actions, session, journal, name) => recovered,
                        _ = cancel_requested(control) => return Ok(StepOutcome::Cancelled),
                    };
                    match recovered {
                        Some(action) => deployment.add_warning(format!("{}: recovered with {}", name, action)),
                        None => {
                            journal
                                .warn(Some(name), "Recovery did not resolve the failure, retrying anyway")
                                .await
                        }
                    }
                }
            }

            let delay = self.retry_delay(fsm.attempts());
            if !delay.is_zero() {
                debug!("Retrying {} in {:?}", name, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel_requested(control) => return Ok(StepOutcome::Cancelled),
                }
            }

            fsm.process(StepEvent::Retry).map_err(ProvisionError::StateError)?;
        }
    }

    /// Uploads, then every command in order; the first failure ends the attempt
    async fn attempt(
        &self,
        step: &PipelineStep,
        session: &dyn RemoteSession,
        journal: &Journal,
    ) -> Result<(), AttemptError> {
        let name = step.name();

        for upload in &step.uploads {
            if let Err(e) = session.upload(&upload.local, &upload.remote).await {
                if e.is_connection() {
                    return Err(AttemptError::Connection(e));
                }
                return Err(AttemptError::Command {
                    command: format!("upload {} -> {}", upload.local.display(), upload.remote),
                    output: error_output(&e),
                });
            }
        }

        let sink: Arc<dyn OutputSink> = Arc::new(JournalSink::new(journal.clone(), Some(name)));
        let timeout = self.settings.ssh.command_timeout();

        for command in &step.commands {
            journal.debug(Some(name), format!("$ {}", command)).await;
            match session.execute(command, timeout, sink.clone()).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    return Err(AttemptError::Command {
                        command: command.clone(),
                        output,
                    });
                }
                Err(e) if e.is_connection() => return Err(AttemptError::Connection(e)),
                Err(e) => {
                    return Err(AttemptError::Command {
                        command: command.clone(),
                        output: error_output(&e),
                    });
                }
            }
        }
        Ok(())
    }

    fn retry_delay(&self, attempts: u32) -> Duration {
        let base = self.settings.pipeline.retry_delay();
        let options = CooldownOptions {
            base_delay: base,
            max_delay: Duration::from_secs(60).max(base),
            multiplier: 2.0,
        };
        calc_exp_backoff(&options, attempts.saturating_sub(1))
    }

    /// Apply the ending to the record, escalate failures and persist
    async fn finish(
        &self,
        mut deployment: Deployment,
        ending: Ending,
        journal: &Journal,
    ) -> Result<RunSummary, ProvisionError> {
        let summary = match ending {
            Ending::Verified(report) => {
                deployment.verification = report.flags();
                if report.passed() {
                    deployment.transition(DeploymentStatus::Success)?;
                    self.store.save(&deployment).await?;
                    journal
                        .info(None, format!("Deployment {} succeeded", deployment.id))
                        .await;
                    RunSummary::new(&deployment, RunOutcome::Success)
                } else {
                    let error = format!("Verification failed: {}", report.failures.join("; "));
                    deployment.record_error(error.clone());
                    let failure = StepFailure {
                        step: VERIFICATION_STEP.to_string(),
                        error,
                        classification: None,
                        attempts: 1,
                    };
                    self.fail(&mut deployment, &failure, journal).await?;
                    RunSummary::new(&deployment, RunOutcome::PartialSuccess)
                        .with_failure(&failure.step, None)
                }
            }
            Ending::Failed(failure) => {
                self.fail(&mut deployment, &failure, journal).await?;
                RunSummary::new(&deployment, RunOutcome::Failed)
                    .with_failure(&failure.step, failure.classification.clone())
            }
            Ending::Paused => {
                deployment.transition(DeploymentStatus::Paused)?;
                self.store.save(&deployment).await?;
                journal
                    .info(
                        None,
                        format!(
                            "Deployment {} paused before step {}/{}",
                            deployment.id, deployment.current_step, deployment.total_steps
                        ),
                    )
                    .await;
                return Ok(RunSummary::new(&deployment, RunOutcome::Paused));
            }
            Ending::Cancelled => {
                deployment.transition(DeploymentStatus::Cancelled)?;
                self.store.save(&deployment).await?;
                journal
                    .warn(None, format!("Deployment {} cancelled", deployment.id))
                    .await;
                return Ok(RunSummary::new(&deployment, RunOutcome::Cancelled));
            }
        };

        let url = format!("{}://{}", self.settings.verification.scheme, deployment.server.domain);
        self.reporter
            .post_status(deployment.status, Some(&url), journal)
            .await;
        Ok(summary)
    }

    /// Mark the record failed, persist it, then escalate
    async fn fail(
        &self,
        deployment: &mut Deployment,
        failure: &StepFailure,
        journal: &Journal,
    ) -> Result<(), ProvisionError> {
        deployment.last_error = Some(failure.error.clone());
        deployment.transition(DeploymentStatus::Failed)?;
        self.store.save(deployment).await?;
        journal
            .error(
                Some(failure.step.as_str()),
                format!("Deployment {} failed at {}", deployment.id, failure.step),
            )
            .await;

        let report = FailureReport::new(
            deployment,
            &failure.step,
            &failure.error,
            failure.classification.clone(),
            failure.attempts,
            journal.tail(self.reporter.settings().log_tail_lines),
        );
        let record = self.reporter.escalate(&report, journal).await;
        deployment.escalation = Some(record);
        self.store.save(deployment).await
    }
}

/// Pattern actions first, then the step's own chain, without repeats
fn recovery_plan(matched: &[ErrorPattern], step_actions: &[RecoveryAction]) -> Vec<RecoveryAction> {
    let mut plan: Vec<RecoveryAction> = Vec::new();
    for action in matched.iter().map(|p| p.action).chain(step_actions.iter().copied()) {
        if !plan.contains(&action) {
            plan.push(action);
        }
    }
    plan
}

/// A local error presented as failed command output
fn error_output(error: &ProvisionError) -> CommandOutput {
    CommandOutput {
        exit_code: -1,
        stdout: String::new(),
        stderr: error.to_string(),
    }
}
