//! Scripted collaborators shared by the integration tests

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use provisioner::errors::ProvisionError;
use provisioner::escalation::report::FailureReport;
use provisioner::escalation::tracker::Tracker;
use provisioner::filesys::dir::Dir;
use provisioner::models::deployment::{
    CredentialRef, DeploymentDescriptor, DeploymentMode, DeploymentStatus, ServerDescriptor,
};
use provisioner::models::step::PipelineStep;
use provisioner::pipeline::controller::PipelineController;
use provisioner::pipeline::plan::Pipeline;
use provisioner::recovery::actions::StepRecoveryMap;
use provisioner::remote::session::{CommandOutput, RemoteSession, SessionConnector};
use provisioner::remote::stream::{OutputSink, StreamKind};
use provisioner::storage::settings::Settings;
use provisioner::storage::state::DeploymentStore;

/// What the scripted host does for a command
#[derive(Debug, Clone)]
pub enum Reply {
    Output(CommandOutput),
    ConnectionLost,
    Hang,
}

pub fn ok(stdout: &str) -> Reply {
    Reply::Output(CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    })
}

pub fn fail(exit_code: i32, stderr: &str) -> Reply {
    Reply::Output(CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.to_string(),
    })
}

struct Rule {
    needle: String,
    replies: VecDeque<Reply>,
}

/// In-memory host. Commands are matched against rules by substring in the
/// order the rules were added; a rule's last reply repeats forever.
/// Unmatched commands succeed with no output.
#[derive(Default)]
pub struct ScriptedSession {
    rules: Mutex<Vec<Rule>>,
    executed: Mutex<Vec<String>>,
    uploads: Mutex<Vec<(PathBuf, String)>>,
    closes: AtomicUsize,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Session whose loopback and endpoint checks answer 200
    pub fn serving() -> Self {
        Self::new().on("curl", ok("200"))
    }

    pub fn on(self, needle: &str, reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|r| r.needle == needle) {
                Some(rule) => rule.replies.push_back(reply),
                None => rules.push(Rule {
                    needle: needle.to_string(),
                    replies: VecDeque::from([reply]),
                }),
            }
        }
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }

    /// How many executed commands contain `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.executed().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn uploads(&self) -> Vec<(PathBuf, String)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn reply_for(&self, command: &str) -> Reply {
        let mut rules = self.rules.lock().unwrap();
        match rules.iter_mut().find(|r| command.contains(&r.needle)) {
            Some(rule) if rule.replies.len() > 1 => rule.replies.pop_front().unwrap(),
            Some(rule) => rule.replies.front().cloned().unwrap(),
            None => ok(""),
        }
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn execute(
        &self,
        command: &str,
        _timeout: Duration,
        sink: Arc<dyn OutputSink>,
    ) -> Result<CommandOutput, ProvisionError> {
        self.executed.lock().unwrap().push(command.to_string());

        match self.reply_for(command) {
            Reply::Output(output) => {
                for line in output.stdout.lines() {
                    sink.line(StreamKind::Stdout, line).await;
                }
                for line in output.stderr.lines() {
                    sink.line(StreamKind::Stderr, line).await;
                }
                Ok(output)
            }
            Reply::ConnectionLost => Err(ProvisionError::ConnectionError("connection reset by peer".to_string())),
            Reply::Hang => std::future::pending().await,
        }
    }

    async fn upload(&self, local_path: &Path, remote_path: &str) -> Result<(), ProvisionError> {
        self.uploads
            .lock()
            .unwrap()
            .push((local_path.to_path_buf(), remote_path.to_string()));
        Ok(())
    }

    async fn close(&self) -> Result<(), ProvisionError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out the same scripted session, or refuses to connect
pub struct ScriptedConnector {
    session: Arc<ScriptedSession>,
    refuse: bool,
    pub connects: AtomicUsize,
}

impl ScriptedConnector {
    pub fn new(session: Arc<ScriptedSession>) -> Self {
        Self {
            session,
            refuse: false,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn refusing(session: Arc<ScriptedSession>) -> Self {
        Self {
            refuse: true,
            ..Self::new(session)
        }
    }
}

#[async_trait]
impl SessionConnector for ScriptedConnector {
    async fn connect(&self, server: &ServerDescriptor) -> Result<Arc<dyn RemoteSession>, ProvisionError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(ProvisionError::AuthError(format!(
                "Permission denied (publickey) for {}@{}",
                server.username, server.hostname
            )));
        }
        Ok(self.session.clone())
    }
}

/// Remembers everything filed with it
#[derive(Default)]
pub struct RecordingTracker {
    pub broken: bool,
    pub issues: Mutex<Vec<FailureReport>>,
    pub prs: Mutex<Vec<(String, FailureReport)>>,
    pub statuses: Mutex<Vec<DeploymentStatus>>,
}

impl RecordingTracker {
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn issues(&self) -> Vec<FailureReport> {
        self.issues.lock().unwrap().clone()
    }

    pub fn prs(&self) -> Vec<(String, FailureReport)> {
        self.prs.lock().unwrap().clone()
    }

    pub fn statuses(&self) -> Vec<DeploymentStatus> {
        self.statuses.lock().unwrap().clone()
    }
}

#[async_trait]
impl Tracker for RecordingTracker {
    async fn create_failure_issue(&self, report: &FailureReport) -> Result<Option<String>, ProvisionError> {
        if self.broken {
            return Err(ProvisionError::EscalationError("tracker unauthenticated".to_string()));
        }
        let mut issues = self.issues.lock().unwrap();
        issues.push(report.clone());
        Ok(Some(format!("ISSUE-{}", issues.len())))
    }

    async fn create_failure_pr(
        &self,
        report: &FailureReport,
        branch: &str,
    ) -> Result<Option<String>, ProvisionError> {
        if self.broken {
            return Err(ProvisionError::EscalationError("tracker unauthenticated".to_string()));
        }
        let mut prs = self.prs.lock().unwrap();
        prs.push((branch.to_string(), report.clone()));
        Ok(Some(format!("PR-{}", prs.len())))
    }

    async fn post_status(&self, status: DeploymentStatus, _url: Option<&str>) -> Result<(), ProvisionError> {
        if self.broken {
            return Err(ProvisionError::EscalationError("tracker unauthenticated".to_string()));
        }
        self.statuses.lock().unwrap().push(status);
        Ok(())
    }
}

pub fn descriptor() -> DeploymentDescriptor {
    DeploymentDescriptor {
        server: ServerDescriptor {
            hostname: "203.0.113.10".to_string(),
            port: 22,
            username: "root".to_string(),
            credential: CredentialRef::PasswordEnv {
                var: "TARGET_PASSWORD".to_string(),
            },
            domain: "shop.example.com".to_string(),
        },
        mode: DeploymentMode::Standard,
        auto_recovery: true,
    }
}

/// Settings with no retry delay and a single service to check
pub fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.pipeline.retry_delay_ms = 0;
    settings.verification.check_timeout_secs = 1;
    settings.verification.services = vec!["nginx".to_string()];
    settings
}

/// step1 -> step2 -> step3, one command each
pub fn three_steps() -> Pipeline {
    Pipeline::new(vec![
        PipelineStep::new("step1", "First step", vec!["run-step-one".to_string()]),
        PipelineStep::new("step2", "Second step", vec!["run-step-two".to_string()]),
        PipelineStep::new("step3", "Third step", vec!["run-step-three".to_string()]),
    ])
}

/// A controller wired to scripted collaborators over a temporary state dir
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub session: Arc<ScriptedSession>,
    pub connector: Arc<ScriptedConnector>,
    pub tracker: Arc<RecordingTracker>,
    pub controller: PipelineController,
}

impl Harness {
    pub fn new(session: ScriptedSession) -> Self {
        Self::build(session, settings(), false, RecordingTracker::default())
    }

    pub fn build(session: ScriptedSession, settings: Settings, refuse: bool, tracker: RecordingTracker) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let session = Arc::new(session);
        let connector = Arc::new(if refuse {
            ScriptedConnector::refusing(session.clone())
        } else {
            ScriptedConnector::new(session.clone())
        });
        let tracker = Arc::new(tracker);
        let store = DeploymentStore::new(Dir::new(dir.path().join("deployments")));

        let controller = PipelineController::new(settings, connector.clone(), store, tracker.clone())
            .unwrap()
            .with_step_recovery(StepRecoveryMap::new());

        Self {
            dir,
            session,
            connector,
            tracker,
            controller,
        }
    }

    pub fn store(&self) -> &DeploymentStore {
        self.controller.store()
    }
}
