//! Finite state machine for one pipeline step

use serde::{Deserialize, Serialize};

/// Step state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Not attempted yet
    NotStarted,

    /// An attempt is executing
    Running,

    /// Last attempt exited zero
    Succeeded,

    /// Last attempt failed, decision pending
    Failed,

    /// Recovery routines are running between attempts
    Recovering,

    /// Attempts exhausted; the pipeline halts
    FatallyFailed,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Succeeded | StepState::FatallyFailed)
    }
}

/// Step event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepEvent {
    /// First attempt begins
    Start,

    /// Attempt exited zero
    Succeed,

    /// Attempt failed
    Fail(String),

    /// Begin recovery before the next attempt
    Recover,

    /// Begin the next attempt
    Retry,

    /// Stop trying
    GiveUp,
}

/// Step FSM
#[derive(Debug, Clone)]
pub struct StepFsm {
    state: StepState,
    error: Option<String>,
    attempts: u32,
    max_attempts: u32,
}

impl StepFsm {
    /// New FSM allowing `max_retries` attempts after the first
    pub fn new(max_retries: u32) -> Self {
        Self {
            state: StepState::NotStarted,
            error: None,
            attempts: 0,
            max_attempts: max_retries.saturating_add(1),
        }
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Attempts started so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Lower the attempt ceiling; a hint never raises it
    pub fn limit_attempts(&mut self, hint: u32) {
        self.max_attempts = self.max_attempts.min(hint.max(1));
    }

    /// Whether another attempt is allowed
    pub fn can_retry(&self) -> bool {
        matches!(self.state, StepState::Failed | StepState::Recovering)
            && self.attempts < self.max_attempts
    }

    /// Process an event and transition state
    pub fn process(&mut self, event: StepEvent) -> Result<StepState, String> {
        let can_retry = self.can_retry();

        let new_state = match (self.state, &event) {
            (StepState::NotStarted, StepEvent::Start) => {
                self.attempts = 1;
                StepState::Running
            }

            (StepState::Running, StepEvent::Succeed) => {
                self.error = None;
                StepState::Succeeded
            }
            (StepState::Running, StepEvent::Fail(err)) => {
                self.error = Some(err.clone());
                StepState::Failed
            }

            (StepState::Failed, StepEvent::Recover) if can_retry => StepState::Recovering,
            (StepState::Failed, StepEvent::Retry) | (StepState::Recovering, StepEvent::Retry)
                if can_retry =>
            {
                self.attempts += 1;
                StepState::Running
            }

            (StepState::Failed, StepEvent::GiveUp) | (StepState::Recovering, StepEvent::GiveUp) => {
                StepState::FatallyFailed
            }

            (state, event) => {
                return Err(format!(
                    "Invalid transition: {:?} -> {:?} (attempt {}/{})",
                    state, event, self.attempts, self.max_attempts
                ));
            }
        };

        self.state = new_state;
        Ok(new_state)
    }
}
