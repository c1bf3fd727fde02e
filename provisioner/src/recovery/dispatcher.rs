//! Recovery dispatcher

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::journal::{Journal, JournalSink};
use crate::recovery::actions::{default_routines, RecoveryAction, RecoveryRoutine};
use crate::remote::session::RemoteSession;
use crate::remote::stream::OutputSink;

/// Runs recovery routines against a session
#[derive(Debug, Clone)]
pub struct RecoveryDispatcher {
    routines: HashMap<RecoveryAction, RecoveryRoutine>,
    command_timeout: Duration,
}

impl RecoveryDispatcher {
    pub fn new(routines: HashMap<RecoveryAction, RecoveryRoutine>, command_timeout: Duration) -> Self {
        Self {
            routines,
            command_timeout,
        }
    }

    pub fn with_defaults(command_timeout: Duration) -> Self {
        Self::new(default_routines(), command_timeout)
    }

    /// Run the routine for `action`.
    ///
    /// Intermediate command failures are logged and skipped; the outcome is
    /// decided by the routine's verification command alone.
    pub async fn recover(
        &self,
        action: RecoveryAction,
        session: &dyn RemoteSession,
        journal: &Journal,
        step: &str,
    ) -> bool {
        let Some(routine) = self.routines.get(&action) else {
            journal
                .warn(Some(step), format!("No recovery routine registered for {}", action))
                .await;
            return false;
        };

        journal
            .warn(Some(step), format!("Attempting recovery: {}", action))
            .await;

        let sink: Arc<dyn OutputSink> = Arc::new(JournalSink::new(journal.clone(), Some(step)));

        for command in &routine.commands {
            match session.execute(command, self.command_timeout, sink.clone()).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    journal
                        .debug(
                            Some(step),
                            format!("Recovery command exited {}: {}", output.exit_code, command),
                        )
                        .await;
                }
                Err(e) => {
                    journal
                        .warn(Some(step), format!("Recovery command failed: {}: {}", command, e))
                        .await;
                    if e.is_connection() {
                        return false;
                    }
                }
            }
        }

        let recovered = match session
            .execute(&routine.verify, self.command_timeout, sink)
            .await
        {
            Ok(output) => output.success(),
            Err(e) => {
                journal
                    .warn(Some(step), format!("Recovery verification failed to run: {}", e))
                    .await;
                false
            }
        };

        if recovered {
            journal
                .info(Some(step), format!("Recovery {} succeeded", action))
                .await;
        } else {
            journal
                .warn(Some(step), format!("Recovery {} did not resolve the issue", action))
                .await;
        }
        recovered
    }

    /// Try `actions` in order, stopping at the first that succeeds
    pub async fn recover_chain(
        &self,
        actions: &[RecoveryAction],
        session: &dyn RemoteSession,
        journal: &Journal,
        step: &str,
    ) -> Option<RecoveryAction> {
        for action in actions {
            if self.recover(*action, session, journal, step).await {
                return Some(*action);
            }
        }
        None
    }
}
