//! Operator control of a running deployment

use tokio::sync::watch;

/// Signal sent to a running deployment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunControl {
    #[default]
    Continue,

    /// Stop before the next step; the deployment stays resumable
    Pause,

    /// Stop now; the in-flight command is abandoned
    Cancel,
}

/// Sending half, held by the operator side
pub type ControlSender = watch::Sender<RunControl>;

/// Receiving half, handed to the controller
pub type ControlReceiver = watch::Receiver<RunControl>;

pub fn control_channel() -> (ControlSender, ControlReceiver) {
    watch::channel(RunControl::Continue)
}

/// Resolves once cancellation is requested. Never resolves if the sender is
/// dropped without cancelling.
pub async fn cancel_requested(control: &mut ControlReceiver) {
    loop {
        if *control.borrow_and_update() == RunControl::Cancel {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
