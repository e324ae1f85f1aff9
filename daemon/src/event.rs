use tokio::sync::oneshot;

use crate::checker::CheckResult;
use crate::control::{ControlReply, Request};

/// Everything the control loop reacts to, delivered in arrival order.
pub enum DaemonEvent {
    /// A check started by the scheduler finished, failed, or was cancelled.
    /// `id` is the check's [`crate::checker::CheckHandle::id`].
    CheckFinished { id: u64, result: CheckResult },
    /// The upgrade terminal closed. Carries its exit code when it had one.
    UpgradeFinished { exit_code: Option<i32> },
    /// A control-socket request waiting for its reply.
    Control(Request, oneshot::Sender<ControlReply>),
    /// SIGTERM or SIGINT received; release everything and exit.
    Shutdown,
}
