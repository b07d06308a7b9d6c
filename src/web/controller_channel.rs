//! Messages between the web handlers and the machine task.

use crate::motion::controller::{CommandError, SupervisorCommand, SupervisorSnapshot};
use crate::telemetry::TelemetryEvent;
use tokio::sync::oneshot;

/// A request sent from a web handler to the machine task.
#[derive(Debug)]
pub enum ControllerRequest {
    GetStatus {
        respond_to: oneshot::Sender<SupervisorSnapshot>,
    },
    Command {
        command: SupervisorCommand,
        respond_to: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Set the planner target (center-relative) and switch to Jog.
    Jog {
        target: [f64; 3],
        respond_to: oneshot::Sender<Result<(), CommandError>>,
    },
    /// Take every telemetry event buffered since the last drain.
    DrainEvents {
        respond_to: oneshot::Sender<Vec<TelemetryEvent>>,
    },
    Shutdown,
}
