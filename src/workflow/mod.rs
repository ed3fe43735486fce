//! Provisioning and hub session workflows
//!
//! - [`provisioning`] - registration handshake coordinator
//! - [`session`] - hub session coordinator and telemetry counters
//! - [`telemetry`] - telemetry sources for periodic sends
//! - [`orchestrator`] - sequencing of both phases behind one API

pub mod orchestrator;
pub mod provisioning;
pub mod session;
pub mod telemetry;

pub use orchestrator::{channel_message_handler, WorkflowOrchestrator, WorkflowOutcome};
pub use provisioning::{ProvisioningCoordinator, ProvisioningState, Rejection};
pub use session::{
    AckCallback, HubMessageHandler, SessionCoordinator, SessionHandle, SessionPhase, SessionState,
};
pub use telemetry::{IntervalTelemetrySource, TelemetrySource};
