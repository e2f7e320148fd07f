//! Session lifecycle: ordered setup, the timed test run and best-effort teardown.

pub mod active_session;
pub mod coordinator;
pub mod session;
pub mod teardown;
pub mod types;

#[cfg(test)]
mod tests;

pub use active_session::ActiveSession;
pub use coordinator::{SessionComponents, SessionCoordinator};
pub use session::{Session, SessionState, StopReason};
pub use types::{SessionRequest, SessionSummary, SessionTemplate, StopReport};
