use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::data_capture::TrafficLogReader;
use crate::environment::types::EnvironmentSpec;
use crate::error_handling::types::{FailureKind, SessionError};
use crate::proxy::types::ProxyConfig;

/// Lifecycle of an analysis session.
///
/// Setup walks `Created -> AcquiringEnv -> Routing -> ProxyUp -> Ready`, the test
/// runs in `Running`, and `Stopping -> TornDown` is the teardown. `Failed` can be
/// entered from any state that is not terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason")]
pub enum SessionState {
    Created,
    AcquiringEnv,
    Routing,
    ProxyUp,
    Ready,
    Running,
    Stopping,
    TornDown,
    Failed(FailureKind),
}

impl SessionState {
    fn rank(&self) -> u8 {
        match self {
            SessionState::Created => 0,
            SessionState::AcquiringEnv => 1,
            SessionState::Routing => 2,
            SessionState::ProxyUp => 3,
            SessionState::Ready => 4,
            SessionState::Running => 5,
            SessionState::Stopping => 6,
            SessionState::TornDown => 7,
            SessionState::Failed(_) => 8,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::TornDown | SessionState::Failed(_))
    }

    /// True while setup is still running.
    pub fn is_setting_up(&self) -> bool {
        self.rank() < SessionState::Ready.rank()
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            SessionState::Failed(_) => true,
            // A session that never began its test can still be stopped.
            SessionState::Stopping => {
                matches!(self, SessionState::Ready | SessionState::Running)
            }
            _ => next.rank() == self.rank() + 1,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "CREATED"),
            SessionState::AcquiringEnv => write!(f, "ACQUIRING_ENV"),
            SessionState::Routing => write!(f, "ROUTING"),
            SessionState::ProxyUp => write!(f, "PROXY_UP"),
            SessionState::Ready => write!(f, "READY"),
            SessionState::Running => write!(f, "RUNNING"),
            SessionState::Stopping => write!(f, "STOPPING"),
            SessionState::TornDown => write!(f, "TORN_DOWN"),
            SessionState::Failed(kind) => write!(f, "FAILED({})", kind),
        }
    }
}

/// Why a session left `Running`/`Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopReason {
    Explicit,
    DeadlineExpired,
    SetupFailed,
    Shutdown,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopReason::Explicit => "Explicit",
            StopReason::DeadlineExpired => "DeadlineExpired",
            StopReason::SetupFailed => "SetupFailed",
            StopReason::Shutdown => "Shutdown",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub app_target: String,
    pub environment: EnvironmentSpec,
    pub proxy: Arc<ProxyConfig>,
    pub screen_endpoint: Option<(IpAddr, u16)>,
    pub state: SessionState,
    /// Test budget once `Running`. Falls back to the environment timeout.
    pub deadline: Duration,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub traffic: Option<TrafficLogReader>,
}

impl Session {
    pub fn new(
        app_target: String,
        environment: EnvironmentSpec,
        proxy: Arc<ProxyConfig>,
        screen_endpoint: Option<(IpAddr, u16)>,
        deadline: Option<Duration>,
    ) -> Self {
        let deadline = deadline.unwrap_or_else(|| environment.timeout());
        Self {
            id: Uuid::new_v4(),
            app_target,
            environment,
            proxy,
            screen_endpoint,
            state: SessionState::Created,
            deadline,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            traffic: None,
        }
    }

    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        match next {
            SessionState::Running => self.started_at = Some(Utc::now()),
            SessionState::TornDown | SessionState::Failed(_) => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }
}
