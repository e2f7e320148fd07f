use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::session::{Session, SessionState, StopReason};
use crate::data_capture::CapturedFlow;
use crate::environment::types::{EnvironmentKind, EnvironmentSpec, HandleState};
use crate::proxy::types::{DrainReport, ProxyConfig};
use crate::screen_relay::RelayStats;

/// Everything needed to bring up one session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    /// Package or bundle under test. Only carried into reports.
    pub app_target: String,
    pub environment: EnvironmentSpec,
    pub proxy: Arc<ProxyConfig>,
    pub screen_endpoint: Option<(IpAddr, u16)>,
    /// Overrides the environment timeout as test budget.
    pub deadline: Option<Duration>,
}

/// Per-process defaults every request is built from.
#[derive(Debug, Clone)]
pub struct SessionTemplate {
    pub environment: EnvironmentSpec,
    pub proxy: Arc<ProxyConfig>,
    pub screen_endpoint: Option<(IpAddr, u16)>,
}

impl SessionTemplate {
    pub fn request(&self, app_target: impl Into<String>, deadline: Option<Duration>) -> SessionRequest {
        SessionRequest {
            app_target: app_target.into(),
            environment: self.environment.clone(),
            proxy: Arc::clone(&self.proxy),
            screen_endpoint: self.screen_endpoint,
            deadline,
        }
    }
}

/// Outcome of a session, produced exactly once per session.
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub session_id: Uuid,
    pub app_target: String,
    pub stop_reason: StopReason,
    pub state: SessionState,
    pub traffic_log: Vec<CapturedFlow>,
    pub environment_log: String,
    pub screen_endpoint_closed: bool,
    /// `"<FailureKind>: <detail>"`, in the order the steps ran.
    pub failures: Vec<String>,
    pub environment_state: Option<HandleState>,
    pub drain: Option<DrainReport>,
    pub screen: Option<RelayStats>,
    pub stopped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub app_target: String,
    pub environment: String,
    pub environment_kind: EnvironmentKind,
    pub proxy_endpoint: String,
    pub state: SessionState,
    pub deadline_secs: u64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id,
            app_target: session.app_target.clone(),
            environment: session.environment.identifier().to_string(),
            environment_kind: session.environment.kind(),
            proxy_endpoint: session.proxy.listen_addr().to_string(),
            state: session.state,
            deadline_secs: session.deadline.as_secs(),
            created_at: session.created_at,
            started_at: session.started_at,
            ended_at: session.ended_at,
        }
    }
}
