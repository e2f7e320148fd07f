//! Reverse-order, best-effort unwinding of session resources.
//!
//! Every step runs even when an earlier one failed; failures are collected as
//! `"<FailureKind>: <detail>"` strings for the stop report.

use std::fmt::Display;
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use super::active_session::{ActiveSession, SessionResources};
use super::coordinator::SessionComponents;
use super::session::{SessionState, StopReason};
use super::types::StopReport;
use crate::data_capture::CapturedFlow;
use crate::environment::types::HandleState;
use crate::error_handling::types::{FailureKind, ProxyError, ScreenError, SessionError};
use crate::proxy::types::DrainReport;
use crate::screen_relay::RelayStats;

pub(crate) fn failure(kind: FailureKind, err: impl Display) -> String {
    format!("{}: {}", kind, err)
}

#[derive(Debug, Default)]
struct Unwound {
    failures: Vec<String>,
    traffic_log: Vec<CapturedFlow>,
    environment_log: String,
    screen_endpoint_closed: bool,
    environment_state: Option<HandleState>,
    drain: Option<DrainReport>,
    screen: Option<RelayStats>,
}

/// Stops the session once. Later and concurrent callers get the first report.
pub(crate) async fn stop_once(
    components: Arc<SessionComponents>,
    active: Arc<ActiveSession>,
    reason: StopReason,
) -> Result<StopReport, SessionError> {
    if let Some(report) = active.report() {
        return Ok(report.clone());
    }
    let state = active.state();
    if state.is_setting_up() {
        return Err(SessionError::InvalidTransition {
            from: state,
            to: SessionState::Stopping,
        });
    }

    let session = Arc::clone(&active);
    let report = active
        .report
        .get_or_init(|| async move {
            // Detached so a dropped caller cannot cut the teardown short.
            let task = tokio::spawn(tear_down(components, Arc::clone(&session), reason));
            match task.await {
                Ok(report) => report,
                Err(e) => {
                    error!("[{}] teardown task failed: {}", session.id(), e);
                    let _ = session.transition(SessionState::Failed(FailureKind::Internal));
                    let snapshot = session.snapshot();
                    StopReport {
                        session_id: snapshot.id,
                        app_target: snapshot.app_target,
                        stop_reason: reason,
                        state: snapshot.state,
                        traffic_log: Vec::new(),
                        environment_log: String::new(),
                        screen_endpoint_closed: false,
                        failures: vec![failure(FailureKind::Internal, e)],
                        environment_state: None,
                        drain: None,
                        screen: None,
                        stopped_at: Utc::now(),
                    }
                }
            }
        })
        .await;
    Ok(report.clone())
}

async fn tear_down(
    components: Arc<SessionComponents>,
    active: Arc<ActiveSession>,
    reason: StopReason,
) -> StopReport {
    let id = active.id();
    if let Err(e) = active.transition(SessionState::Stopping) {
        warn!("[{}] {}", id, e);
    }
    active.disarm.send_replace(true);
    info!("[{}] tearing down ({})", id, reason);

    let resources = std::mem::take(&mut *active.resources.lock().await);
    let unwound = unwind(&components, id, resources, true).await;

    if let Err(e) = active.transition(SessionState::TornDown) {
        warn!("[{}] {}", id, e);
    }
    if unwound.failures.is_empty() {
        info!("[{}] torn down cleanly", id);
    } else {
        warn!(
            "[{}] torn down with {} failure(s): {:?}",
            id,
            unwound.failures.len(),
            unwound.failures
        );
    }
    build_report(&active, reason, unwound)
}

/// Marks the session failed and undoes the setup steps that completed.
pub(crate) async fn fail_setup(
    components: &SessionComponents,
    active: &ActiveSession,
    err: &SessionError,
) -> StopReport {
    let id = active.id();
    let kind = err.kind();
    error!("[{}] setup failed in {}: {}", id, active.state(), err);
    if let Err(e) = active.transition(SessionState::Failed(kind)) {
        warn!("[{}] {}", id, e);
    }
    active.disarm.send_replace(true);

    let resources = std::mem::take(&mut *active.resources.lock().await);
    let mut unwound = unwind(components, id, resources, false).await;
    unwound.failures.insert(0, failure(kind, err));
    build_report(active, StopReason::SetupFailed, unwound)
}

fn build_report(active: &ActiveSession, reason: StopReason, unwound: Unwound) -> StopReport {
    let session = active.snapshot();
    StopReport {
        session_id: session.id,
        app_target: session.app_target,
        stop_reason: reason,
        state: session.state,
        traffic_log: unwound.traffic_log,
        environment_log: unwound.environment_log,
        screen_endpoint_closed: unwound.screen_endpoint_closed,
        failures: unwound.failures,
        environment_state: unwound.environment_state,
        drain: unwound.drain,
        screen: unwound.screen,
        stopped_at: Utc::now(),
    }
}

/// screen detach -> unroute -> proxy drain -> environment log -> environment release
async fn unwind(
    components: &SessionComponents,
    session_id: Uuid,
    mut resources: SessionResources,
    collect_logs: bool,
) -> Unwound {
    let mut out = Unwound {
        screen_endpoint_closed: true,
        ..Unwound::default()
    };
    if let Some(attach_failure) = resources.screen_failure.take() {
        out.failures.push(attach_failure);
    }

    if let Some(stream) = resources.screen.take() {
        match components.screen.detach(stream).await {
            Ok(stats) => out.screen = Some(stats),
            Err(e) => {
                warn!("[{}] screen detach: {}", session_id, e);
                if matches!(e, ScreenError::DetachTimeout(_)) {
                    out.screen_endpoint_closed = false;
                }
                out.failures.push(failure(FailureKind::StreamUnavailable, e));
            }
        }
    }

    if let Some(environment) = resources.environment.as_ref() {
        if let Err(e) = components.network.unroute(environment).await {
            warn!("[{}] unroute: {}", session_id, e);
            out.failures.push(failure(FailureKind::RoutingError, e));
        }
    }

    if let Some(listener) = resources.listener.take() {
        let traffic = listener.traffic();
        match components.proxies.stop(listener).await {
            Ok(drain) => out.drain = Some(drain),
            Err(e) => {
                warn!("[{}] proxy stop: {}", session_id, e);
                if let ProxyError::DrainTimeout(drain) = &e {
                    out.drain = Some(drain.clone());
                }
                out.failures.push(failure(e.kind(), e));
            }
        }
        out.traffic_log = traffic.snapshot().await;
    }

    if let Some(environment) = resources.environment.as_ref() {
        if collect_logs {
            match components.environments.collect_logs(environment).await {
                Ok(log) => out.environment_log = log,
                Err(e) => {
                    warn!("[{}] environment log: {}", session_id, e);
                    out.failures.push(failure(e.kind(), e));
                }
            }
        }
    }

    if let Some(mut environment) = resources.environment.take() {
        if let Err(e) = components.environments.release(&mut environment).await {
            error!("[{}] environment release: {}", session_id, e);
            out.failures.push(failure(e.kind(), e));
        }
        out.environment_state = Some(environment.state());
    }

    out
}
