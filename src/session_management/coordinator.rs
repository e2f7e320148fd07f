use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use super::active_session::ActiveSession;
use super::session::{Session, SessionState, StopReason};
use super::teardown::{self, failure};
use super::types::{SessionRequest, SessionSummary, StopReport};
use crate::data_capture::CapturedFlow;
use crate::environment::EnvironmentController;
use crate::error_handling::types::{FailureKind, SessionError};
use crate::network::NetworkBridgeConfig;
use crate::proxy::ProxySessionManager;
use crate::screen_relay::ScreenRelay;

/// The components a session is assembled from. Shared by every session.
pub struct SessionComponents {
    pub environments: Arc<EnvironmentController>,
    pub network: Arc<NetworkBridgeConfig>,
    pub proxies: Arc<ProxySessionManager>,
    pub screen: Arc<ScreenRelay>,
}

/// Drives sessions through setup, the timed test run and teardown.
///
/// # Fields Overview
///
/// - `components`: environment controller, network bridge config, proxy session
///   manager and screen relay
/// - `sessions`: every session started by this coordinator, including finished
///   ones so their status and report stay queryable
pub struct SessionCoordinator {
    components: Arc<SessionComponents>,
    sessions: RwLock<HashMap<Uuid, Arc<ActiveSession>>>,
}

impl SessionCoordinator {
    pub fn new(components: SessionComponents) -> Self {
        Self {
            components: Arc::new(components),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn components(&self) -> &SessionComponents {
        &self.components
    }

    pub(crate) async fn lookup(&self, id: Uuid) -> Result<Arc<ActiveSession>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    /// Acquires, routes and proxies a new environment. Returns once the session is `Ready`.
    ///
    /// On failure the completed steps are undone, the session stays queryable as
    /// `Failed` and its stop report lists the failure.
    pub async fn start_session(&self, request: SessionRequest) -> Result<Uuid, SessionError> {
        let session = Session::new(
            request.app_target.clone(),
            request.environment.clone(),
            Arc::clone(&request.proxy),
            request.screen_endpoint,
            request.deadline,
        );
        let id = session.id;
        let active = Arc::new(ActiveSession::new(session));
        self.sessions.write().await.insert(id, Arc::clone(&active));
        info!(
            "[{}] starting session for {} on {}",
            id,
            request.app_target,
            request.environment.identifier()
        );

        // Detached so a dropped caller cannot strand a half-acquired environment.
        let components = Arc::clone(&self.components);
        let task = tokio::spawn(async move {
            match set_up(&components, &active, &request).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // A concurrent stop waits on the same cell for this report.
                    active
                        .report
                        .get_or_init(|| teardown::fail_setup(&components, &active, &e))
                        .await;
                    Err(e)
                }
            }
        });
        match task.await {
            Ok(Ok(())) => {
                info!("[{}] ready", id);
                Ok(id)
            }
            Ok(Err(e)) => Err(e),
            Err(e) => {
                error!("[{}] setup task failed: {}", id, e);
                Err(SessionError::SetupAborted(e.to_string()))
            }
        }
    }

    /// `Ready -> Running`; arms the deadline watchdog.
    pub async fn begin_test(&self, id: Uuid) -> Result<(), SessionError> {
        let active = self.lookup(id).await?;
        active.transition(SessionState::Running)?;
        let deadline = active.snapshot().deadline;
        info!("[{}] test running, deadline in {:?}", id, deadline);

        let components = Arc::clone(&self.components);
        let mut disarmed = active.disarm.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    warn!("[{}] deadline of {:?} expired", id, deadline);
                    if let Err(e) = teardown::stop_once(components, active, StopReason::DeadlineExpired).await {
                        warn!("[{}] deadline stop: {}", id, e);
                    }
                }
                _ = async { let _ = disarmed.wait_for(|d| *d).await; } => {
                    debug!("[{}] watchdog disarmed", id)
                }
            }
        });
        Ok(())
    }

    /// Tears the session down and returns its report. Idempotent.
    pub async fn stop_session(&self, id: Uuid) -> Result<StopReport, SessionError> {
        let active = self.lookup(id).await?;
        teardown::stop_once(Arc::clone(&self.components), active, StopReason::Explicit).await
    }

    pub async fn get_status(&self, id: Uuid) -> Result<SessionState, SessionError> {
        Ok(self.lookup(id).await?.state())
    }

    pub async fn session(&self, id: Uuid) -> Result<Session, SessionError> {
        Ok(self.lookup(id).await?.snapshot())
    }

    /// Summaries of all known sessions, oldest first.
    pub async fn sessions(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionSummary> = sessions
            .values()
            .map(|active| SessionSummary::from(&active.snapshot()))
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    /// Live flows of a session whose proxy is up.
    pub async fn subscribe_traffic(
        &self,
        id: Uuid,
    ) -> Result<broadcast::Receiver<CapturedFlow>, SessionError> {
        let session = self.session(id).await?;
        match (&session.traffic, session.state.is_terminal()) {
            (Some(traffic), false) => Ok(traffic.subscribe()),
            _ => Err(SessionError::NoTrafficLog {
                id,
                state: session.state,
            }),
        }
    }

    /// Stops every session that finished setup and is not torn down yet.
    pub async fn shutdown_all(&self) -> Vec<StopReport> {
        let active: Vec<Arc<ActiveSession>> = self.sessions.read().await.values().cloned().collect();
        let mut reports = Vec::new();
        for session in active {
            let state = session.state();
            if state.is_terminal() || state.is_setting_up() {
                continue;
            }
            match teardown::stop_once(Arc::clone(&self.components), session, StopReason::Shutdown)
                .await
            {
                Ok(report) => reports.push(report),
                Err(e) => warn!("shutdown: {}", e),
            }
        }
        info!("Shut down {} session(s)", reports.len());
        reports
    }
}

/// Acquire, route, proxy up and screen attach, in that order.
async fn set_up(
    components: &SessionComponents,
    active: &ActiveSession,
    request: &SessionRequest,
) -> Result<(), SessionError> {
    let id = active.id();
    let mut guard = active.resources.lock().await;
    let resources = &mut *guard;

    active.transition(SessionState::AcquiringEnv)?;
    let environment = components.environments.acquire(&request.environment).await?;
    let environment = resources.environment.insert(environment);

    active.transition(SessionState::Routing)?;
    let plan = components.network.route(environment, &request.proxy).await?;
    debug!("[{}] routed through {}", id, plan.proxy_endpoint);

    let listener = components
        .proxies
        .start(id, Arc::clone(&request.proxy))
        .await?;
    let traffic = listener.traffic();
    resources.listener = Some(listener);
    active.update(|session| session.traffic = Some(traffic));
    active.transition(SessionState::ProxyUp)?;

    if let Some((ip, port)) = request.screen_endpoint {
        match components.screen.attach(environment, ip, port).await {
            Ok(stream) => resources.screen = Some(stream),
            Err(e) => {
                warn!("[{}] screen relay unavailable, continuing without: {}", id, e);
                resources.screen_failure = Some(failure(FailureKind::StreamUnavailable, e));
            }
        }
    }

    active.transition(SessionState::Ready)
}
