use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::reply::{self, Response};
use warp::{Filter, Rejection, Reply};

use super::types::{ApiError, SessionStatusResponse, StartSessionBody};
use crate::error_handling::types::{FailureKind, SessionError};
use crate::session_management::{SessionCoordinator, SessionTemplate};

const MAX_BODY: u64 = 16 * 1024;

fn with_coordinator(
    coordinator: Arc<SessionCoordinator>,
) -> impl Filter<Extract = (Arc<SessionCoordinator>,), Error = Infallible> + Clone {
    warp::any().map(move || Arc::clone(&coordinator))
}

/// All control routes.
pub fn api_routes(
    coordinator: Arc<SessionCoordinator>,
    template: Arc<SessionTemplate>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    start_session_route(Arc::clone(&coordinator), template)
        .or(begin_test_route(Arc::clone(&coordinator)))
        .or(stop_session_route(Arc::clone(&coordinator)))
        .or(get_status_route(Arc::clone(&coordinator)))
        .or(list_sessions_route(coordinator))
}

/// POST /sessions
pub fn start_session_route(
    coordinator: Arc<SessionCoordinator>,
    template: Arc<SessionTemplate>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("sessions")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY))
        .and(warp::body::json())
        .and(with_coordinator(coordinator))
        .and(warp::any().map(move || Arc::clone(&template)))
        .and_then(start_session)
}

/// POST /sessions/:id/begin
pub fn begin_test_route(
    coordinator: Arc<SessionCoordinator>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sessions" / Uuid / "begin")
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and_then(begin_test)
}

/// POST /sessions/:id/stop
pub fn stop_session_route(
    coordinator: Arc<SessionCoordinator>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sessions" / Uuid / "stop")
        .and(warp::post())
        .and(with_coordinator(coordinator))
        .and_then(stop_session)
}

/// GET /sessions/:id
pub fn get_status_route(
    coordinator: Arc<SessionCoordinator>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sessions" / Uuid)
        .and(warp::get())
        .and(with_coordinator(coordinator))
        .and_then(get_status)
}

/// GET /sessions
pub fn list_sessions_route(
    coordinator: Arc<SessionCoordinator>,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path("sessions")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_coordinator(coordinator))
        .and_then(list_sessions)
}

pub(crate) fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::InvalidTransition { .. } | SessionError::NoTrafficLog { .. } => {
            StatusCode::CONFLICT
        }
        _ => match err.kind() {
            FailureKind::EnvironmentUnavailable
            | FailureKind::PortInUse
            | FailureKind::ResourceLeak => StatusCode::CONFLICT,
            _ => StatusCode::BAD_GATEWAY,
        },
    }
}

fn error_reply(err: SessionError) -> Response {
    let status = status_for(&err);
    let kind = match err.kind() {
        FailureKind::Internal => None,
        kind => Some(kind),
    };
    if status.is_server_error() {
        warn!("API request failed: {}", err);
    }
    reply::with_status(
        reply::json(&ApiError {
            message: err.to_string(),
            kind,
        }),
        status,
    )
    .into_response()
}

pub(crate) async fn start_session(
    body: StartSessionBody,
    coordinator: Arc<SessionCoordinator>,
    template: Arc<SessionTemplate>,
) -> Result<Response, Rejection> {
    if body.deadline_secs == Some(0) {
        return Ok(reply::with_status(
            reply::json(&ApiError {
                message: "deadline_secs must be positive".to_string(),
                kind: None,
            }),
            StatusCode::BAD_REQUEST,
        )
        .into_response());
    }
    debug!("API start_session for {}", body.app_target);
    let request = template.request(body.app_target, body.deadline_secs.map(Duration::from_secs));
    match coordinator.start_session(request).await {
        Ok(id) => {
            let state = coordinator
                .get_status(id)
                .await
                .unwrap_or(crate::session_management::SessionState::Ready);
            Ok(reply::with_status(
                reply::json(&SessionStatusResponse { id, state }),
                StatusCode::CREATED,
            )
            .into_response())
        }
        Err(e) => Ok(error_reply(e)),
    }
}

pub(crate) async fn begin_test(
    id: Uuid,
    coordinator: Arc<SessionCoordinator>,
) -> Result<Response, Rejection> {
    if let Err(e) = coordinator.begin_test(id).await {
        return Ok(error_reply(e));
    }
    get_status(id, coordinator).await
}

pub(crate) async fn stop_session(
    id: Uuid,
    coordinator: Arc<SessionCoordinator>,
) -> Result<Response, Rejection> {
    match coordinator.stop_session(id).await {
        Ok(report) => Ok(reply::json(&report).into_response()),
        Err(e) => Ok(error_reply(e)),
    }
}

pub(crate) async fn get_status(
    id: Uuid,
    coordinator: Arc<SessionCoordinator>,
) -> Result<Response, Rejection> {
    match coordinator.get_status(id).await {
        Ok(state) => Ok(reply::json(&SessionStatusResponse { id, state }).into_response()),
        Err(e) => Ok(error_reply(e)),
    }
}

pub(crate) async fn list_sessions(
    coordinator: Arc<SessionCoordinator>,
) -> Result<Response, Rejection> {
    Ok(reply::json(&coordinator.sessions().await).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::{BackoffPolicy, EnvironmentController};
    use crate::error_handling::types::{EnvironmentError, ProxyError};
    use crate::network::NetworkBridgeConfig;
    use crate::proxy::ProxySessionManager;
    use crate::screen_relay::ScreenRelay;
    use crate::session_management::{SessionComponents, SessionState};
    use crate::testing::{device_spec, free_port, proxy_config, test_ca, FakeBridge, FakeHypervisor};
    use serial_test::serial;

    fn coordinator() -> Arc<SessionCoordinator> {
        let bridge = Arc::new(FakeBridge::default());
        Arc::new(SessionCoordinator::new(SessionComponents {
            environments: Arc::new(EnvironmentController::new(
                Arc::new(FakeHypervisor::default()),
                bridge.clone(),
                BackoffPolicy::default(),
            )),
            network: Arc::new(NetworkBridgeConfig::new(bridge.clone())),
            proxies: Arc::new(ProxySessionManager::new()),
            screen: Arc::new(ScreenRelay::new(bridge, Duration::from_millis(200))),
        }))
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            status_for(&SessionError::NotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&SessionError::InvalidTransition {
                from: SessionState::TornDown,
                to: SessionState::Running
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ProxyError::PortInUse(1337).into()),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&EnvironmentError::HypervisorError("VBoxManage: exit 1".into()).into()),
            StatusCode::BAD_GATEWAY
        );
    }

    #[tokio::test]
    async fn unknown_session_is_404() {
        let coordinator = coordinator();
        let res = get_status(Uuid::new_v4(), coordinator.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        let res = stop_session(Uuid::new_v4(), coordinator).await.unwrap();
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    #[serial]
    async fn session_lifecycle_over_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator();
        let template = Arc::new(SessionTemplate {
            environment: device_spec(),
            proxy: Arc::new(proxy_config(free_port(), test_ca(&dir), None)),
            screen_endpoint: None,
        });

        let zero = StartSessionBody {
            app_target: "com.example.app".into(),
            deadline_secs: Some(0),
        };
        let res = start_session(zero, coordinator.clone(), template.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let body = StartSessionBody {
            app_target: "com.example.app".into(),
            deadline_secs: Some(60),
        };
        let res = start_session(body, coordinator.clone(), template.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
        let id = coordinator.sessions().await[0].id;

        let res = begin_test(id, coordinator.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let res = begin_test(id, coordinator.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        // The environment is still bound to the first session.
        let again = StartSessionBody {
            app_target: "com.example.other".into(),
            deadline_secs: None,
        };
        let res = start_session(again, coordinator.clone(), template).await.unwrap();
        assert_eq!(res.status(), StatusCode::CONFLICT);

        let res = stop_session(id, coordinator.clone()).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(
            coordinator.get_status(id).await.unwrap(),
            SessionState::TornDown
        );
        let res = list_sessions(coordinator).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }
}
