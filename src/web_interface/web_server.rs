use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::info;
use warp::Filter;

use super::routes::api_routes;
use crate::error_handling::types::WebError;
use crate::session_management::{SessionCoordinator, SessionTemplate};

/// Web server for the session control API
pub struct WebServer {
    coordinator: Arc<SessionCoordinator>,
    template: Arc<SessionTemplate>,
}

impl WebServer {
    pub fn new(coordinator: Arc<SessionCoordinator>, template: Arc<SessionTemplate>) -> Self {
        Self {
            coordinator,
            template,
        }
    }

    /// Serves the API on `addr` until `shutdown` completes.
    pub async fn start<S>(&self, addr: SocketAddr, shutdown: S) -> Result<(), WebError>
    where
        S: Future<Output = ()> + Send,
    {
        // Surface a busy port as an error instead of a panic inside warp.
        let check = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| WebError::BindError(format!("{}: {}", addr, e)))?;
        drop(check);

        let routes = api_routes(Arc::clone(&self.coordinator), Arc::clone(&self.template))
            .with(warp::log("mirador::api"));

        info!("Control API listening on http://{}", addr);
        tokio::select! {
            _ = warp::serve(routes).run(addr) => {}
            _ = shutdown => info!("Control API shutting down"),
        }
        Ok(())
    }
}
