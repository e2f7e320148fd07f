use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};

use crate::configuration::config::Config;
use crate::environment::{
    AdbBridge, DeviceBridge, EnvironmentController, Hypervisor, VirtualBox,
};
use crate::error_handling::types::ControllerError;
use crate::network::NetworkBridgeConfig;
use crate::proxy::{CertificateAuthority, ProxySessionManager};
use crate::screen_relay::ScreenRelay;
use crate::session_management::{
    SessionComponents, SessionCoordinator, SessionTemplate, StopReport,
};
use crate::web_interface::WebServer;

/// Wires the configured backends into a coordinator and serves the control API.
pub struct Controller {
    pub config: Config,
    coordinator: Arc<SessionCoordinator>,
    template: Arc<SessionTemplate>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self, ControllerError> {
        info!("Initializing controller");
        let template = Arc::new(config.session_template()?);

        // Fail at startup rather than on the first session.
        CertificateAuthority::load(&template.proxy.root_certificate)
            .map_err(ControllerError::ProxyError)?;

        let timeout = config.tool_timeout();
        let hypervisor: Arc<dyn Hypervisor> = Arc::new(VirtualBox::new(timeout));
        let bridge: Arc<dyn DeviceBridge> =
            Arc::new(AdbBridge::new(config.tools.adb_binary.clone(), timeout));

        let coordinator = Arc::new(SessionCoordinator::new(SessionComponents {
            environments: Arc::new(EnvironmentController::new(
                hypervisor,
                Arc::clone(&bridge),
                config.reachability_backoff(),
            )),
            network: Arc::new(NetworkBridgeConfig::new(Arc::clone(&bridge))),
            proxies: Arc::new(ProxySessionManager::new()),
            screen: Arc::new(ScreenRelay::new(bridge, config.screen_detach_timeout())),
        }));
        info!(
            "Controller ready: {} environment {}, proxy {}",
            match config.analyzer.backend {
                crate::configuration::AnalyzerBackend::VirtualMachine => "vm",
                crate::configuration::AnalyzerBackend::PhysicalDevice => "device",
            },
            template.environment.identifier(),
            template.proxy.listen_addr()
        );

        Ok(Self {
            config,
            coordinator,
            template,
        })
    }

    pub fn coordinator(&self) -> Arc<SessionCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Serves the control API until Ctrl-C, then tears every session down.
    pub async fn run(&self) -> Result<(), ControllerError> {
        let addr = SocketAddr::new(self.config.web.bind_address, self.config.web.port);
        let server = WebServer::new(self.coordinator(), Arc::clone(&self.template));
        let served = server
            .start(addr, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Unable to listen for Ctrl-C: {}", e);
                    std::future::pending::<()>().await;
                }
            })
            .await;
        self.shutdown().await;
        served.map_err(ControllerError::from)
    }

    /// Stops every live session and reports environments left dirty.
    pub async fn shutdown(&self) -> Vec<StopReport> {
        info!("Shutting down controller");
        let reports = self.coordinator.shutdown_all().await;
        for report in reports.iter().filter(|r| !r.failures.is_empty()) {
            warn!(
                "[{}] stopped with failures: {:?}",
                report.session_id, report.failures
            );
        }
        let leaked = self.coordinator.components().environments.leaked().await;
        if !leaked.is_empty() {
            error!(
                "Environment(s) left dirty, operator cleanup needed: {:?}",
                leaked
            );
        }
        reports
    }
}
