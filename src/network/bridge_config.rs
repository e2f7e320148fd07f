use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::Mutex;

use super::types::RoutePlan;
use crate::environment::device_bridge::DeviceBridge;
use crate::environment::types::{EnvironmentHandle, EnvironmentKind};
use crate::error_handling::types::RoutingError;
use crate::proxy::types::ProxyConfig;

/// Points environments at the intercepting proxy and takes them off it again.
///
/// Routing is an explicit proxy setting: the root CA goes into the system trust
/// store and the global HTTP proxy is set to the listener endpoint.
pub struct NetworkBridgeConfig {
    bridge: Arc<dyn DeviceBridge>,
    routed: Mutex<HashMap<String, RoutePlan>>,
}

impl NetworkBridgeConfig {
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self {
            bridge,
            routed: Mutex::new(HashMap::new()),
        }
    }

    /// Computes the route without touching the environment.
    pub fn plan(
        &self,
        handle: &EnvironmentHandle,
        proxy: &ProxyConfig,
    ) -> Result<RoutePlan, RoutingError> {
        let listen = proxy.listen_ip;
        if listen.is_unspecified() {
            return Err(RoutingError::UnroutableEndpoint(format!(
                "proxy listens on {}, the environment needs a concrete address",
                listen
            )));
        }
        if listen.is_loopback() && !handle.ip.is_loopback() {
            return Err(RoutingError::UnroutableEndpoint(format!(
                "proxy on loopback {} is not reachable from {}",
                listen, handle.ip
            )));
        }
        Ok(RoutePlan {
            serial: handle.serial.clone(),
            proxy_endpoint: SocketAddr::new(listen, proxy.listen_port),
            certificate_identifier: proxy.root_certificate.identifier.clone(),
            certificate_source: proxy.root_certificate.cert_path.clone(),
        })
    }

    /// Installs the root CA and sets the global proxy on the environment.
    pub async fn route(
        &self,
        handle: &EnvironmentHandle,
        proxy: &ProxyConfig,
    ) -> Result<RoutePlan, RoutingError> {
        let plan = self.plan(handle, proxy)?;
        let destination = plan.certificate_destination();

        if handle.kind() == EnvironmentKind::VirtualMachine {
            // Emulator images mount /system read-only.
            if let Err(e) = self
                .bridge
                .shell(&plan.serial, &["mount", "-o", "rw,remount", "/system"])
                .await
            {
                warn!("Remount of /system on {} failed: {}", plan.serial, e);
            }
        }

        self.bridge
            .push_file(&plan.serial, &plan.certificate_source, &destination)
            .await
            .map_err(|e| RoutingError::CertificateInstall(e.to_string()))?;
        self.bridge
            .shell(&plan.serial, &["chmod", "644", &destination])
            .await
            .map_err(|e| RoutingError::CertificateInstall(e.to_string()))?;
        debug!("Root CA installed on {} as {}", plan.serial, destination);

        self.bridge
            .set_global_proxy(&plan.serial, plan.proxy_endpoint)
            .await
            .map_err(|e| RoutingError::ProxySetting(e.to_string()))?;

        info!("Routed {} through {}", handle.identifier(), plan.proxy_endpoint);
        self.routed
            .lock()
            .await
            .insert(handle.identifier().to_string(), plan.clone());
        Ok(plan)
    }

    /// Clears the global proxy. Unrouting an environment that is not routed is a no-op.
    pub async fn unroute(&self, handle: &EnvironmentHandle) -> Result<(), RoutingError> {
        let identifier = handle.identifier().to_string();
        let removed = self.routed.lock().await.remove(&identifier);
        let Some(plan) = removed else {
            debug!("{} is not routed", identifier);
            return Ok(());
        };

        if let Err(e) = self.bridge.clear_global_proxy(&plan.serial).await {
            // Keep the entry so a later unroute can retry.
            self.routed.lock().await.insert(identifier, plan);
            return Err(RoutingError::ProxySetting(e.to_string()));
        }
        info!("Unrouted {}", identifier);
        Ok(())
    }

    pub async fn is_routed(&self, identifier: &str) -> bool {
        self.routed.lock().await.contains_key(identifier)
    }
}
