use super::types::*;
use crate::environment::types::{EnvironmentSpec, PhysicalDeviceSpec, VirtualMachineSpec};
use crate::environment::BackoffPolicy;
use crate::error_handling::types::ConfigError;
use crate::proxy::types::{
    Credentials, ProxyConfig, RootCertificate, UpstreamProxyConfig, UpstreamScheme,
};
use crate::session_management::SessionTemplate;
use log::{debug, info};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Application configuration, loaded once at process start.
///
/// The structure is read-only after [`Config::from_file`] returns: every component
/// receives the pieces it needs (an [`EnvironmentSpec`], a [`ProxyConfig`], ...)
/// through its constructor and never reads global state.
///
/// # File layout
///
/// ```toml
/// [analyzer]
/// backend = "vm"            # or "device"
///
/// [vm]
/// uuid = "408e1874-759f-4417-9453-53ef21dc2ade"
/// snapshot_uuid = "5c9deb28-def6-49c0-9233-b5e03edd85c6"
/// ip = "192.168.56.101"
///
/// [proxy]
/// ip = "192.168.56.1"
/// port = 1337
/// ca_cert_path = "/etc/mirador/ca.pem"
/// ca_key_path = "/etc/mirador/ca.key"
/// ```
///
/// # Fields Overview
///
/// - `analyzer`: backend selector and reachability polling backoff
/// - `vm` / `device`: environment specific addressing and timeouts; only the section
///   matching `analyzer.backend` is required
/// - `proxy`: intercepting listener, root certificate and drain timings
/// - `upstream`: optional chaining to an operator proxy
/// - `screen`: local sink for the screen relay
/// - `tools`: external tool binaries
/// - `web`: control API bind address
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub analyzer: AnalyzerSection,
    #[serde(default)]
    pub vm: Option<VmSection>,
    #[serde(default)]
    pub device: Option<DeviceSection>,
    pub proxy: ProxySection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub screen: ScreenSection,
    #[serde(default)]
    pub tools: ToolsSection,
    #[serde(default)]
    pub web: WebSection,
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        debug!("Configuration validated: backend={:?}", config.analyzer.backend);
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.analyzer.backend {
            AnalyzerBackend::VirtualMachine => {
                let vm = self
                    .vm
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingField("[vm] section".to_string()))?;
                if vm.uuid.trim().is_empty() {
                    return Err(ConfigError::MissingField("vm.uuid".to_string()));
                }
                if vm.snapshot_uuid.trim().is_empty() {
                    return Err(ConfigError::MissingField("vm.snapshot_uuid".to_string()));
                }
                check_host_ip("vm.ip", vm.ip)?;
                check_port("vm.adb_port", vm.adb_port)?;
                check_positive("vm.timeout_secs", vm.timeout_secs)?;
            }
            AnalyzerBackend::PhysicalDevice => {
                let device = self
                    .device
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingField("[device] section".to_string()))?;
                check_host_ip("device.ip", device.ip)?;
                check_port("device.adb_port", device.adb_port)?;
                check_positive("device.timeout_secs", device.timeout_secs)?;
            }
        }

        check_port("proxy.port", self.proxy.port)?;
        if self.proxy.root_ca.trim().is_empty() {
            return Err(ConfigError::MissingField("proxy.root_ca".to_string()));
        }
        check_positive("proxy.drain_grace_ms", self.proxy.drain_grace_ms)?;
        check_positive("proxy.release_barrier_ms", self.proxy.release_barrier_ms)?;

        if self.upstream.enabled {
            check_host_ip("upstream.ip", self.upstream.ip)?;
            check_port("upstream.port", self.upstream.port)?;
        }

        if self.screen.enabled {
            check_port("screen.port", self.screen.port)?;
            if self.screen.ip == self.proxy.ip && self.screen.port == self.proxy.port {
                return Err(ConfigError::BadPortsRange(format!(
                    "screen.port {} collides with proxy.port",
                    self.screen.port
                )));
            }
        }

        check_positive("analyzer.backoff_initial_ms", self.analyzer.backoff_initial_ms)?;
        if self.analyzer.backoff_cap_ms < self.analyzer.backoff_initial_ms {
            return Err(ConfigError::NotInRange(format!(
                "analyzer.backoff_cap_ms ({}) is below backoff_initial_ms ({})",
                self.analyzer.backoff_cap_ms, self.analyzer.backoff_initial_ms
            )));
        }
        check_positive("tools.command_timeout_ms", self.tools.command_timeout_ms)?;
        Ok(())
    }

    /// Builds the environment description for the selected backend.
    pub fn environment_spec(&self) -> Result<EnvironmentSpec, ConfigError> {
        match self.analyzer.backend {
            AnalyzerBackend::VirtualMachine => {
                let vm = self
                    .vm
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingField("[vm] section".to_string()))?;
                Ok(EnvironmentSpec::VirtualMachine(VirtualMachineSpec {
                    identifier: vm.uuid.clone(),
                    snapshot: vm.snapshot_uuid.clone(),
                    hypervisor: vm.vboxmanage_binary.clone(),
                    ip: vm.ip,
                    bridge_port: vm.adb_port,
                    headless: vm.headless,
                    timeout: Duration::from_secs(vm.timeout_secs),
                }))
            }
            AnalyzerBackend::PhysicalDevice => {
                let device = self
                    .device
                    .as_ref()
                    .ok_or_else(|| ConfigError::MissingField("[device] section".to_string()))?;
                let serial = device
                    .serial
                    .clone()
                    .unwrap_or_else(|| format!("{}:{}", device.ip, device.adb_port));
                Ok(EnvironmentSpec::PhysicalDevice(PhysicalDeviceSpec {
                    bridge_address: device.ip,
                    bridge_port: device.adb_port,
                    serial,
                    timeout: Duration::from_secs(device.timeout_secs),
                }))
            }
        }
    }

    /// Builds the proxy configuration handed to every new session.
    pub fn proxy_config(&self) -> ProxyConfig {
        let upstream = if self.upstream.enabled {
            let credentials = if self.upstream.username.is_empty() {
                None
            } else {
                Some(Credentials {
                    username: self.upstream.username.clone(),
                    password: self.upstream.password.clone(),
                })
            };
            Some(UpstreamProxyConfig {
                scheme: match self.upstream.kind {
                    UpstreamType::Http => UpstreamScheme::Http,
                    UpstreamType::Https => UpstreamScheme::Https,
                },
                ip: self.upstream.ip,
                port: self.upstream.port,
                verify_tls: self.upstream.ssl_verify,
                credentials,
            })
        } else {
            None
        };

        ProxyConfig {
            listen_ip: self.proxy.ip,
            listen_port: self.proxy.port,
            root_certificate: RootCertificate {
                identifier: self.proxy.root_ca.clone(),
                cert_path: self.proxy.ca_cert_path.clone(),
                key_path: self.proxy.ca_key_path.clone(),
            },
            upstream,
            drain_grace: Duration::from_millis(self.proxy.drain_grace_ms),
            release_barrier: Duration::from_millis(self.proxy.release_barrier_ms),
            passthrough_hosts: self.proxy.passthrough_hosts.clone(),
        }
    }

    /// Environment, proxy and screen settings shared by every session of this process.
    pub fn session_template(&self) -> Result<SessionTemplate, ConfigError> {
        Ok(SessionTemplate {
            environment: self.environment_spec()?,
            proxy: Arc::new(self.proxy_config()),
            screen_endpoint: self.screen_endpoint(),
        })
    }

    /// Local sink for the screen relay, when mirroring is enabled.
    pub fn screen_endpoint(&self) -> Option<(IpAddr, u16)> {
        if self.screen.enabled {
            Some((self.screen.ip, self.screen.port))
        } else {
            None
        }
    }

    pub fn screen_detach_timeout(&self) -> Duration {
        Duration::from_millis(self.screen.detach_timeout_ms)
    }

    pub fn reachability_backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.analyzer.backoff_initial_ms),
            cap: Duration::from_millis(self.analyzer.backoff_cap_ms),
        }
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tools.command_timeout_ms)
    }
}

fn check_port(name: &str, port: u16) -> Result<(), ConfigError> {
    if port == 0 {
        return Err(ConfigError::BadPortsRange(format!(
            "{} must be in 1-65535",
            name
        )));
    }
    Ok(())
}

fn check_host_ip(name: &str, ip: IpAddr) -> Result<(), ConfigError> {
    if ip.is_unspecified() || ip.is_multicast() {
        return Err(ConfigError::BadIPFormatting(format!(
            "{} must be a unicast host address, got {}",
            name, ip
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotInRange(format!("{} must be greater than 0", name)));
    }
    Ok(())
}
