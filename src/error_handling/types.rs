use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::proxy::types::DrainReport;
use crate::session_management::session::SessionState;

/// Failure classes surfaced to callers of the session API.
///
/// Component errors are folded into one of these when a session fails or when a
/// teardown step is recorded in a stop report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    EnvironmentUnavailable,
    DeviceUnreachable,
    HypervisorError,
    RevertFailed,
    RoutingError,
    PortInUse,
    CertificateError,
    DrainTimeout,
    StreamUnavailable,
    ResourceLeak,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::EnvironmentUnavailable => "EnvironmentUnavailable",
            FailureKind::DeviceUnreachable => "DeviceUnreachable",
            FailureKind::HypervisorError => "HypervisorError",
            FailureKind::RevertFailed => "RevertFailed",
            FailureKind::RoutingError => "RoutingError",
            FailureKind::PortInUse => "PortInUse",
            FailureKind::CertificateError => "CertificateError",
            FailureKind::DrainTimeout => "DrainTimeout",
            FailureKind::StreamUnavailable => "StreamUnavailable",
            FailureKind::ResourceLeak => "ResourceLeak",
            FailureKind::Internal => "Internal",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(std::io::Error),
    TomlError(String),
    BadIPFormatting(String),
    BadPortsRange(String),
    NotInRange(String),
    UnknownBackend(String),
    MissingField(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::TomlError(e) => write!(f, "TOML parsing error: {}", e),
            ConfigError::BadIPFormatting(e) => write!(f, "IP formatting error: {}", e),
            ConfigError::BadPortsRange(e) => write!(f, "Port range error: {}", e),
            ConfigError::NotInRange(e) => write!(f, "Value out of range: {}", e),
            ConfigError::UnknownBackend(e) => write!(f, "Unknown analyzer backend: {}", e),
            ConfigError::MissingField(e) => write!(f, "Missing configuration field: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        ConfigError::TomlError(err.to_string())
    }
}

/// Failure of an external control tool (`VBoxManage`, `adb`).
///
/// Only the program name and a short reason are kept; raw tool output never
/// travels further than the component that ran the command.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolError {
    pub program: String,
    pub reason: String,
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.program, self.reason)
    }
}

impl std::error::Error for ToolError {}

#[derive(Debug, Clone, PartialEq)]
pub enum EnvironmentError {
    EnvironmentUnavailable(String),
    DeviceUnreachable { identifier: String, waited: Duration },
    HypervisorError(String),
    RevertFailed { identifier: String, reason: String },
    ResourceLeak(String),
    BridgeError(String),
}

impl EnvironmentError {
    pub fn kind(&self) -> FailureKind {
        match self {
            EnvironmentError::EnvironmentUnavailable(_) => FailureKind::EnvironmentUnavailable,
            EnvironmentError::DeviceUnreachable { .. } => FailureKind::DeviceUnreachable,
            EnvironmentError::HypervisorError(_) => FailureKind::HypervisorError,
            // Never retried; an operator has to clean up.
            EnvironmentError::RevertFailed { .. } => FailureKind::ResourceLeak,
            EnvironmentError::ResourceLeak(_) => FailureKind::ResourceLeak,
            EnvironmentError::BridgeError(_) => FailureKind::DeviceUnreachable,
        }
    }
}

impl fmt::Display for EnvironmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentError::EnvironmentUnavailable(e) => {
                write!(f, "Environment unavailable: {}", e)
            }
            EnvironmentError::DeviceUnreachable { identifier, waited } => write!(
                f,
                "Device {} unreachable after {:.1}s",
                identifier,
                waited.as_secs_f64()
            ),
            EnvironmentError::HypervisorError(e) => write!(f, "Hypervisor error: {}", e),
            EnvironmentError::RevertFailed { identifier, reason } => write!(
                f,
                "Snapshot revert failed for {}: {} (manual intervention required)",
                identifier, reason
            ),
            EnvironmentError::ResourceLeak(e) => write!(f, "Resource leak: {}", e),
            EnvironmentError::BridgeError(e) => write!(f, "Device bridge error: {}", e),
        }
    }
}

impl std::error::Error for EnvironmentError {}

#[derive(Debug, Clone, PartialEq)]
pub enum RoutingError {
    UnroutableEndpoint(String),
    CertificateInstall(String),
    ProxySetting(String),
}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutingError::UnroutableEndpoint(e) => write!(f, "Unroutable proxy endpoint: {}", e),
            RoutingError::CertificateInstall(e) => {
                write!(f, "Root certificate install failed: {}", e)
            }
            RoutingError::ProxySetting(e) => write!(f, "Proxy setting failed: {}", e),
        }
    }
}

impl std::error::Error for RoutingError {}

#[derive(Debug)]
pub enum ProxyError {
    PortInUse(u16),
    CertificateError(String),
    BindError(std::io::Error),
    /// Grace elapsed; carries the drain outcome so it still reaches the report.
    DrainTimeout(DrainReport),
    ListenerLeak(u16),
    TlsError(String),
    UpstreamError(String),
    ProtocolError(String),
    IoError(std::io::Error),
}

impl ProxyError {
    pub fn kind(&self) -> FailureKind {
        match self {
            // The listen endpoint cannot be taken, whether busy or not a local address.
            ProxyError::PortInUse(_) | ProxyError::BindError(_) => FailureKind::PortInUse,
            ProxyError::CertificateError(_) => FailureKind::CertificateError,
            ProxyError::DrainTimeout(_) => FailureKind::DrainTimeout,
            ProxyError::ListenerLeak(_) => FailureKind::ResourceLeak,
            _ => FailureKind::Internal,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::PortInUse(p) => write!(f, "Proxy port {} already in use", p),
            ProxyError::CertificateError(e) => write!(f, "Certificate error: {}", e),
            ProxyError::BindError(e) => write!(f, "Proxy bind error: {}", e),
            ProxyError::DrainTimeout(report) => write!(
                f,
                "Drain grace period elapsed, {} of {} flow(s) truncated",
                report.truncated_flows, report.flows_committed
            ),
            ProxyError::ListenerLeak(p) => {
                write!(f, "Listener on port {} was not released", p)
            }
            ProxyError::TlsError(e) => write!(f, "TLS error: {}", e),
            ProxyError::UpstreamError(e) => write!(f, "Upstream error: {}", e),
            ProxyError::ProtocolError(e) => write!(f, "Protocol error: {}", e),
            ProxyError::IoError(e) => write!(f, "Proxy IO error: {}", e),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err)
    }
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::TlsError(err.to_string())
    }
}

impl From<rcgen::Error> for ProxyError {
    fn from(err: rcgen::Error) -> Self {
        ProxyError::CertificateError(err.to_string())
    }
}

#[derive(Debug)]
pub enum ScreenError {
    StreamUnavailable(String),
    DetachTimeout(Duration),
    RelayFailed(std::io::Error),
}

impl fmt::Display for ScreenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScreenError::StreamUnavailable(e) => write!(f, "Screen stream unavailable: {}", e),
            ScreenError::DetachTimeout(d) => {
                write!(f, "Screen relay detach timed out after {:?}", d)
            }
            ScreenError::RelayFailed(e) => write!(f, "Screen relay failed: {}", e),
        }
    }
}

impl std::error::Error for ScreenError {}

#[derive(Debug)]
pub enum CaptureError {
    TcpStreamError(std::io::Error),
    ForceClosed,
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::TcpStreamError(e) => write!(f, "TCP stream capture error: {}", e),
            CaptureError::ForceClosed => write!(f, "Capture force-closed during drain"),
        }
    }
}

impl std::error::Error for CaptureError {}

#[derive(Debug)]
pub enum SessionError {
    Environment(EnvironmentError),
    Routing(RoutingError),
    Proxy(ProxyError),
    Screen(ScreenError),
    NotFound(Uuid),
    InvalidTransition { from: SessionState, to: SessionState },
    NoTrafficLog { id: Uuid, state: SessionState },
    SetupAborted(String),
}

impl SessionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SessionError::Environment(e) => e.kind(),
            SessionError::Routing(_) => FailureKind::RoutingError,
            SessionError::Proxy(e) => e.kind(),
            SessionError::Screen(_) => FailureKind::StreamUnavailable,
            SessionError::NotFound(_)
            | SessionError::InvalidTransition { .. }
            | SessionError::NoTrafficLog { .. }
            | SessionError::SetupAborted(_) => FailureKind::Internal,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Environment(e) => write!(f, "Environment error: {}", e),
            SessionError::Routing(e) => write!(f, "Routing error: {}", e),
            SessionError::Proxy(e) => write!(f, "Proxy error: {}", e),
            SessionError::Screen(e) => write!(f, "Screen relay error: {}", e),
            SessionError::NotFound(id) => write!(f, "Session {} not found", id),
            SessionError::InvalidTransition { from, to } => {
                write!(f, "Invalid session transition {} -> {}", from, to)
            }
            SessionError::NoTrafficLog { id, state } => {
                write!(f, "Session {} has no traffic log in state {}", id, state)
            }
            SessionError::SetupAborted(e) => write!(f, "Session setup task failed: {}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<EnvironmentError> for SessionError {
    fn from(err: EnvironmentError) -> Self {
        SessionError::Environment(err)
    }
}

impl From<RoutingError> for SessionError {
    fn from(err: RoutingError) -> Self {
        SessionError::Routing(err)
    }
}

impl From<ProxyError> for SessionError {
    fn from(err: ProxyError) -> Self {
        SessionError::Proxy(err)
    }
}

impl From<ScreenError> for SessionError {
    fn from(err: ScreenError) -> Self {
        SessionError::Screen(err)
    }
}

#[derive(Debug)]
pub enum WebError {
    BindError(String),
}

impl fmt::Display for WebError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebError::BindError(e) => write!(f, "Web server bind error: {}", e),
        }
    }
}

impl std::error::Error for WebError {}

#[derive(Debug)]
pub enum ControllerError {
    ConfigurationError(ConfigError),
    ProxyError(ProxyError),
    WebError(WebError),
    InitializationFailed(String),
}

impl fmt::Display for ControllerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerError::ConfigurationError(e) => write!(f, "Configuration error: {}", e),
            ControllerError::ProxyError(e) => write!(f, "Proxy error: {}", e),
            ControllerError::WebError(e) => write!(f, "Web error: {}", e),
            ControllerError::InitializationFailed(e) => write!(f, "Initialization failed: {}", e),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<ConfigError> for ControllerError {
    fn from(err: ConfigError) -> Self {
        ControllerError::ConfigurationError(err)
    }
}

impl From<WebError> for ControllerError {
    fn from(err: WebError) -> Self {
        ControllerError::WebError(err)
    }
}
