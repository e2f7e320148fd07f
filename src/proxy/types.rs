use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use crate::data_capture::TrafficLogReader;

/// Root CA used to sign per-host leaf certificates.
#[derive(Debug, Clone, PartialEq)]
pub struct RootCertificate {
    /// File name the certificate is installed under on the environment
    /// (`<subject_hash_old>.0` on Android).
    pub identifier: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamScheme {
    Http,
    Https,
}

#[derive(Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Operator proxy every outbound connection is chained through.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamProxyConfig {
    pub scheme: UpstreamScheme,
    pub ip: IpAddr,
    pub port: u16,
    /// `false` disables certificate validation for upstream TLS (lab proxies).
    pub verify_tls: bool,
    pub credentials: Option<Credentials>,
}

/// Intercepting proxy settings. Shared read-only (`Arc`) by a session once started.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
    pub listen_ip: IpAddr,
    pub listen_port: u16,
    pub root_certificate: RootCertificate,
    pub upstream: Option<UpstreamProxyConfig>,
    pub drain_grace: Duration,
    pub release_barrier: Duration,
    pub passthrough_hosts: Vec<String>,
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.listen_port)
    }

    /// Whether `host` must be tunnelled without interception.
    ///
    /// Entries match exactly (case-insensitive); `*.example.com` also matches
    /// every subdomain.
    pub fn is_passthrough(&self, host: &str) -> bool {
        let host = host.to_ascii_lowercase();
        self.passthrough_hosts.iter().any(|entry| {
            let entry = entry.to_ascii_lowercase();
            match entry.strip_prefix("*.") {
                Some(domain) => host == domain || host.ends_with(&format!(".{}", domain)),
                None => host == entry,
            }
        })
    }
}

/// Result of a clean proxy stop.
#[derive(Debug, Clone, Serialize)]
pub struct DrainReport {
    /// Connections still open when the listener closed.
    pub in_flight: usize,
    pub truncated_flows: usize,
    pub flows_committed: usize,
    pub elapsed_ms: u64,
}

/// Running listener of one session. Consumed by `ProxySessionManager::stop`.
pub struct ListenerHandle {
    pub session_id: Uuid,
    pub local_addr: SocketAddr,
    pub(crate) config: std::sync::Arc<ProxyConfig>,
    pub(crate) shutdown: watch::Sender<bool>,
    pub(crate) force_close: watch::Sender<bool>,
    pub(crate) accept_task: JoinHandle<JoinSet<()>>,
    pub(crate) collector: JoinHandle<()>,
    pub(crate) traffic: TrafficLogReader,
}

impl ListenerHandle {
    pub fn traffic(&self) -> TrafficLogReader {
        self.traffic.clone()
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("session_id", &self.session_id)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
