use std::net::SocketAddr;
use std::path::PathBuf;

/// Route the environment must use to reach the intercepting proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePlan {
    /// Bridge serial of the environment.
    pub serial: String,
    pub proxy_endpoint: SocketAddr,
    /// File name the root CA is installed under.
    pub certificate_identifier: String,
    /// Local PEM file pushed to the environment.
    pub certificate_source: PathBuf,
}

impl RoutePlan {
    /// Path of the installed root CA on the environment.
    pub fn certificate_destination(&self) -> String {
        format!("{}/{}", SYSTEM_CA_DIR, self.certificate_identifier)
    }
}

/// System trust store directory on Android.
pub const SYSTEM_CA_DIR: &str = "/system/etc/security/cacerts";
