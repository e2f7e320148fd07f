pub mod certificate_authority;
pub mod connection;
pub mod manager;
pub mod port_registry;
pub mod types;
pub mod upstream;

pub use certificate_authority::CertificateAuthority;
pub use manager::ProxySessionManager;
pub use types::{DrainReport, ListenerHandle, ProxyConfig, UpstreamProxyConfig};
