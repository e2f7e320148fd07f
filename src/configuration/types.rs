//! Raw configuration sections as they appear in the TOML file.
//!
//! Defaults mirror the stock analyzer settings (VirtualBox host-only network,
//! proxy on port 1337, screencast on 9339).

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

/// Which environment backend dynamic analysis runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum AnalyzerBackend {
    #[serde(rename = "vm")]
    VirtualMachine,
    #[serde(rename = "device")]
    PhysicalDevice,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AnalyzerSection {
    pub backend: AnalyzerBackend,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct VmSection {
    pub uuid: String,
    pub snapshot_uuid: String,
    #[serde(default = "default_vm_ip")]
    pub ip: IpAddr,
    #[serde(default = "default_adb_port")]
    pub adb_port: u16,
    #[serde(default = "default_vm_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub headless: bool,
    #[serde(default = "default_vboxmanage")]
    pub vboxmanage_binary: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DeviceSection {
    pub ip: IpAddr,
    #[serde(default = "default_adb_port")]
    pub adb_port: u16,
    #[serde(default = "default_device_timeout")]
    pub timeout_secs: u64,
    /// Overrides the `ip:port` serial used to address the device over the bridge.
    #[serde(default)]
    pub serial: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProxySection {
    #[serde(default = "default_proxy_ip")]
    pub ip: IpAddr,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default = "default_root_ca")]
    pub root_ca: String,
    pub ca_cert_path: PathBuf,
    pub ca_key_path: PathBuf,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    #[serde(default = "default_release_barrier_ms")]
    pub release_barrier_ms: u64,
    /// Hosts tunnelled without TLS interception (e.g. certificate-pinned APIs).
    #[serde(default)]
    pub passthrough_hosts: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamType {
    Http,
    Https,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub ssl_verify: bool,
    #[serde(rename = "type", default = "default_upstream_type")]
    pub kind: UpstreamType,
    #[serde(default = "default_upstream_ip")]
    pub ip: IpAddr,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            enabled: false,
            ssl_verify: true,
            kind: UpstreamType::Http,
            ip: default_upstream_ip(),
            port: default_upstream_port(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScreenSection {
    #[serde(default = "default_proxy_ip")]
    pub ip: IpAddr,
    #[serde(default = "default_screen_port")]
    pub port: u16,
    #[serde(default = "default_detach_timeout_ms")]
    pub detach_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for ScreenSection {
    fn default() -> Self {
        Self {
            ip: default_proxy_ip(),
            port: default_screen_port(),
            detach_timeout_ms: default_detach_timeout_ms(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_adb")]
    pub adb_binary: PathBuf,
    #[serde(default = "default_tool_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            adb_binary: default_adb(),
            command_timeout_ms: default_tool_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WebSection {
    #[serde(default = "default_web_address")]
    pub bind_address: IpAddr,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self {
            bind_address: default_web_address(),
            port: default_web_port(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_backoff_initial_ms() -> u64 {
    2_000
}
fn default_backoff_cap_ms() -> u64 {
    16_000
}
fn default_vm_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 56, 101))
}
fn default_adb_port() -> u16 {
    5555
}
fn default_vm_timeout() -> u64 {
    100
}
fn default_device_timeout() -> u64 {
    300
}
fn default_vboxmanage() -> PathBuf {
    PathBuf::from("VBoxManage")
}
fn default_proxy_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 56, 1))
}
fn default_proxy_port() -> u16 {
    1337
}
fn default_root_ca() -> String {
    "0026aabb.0".to_string()
}
fn default_drain_grace_ms() -> u64 {
    5_000
}
fn default_release_barrier_ms() -> u64 {
    3_000
}
fn default_upstream_type() -> UpstreamType {
    UpstreamType::Http
}
fn default_upstream_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_upstream_port() -> u16 {
    3128
}
fn default_screen_port() -> u16 {
    9339
}
fn default_detach_timeout_ms() -> u64 {
    2_000
}
fn default_adb() -> PathBuf {
    PathBuf::from("adb")
}
fn default_tool_timeout_ms() -> u64 {
    30_000
}
fn default_web_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}
fn default_web_port() -> u16 {
    8000
}
