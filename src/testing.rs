//! In-memory stand-ins for the hypervisor and the device bridge, plus fixtures
//! shared by the component and coordinator tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};

use crate::environment::device_bridge::{DeviceBridge, ScreenStream};
use crate::environment::hypervisor::Hypervisor;
use crate::environment::types::{EnvironmentSpec, PhysicalDeviceSpec, VirtualMachineSpec};
use crate::error_handling::types::EnvironmentError;
use crate::proxy::types::{ProxyConfig, RootCertificate, UpstreamProxyConfig};
use crate::proxy::CertificateAuthority;

pub type Journal = Arc<Mutex<Vec<String>>>;

fn push(journal: &Journal, entry: impl Into<String>) {
    journal.lock().unwrap().push(entry.into());
}

#[derive(Default)]
pub struct FakeHypervisor {
    running: AtomicBool,
    fail_restore: AtomicBool,
    fail_start: AtomicBool,
    journal: Journal,
}

impl FakeHypervisor {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_powered(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn fail_restore(&self, fail: bool) {
        self.fail_restore.store(fail, Ordering::SeqCst);
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    async fn is_running(&self, _vm: &VirtualMachineSpec) -> Result<bool, EnvironmentError> {
        push(&self.journal, "is_running");
        Ok(self.running.load(Ordering::SeqCst))
    }

    async fn start(&self, _vm: &VirtualMachineSpec) -> Result<(), EnvironmentError> {
        push(&self.journal, "start");
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EnvironmentError::HypervisorError("startvm failed".into()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn power_off(&self, _vm: &VirtualMachineSpec) -> Result<(), EnvironmentError> {
        push(&self.journal, "power_off");
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn restore_snapshot(&self, vm: &VirtualMachineSpec) -> Result<(), EnvironmentError> {
        push(&self.journal, format!("restore_snapshot {}", vm.snapshot));
        if self.fail_restore.load(Ordering::SeqCst) {
            return Err(EnvironmentError::HypervisorError("snapshot locked".into()));
        }
        Ok(())
    }
}

pub struct FakeBridge {
    reachable: AtomicBool,
    fail_set_proxy: AtomicBool,
    screen_available: AtomicBool,
    journal: Journal,
}

impl Default for FakeBridge {
    fn default() -> Self {
        Self::with_journal(Journal::default())
    }
}

impl FakeBridge {
    pub fn with_journal(journal: Journal) -> Self {
        Self {
            reachable: AtomicBool::new(true),
            fail_set_proxy: AtomicBool::new(false),
            screen_available: AtomicBool::new(true),
            journal,
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn fail_set_proxy(&self, fail: bool) {
        self.fail_set_proxy.store(fail, Ordering::SeqCst);
    }

    pub fn set_screen_available(&self, available: bool) {
        self.screen_available.store(available, Ordering::SeqCst);
    }

    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceBridge for FakeBridge {
    async fn connect(&self, _serial: &str) -> Result<(), EnvironmentError> {
        Ok(())
    }

    async fn is_connected(&self, _serial: &str) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    async fn push_file(
        &self,
        _serial: &str,
        _local: &Path,
        remote: &str,
    ) -> Result<(), EnvironmentError> {
        push(&self.journal, format!("push_file {}", remote));
        Ok(())
    }

    async fn shell(&self, _serial: &str, args: &[&str]) -> Result<String, EnvironmentError> {
        push(&self.journal, format!("shell {}", args.join(" ")));
        Ok(String::new())
    }

    async fn set_global_proxy(
        &self,
        _serial: &str,
        proxy: SocketAddr,
    ) -> Result<(), EnvironmentError> {
        push(&self.journal, format!("set_global_proxy {}", proxy));
        if self.fail_set_proxy.load(Ordering::SeqCst) {
            return Err(EnvironmentError::BridgeError("settings: permission denied".into()));
        }
        Ok(())
    }

    async fn clear_global_proxy(&self, _serial: &str) -> Result<(), EnvironmentError> {
        push(&self.journal, "clear_global_proxy");
        Ok(())
    }

    async fn open_screen_stream(&self, _serial: &str) -> Result<ScreenStream, EnvironmentError> {
        push(&self.journal, "open_screen_stream");
        if !self.screen_available.load(Ordering::SeqCst) {
            return Err(EnvironmentError::BridgeError("screenrecord not found".into()));
        }
        Ok(Box::new(ScriptedScreen {
            data: b"\x00\x00\x00\x01fake-h264-frame".to_vec(),
            pos: 0,
            journal: Arc::clone(&self.journal),
        }))
    }

    async fn collect_logs(&self, _serial: &str) -> Result<String, EnvironmentError> {
        push(&self.journal, "collect_logs");
        Ok("I/ActivityManager: Start proc com.example.app\n".to_string())
    }
}

/// Yields one frame, then stays pending like an idle encoder. Journals its drop.
struct ScriptedScreen {
    data: Vec<u8>,
    pos: usize,
    journal: Journal,
}

impl AsyncRead for ScriptedScreen {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos >= self.data.len() {
            return Poll::Pending;
        }
        let n = std::cmp::min(buf.remaining(), self.data.len() - self.pos);
        let start = self.pos;
        buf.put_slice(&self.data[start..start + n]);
        self.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl Drop for ScriptedScreen {
    fn drop(&mut self) {
        push(&self.journal, "screen_stream_closed");
    }
}

pub fn vm_spec() -> EnvironmentSpec {
    EnvironmentSpec::VirtualMachine(VirtualMachineSpec {
        identifier: "408e1874-759f-4417-9453-53ef21dc2ade".into(),
        snapshot: "snap-1".into(),
        hypervisor: PathBuf::from("/nonexistent/VBoxManage"),
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bridge_port: 5555,
        headless: true,
        timeout: Duration::from_secs(10),
    })
}

pub fn device_spec() -> EnvironmentSpec {
    EnvironmentSpec::PhysicalDevice(PhysicalDeviceSpec {
        bridge_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        bridge_port: 5555,
        serial: "emulator-5554".into(),
        timeout: Duration::from_secs(30),
    })
}

/// A port that was free a moment ago.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Generates a root CA inside `dir`.
pub fn test_ca(dir: &tempfile::TempDir) -> RootCertificate {
    let cert_path = dir.path().join("ca.pem");
    let key_path = dir.path().join("ca.key");
    if !cert_path.exists() {
        CertificateAuthority::generate("mirador test CA", &cert_path, &key_path).unwrap();
    }
    RootCertificate {
        identifier: "0026aabb.0".into(),
        cert_path,
        key_path,
    }
}

pub fn proxy_config(
    port: u16,
    root_certificate: RootCertificate,
    upstream: Option<UpstreamProxyConfig>,
) -> ProxyConfig {
    ProxyConfig {
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        listen_port: port,
        root_certificate,
        upstream,
        drain_grace: Duration::from_millis(500),
        release_barrier: Duration::from_secs(2),
        passthrough_hosts: Vec::new(),
    }
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
