//! Device bridge (adb) access.
//!
//! Every environment, VM or physical, is driven over the same bridge once it is
//! reachable. [`AdbBridge`] shells out to the `adb` client; tests substitute a
//! fake implementation of [`DeviceBridge`].

use async_trait::async_trait;
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};

use super::tool::run_tool;
use crate::error_handling::types::EnvironmentError;

/// Raw screen stream read from the environment.
pub type ScreenStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Attaches the bridge to a network serial (`ip:port`). No-op for USB serials.
    async fn connect(&self, serial: &str) -> Result<(), EnvironmentError>;

    /// Whether the environment answers on the bridge and is fully booted.
    async fn is_connected(&self, serial: &str) -> bool;

    async fn push_file(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), EnvironmentError>;

    async fn shell(&self, serial: &str, args: &[&str]) -> Result<String, EnvironmentError>;

    /// Points the environment's global HTTP proxy at `proxy`.
    async fn set_global_proxy(
        &self,
        serial: &str,
        proxy: SocketAddr,
    ) -> Result<(), EnvironmentError>;

    async fn clear_global_proxy(&self, serial: &str) -> Result<(), EnvironmentError>;

    /// Starts the environment's screen encoder and returns its output stream.
    async fn open_screen_stream(&self, serial: &str) -> Result<ScreenStream, EnvironmentError>;

    /// Dumps the environment's system log.
    async fn collect_logs(&self, serial: &str) -> Result<String, EnvironmentError>;
}

pub struct AdbBridge {
    binary: PathBuf,
    command_timeout: Duration,
}

impl AdbBridge {
    pub fn new(binary: PathBuf, command_timeout: Duration) -> Self {
        Self {
            binary,
            command_timeout,
        }
    }

    async fn adb(&self, serial: &str, args: &[&str]) -> Result<String, EnvironmentError> {
        let mut full = vec!["-s", serial];
        full.extend_from_slice(args);
        run_tool(&self.binary, &full, self.command_timeout)
            .await
            .map_err(|e| EnvironmentError::BridgeError(e.to_string()))
    }
}

#[async_trait]
impl DeviceBridge for AdbBridge {
    async fn connect(&self, serial: &str) -> Result<(), EnvironmentError> {
        if !serial.contains(':') {
            return Ok(());
        }
        let out = run_tool(&self.binary, &["connect", serial], self.command_timeout)
            .await
            .map_err(|e| EnvironmentError::BridgeError(e.to_string()))?;
        // `adb connect` exits 0 on failure too.
        let lowered = out.to_lowercase();
        if lowered.contains("unable") || lowered.contains("failed") || lowered.contains("cannot") {
            return Err(EnvironmentError::BridgeError(out.trim().to_string()));
        }
        debug!("adb connect {}: {}", serial, out.trim());
        Ok(())
    }

    async fn is_connected(&self, serial: &str) -> bool {
        match self.adb(serial, &["get-state"]).await {
            Ok(state) if state.trim() == "device" => {}
            Ok(state) => {
                debug!("{} bridge state: {}", serial, state.trim());
                return false;
            }
            Err(e) => {
                debug!("{} not on bridge yet: {}", serial, e);
                return false;
            }
        }
        match self
            .adb(serial, &["shell", "getprop", "sys.boot_completed"])
            .await
        {
            Ok(v) => v.trim() == "1",
            Err(_) => false,
        }
    }

    async fn push_file(
        &self,
        serial: &str,
        local: &Path,
        remote: &str,
    ) -> Result<(), EnvironmentError> {
        let local = local.to_string_lossy();
        self.adb(serial, &["push", &local, remote]).await.map(|_| ())
    }

    async fn shell(&self, serial: &str, args: &[&str]) -> Result<String, EnvironmentError> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.adb(serial, &full).await
    }

    async fn set_global_proxy(
        &self,
        serial: &str,
        proxy: SocketAddr,
    ) -> Result<(), EnvironmentError> {
        info!("Setting global proxy on {} to {}", serial, proxy);
        let value = proxy.to_string();
        self.shell(serial, &["settings", "put", "global", "http_proxy", &value])
            .await
            .map(|_| ())
    }

    async fn clear_global_proxy(&self, serial: &str) -> Result<(), EnvironmentError> {
        info!("Clearing global proxy on {}", serial);
        self.shell(serial, &["settings", "put", "global", "http_proxy", ":0"])
            .await
            .map(|_| ())
    }

    async fn open_screen_stream(&self, serial: &str) -> Result<ScreenStream, EnvironmentError> {
        let mut child = Command::new(&self.binary)
            .args([
                "-s",
                serial,
                "exec-out",
                "screenrecord",
                "--output-format=h264",
                "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EnvironmentError::BridgeError(format!("screenrecord spawn: {}", e)))?;

        let stdout = child.stdout.take().ok_or_else(|| {
            EnvironmentError::BridgeError("screenrecord stdout not captured".to_string())
        })?;
        Ok(Box::new(ProcessStream { child, stdout }))
    }

    async fn collect_logs(&self, serial: &str) -> Result<String, EnvironmentError> {
        self.adb(serial, &["logcat", "-d"]).await
    }
}

/// Child process output that kills the process when dropped.
struct ProcessStream {
    child: Child,
    stdout: ChildStdout,
}

impl AsyncRead for ProcessStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl Drop for ProcessStream {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            warn!("Failed to stop screen encoder: {}", e);
        }
    }
}
