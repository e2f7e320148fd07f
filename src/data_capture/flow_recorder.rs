use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::trace;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use uuid::Uuid;

use super::types::{CapturedFlow, Direction};
use crate::error_handling::types::CaptureError;

const HTTP_METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE", "CONNECT",
];

#[derive(Debug, Default)]
struct FlowBuffers {
    request: Vec<u8>,
    response: Vec<u8>,
    chunks: Vec<(DateTime<Utc>, Direction, usize)>,
    operation: Option<String>,
}

/// Records one proxied connection while relaying it.
///
/// Both directions are copied by their own task; every chunk is appended to the
/// matching buffer with its timestamp. EOF on one side shuts down the opposite
/// writer so the peer task terminates.
#[derive(Debug)]
pub struct FlowRecorder {
    id: Uuid,
    session_id: Uuid,
    host: String,
    port: u16,
    tls_intercepted: bool,
    started_at: DateTime<Utc>,
    buffers: Mutex<FlowBuffers>,
}

impl FlowRecorder {
    /// `operation` is left `None` when it must be read from the first request.
    pub fn new(
        session_id: Uuid,
        host: &str,
        port: u16,
        operation: Option<String>,
        tls_intercepted: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            host: host.to_string(),
            port,
            tls_intercepted,
            started_at: Utc::now(),
            buffers: Mutex::new(FlowBuffers {
                operation,
                ..FlowBuffers::default()
            }),
        }
    }

    fn buffers(&self) -> MutexGuard<'_, FlowBuffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends bytes that were forwarded outside of [`relay_and_record`](Self::relay_and_record).
    pub fn record(&self, direction: Direction, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut buffers = self.buffers();
        match direction {
            Direction::EnvironmentToRemote => {
                if buffers.operation.is_none() {
                    buffers.operation = detect_method(data);
                }
                buffers.request.extend_from_slice(data);
            }
            Direction::RemoteToEnvironment => buffers.response.extend_from_slice(data),
        }
        buffers.chunks.push((Utc::now(), direction, data.len()));
        drop(buffers);

        let n = data.len();
        let preview = &data[..std::cmp::min(n, 64)];
        trace!(
            "[{}] {}:{} {:?} {} bytes: {}{}",
            self.session_id,
            self.host,
            self.port,
            direction,
            n,
            String::from_utf8_lossy(preview),
            if n > 64 { " ..." } else { "" }
        );
    }

    /// Relays `client` <-> `origin` until both sides finish.
    ///
    /// Returns [`CaptureError::ForceClosed`] as soon as `force_close` turns true;
    /// the remaining copy task is aborted.
    pub async fn relay_and_record<C, S>(
        self: Arc<Self>,
        client: C,
        origin: S,
        force_close: watch::Receiver<bool>,
    ) -> Result<(), CaptureError>
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (origin_read, origin_write) = tokio::io::split(origin);

        trace!("[{}] relay to {}:{} started", self.session_id, self.host, self.port);

        let mut set = JoinSet::new();
        set.spawn(Arc::clone(&self).pump(
            client_read,
            origin_write,
            Direction::EnvironmentToRemote,
            force_close.clone(),
        ));
        set.spawn(Arc::clone(&self).pump(
            origin_read,
            client_write,
            Direction::RemoteToEnvironment,
            force_close,
        ));

        while let Some(res) = set.join_next().await {
            res.map_err(|e| CaptureError::TcpStreamError(io::Error::new(io::ErrorKind::Other, e)))??;
        }

        trace!("[{}] relay to {}:{} completed", self.session_id, self.host, self.port);
        Ok(())
    }

    async fn pump<R, W>(
        self: Arc<Self>,
        mut reader: R,
        mut writer: W,
        direction: Direction,
        mut force_close: watch::Receiver<bool>,
    ) -> Result<(), CaptureError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = tokio::select! {
                biased;
                _ = async { let _ = force_close.wait_for(|closed| *closed).await; } => {
                    return Err(CaptureError::ForceClosed);
                }
                read = reader.read(&mut buf) => read.map_err(CaptureError::TcpStreamError)?,
            };
            if n == 0 {
                trace!("[{}] {:?} EOF; shutting down peer writer", self.session_id, direction);
                let _ = writer.shutdown().await;
                return Ok(());
            }
            // Accepted bytes are recorded even if the peer never takes them.
            self.record(direction, &buf[..n]);
            tokio::select! {
                biased;
                _ = async { let _ = force_close.wait_for(|closed| *closed).await; } => {
                    return Err(CaptureError::ForceClosed);
                }
                written = writer.write_all(&buf[..n]) => written.map_err(CaptureError::TcpStreamError)?,
            }
        }
    }

    /// Number of bytes recorded so far in both directions.
    pub fn recorded_bytes(&self) -> usize {
        let buffers = self.buffers();
        buffers.request.len() + buffers.response.len()
    }

    /// Snapshot of the flow as it stands.
    pub fn finish(&self, truncated: bool) -> CapturedFlow {
        let buffers = self.buffers();
        let direction = buffers
            .chunks
            .first()
            .map(|(_, d, _)| *d)
            .unwrap_or(Direction::EnvironmentToRemote);
        CapturedFlow {
            id: self.id,
            session_id: self.session_id,
            timestamp: self.started_at,
            completed_at: Utc::now(),
            direction,
            host: self.host.clone(),
            port: self.port,
            operation: buffers
                .operation
                .clone()
                .unwrap_or_else(|| "CONNECT".to_string()),
            request_bytes: buffers.request.clone(),
            response_bytes: buffers.response.clone(),
            chunks: buffers.chunks.clone(),
            tls_intercepted: self.tls_intercepted,
            truncated,
        }
    }
}

/// HTTP method of a request line, if `data` starts with one.
pub fn detect_method(data: &[u8]) -> Option<String> {
    let end = data.iter().position(|b| *b == b' ')?;
    let token = std::str::from_utf8(&data[..end]).ok()?;
    HTTP_METHODS
        .iter()
        .find(|m| **m == token)
        .map(|m| m.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn detects_method_from_request_line() {
        assert_eq!(detect_method(b"POST /login HTTP/1.1\r\n"), Some("POST".into()));
        assert_eq!(detect_method(b"\x16\x03\x01 garbage"), None);
        assert_eq!(detect_method(b"get / HTTP/1.1"), None);
    }

    #[tokio::test]
    async fn relays_and_records_both_directions() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (origin, mut origin_peer) = tokio::io::duplex(1024);
        let (_force_tx, force_rx) = watch::channel(false);

        let recorder = Arc::new(FlowRecorder::new(Uuid::new_v4(), "api.test", 80, None, false));
        let relay = tokio::spawn(Arc::clone(&recorder).relay_and_record(client, origin, force_rx));

        client_peer.write_all(b"GET /ping HTTP/1.1\r\n\r\n").await.unwrap();
        let mut req = vec![0u8; 22];
        origin_peer.read_exact(&mut req).await.unwrap();
        origin_peer.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.unwrap();
        drop(origin_peer);
        let mut resp = Vec::new();
        client_peer.read_to_end(&mut resp).await.unwrap();
        drop(client_peer);

        relay.await.unwrap().unwrap();
        let flow = recorder.finish(false);
        assert_eq!(flow.operation, "GET");
        assert_eq!(flow.request_bytes, b"GET /ping HTTP/1.1\r\n\r\n");
        assert_eq!(flow.response_bytes, b"HTTP/1.1 200 OK\r\n\r\n");
        assert_eq!(flow.direction, Direction::EnvironmentToRemote);
        assert_eq!(flow.chunks.len(), 2);
        assert!(!flow.truncated);
    }

    #[tokio::test]
    async fn force_close_interrupts_open_relay() {
        let (client, mut client_peer) = tokio::io::duplex(1024);
        let (origin, _origin_peer) = tokio::io::duplex(1024);
        let (force_tx, force_rx) = watch::channel(false);

        let recorder = Arc::new(FlowRecorder::new(
            Uuid::new_v4(),
            "slow.test",
            443,
            Some("CONNECT".into()),
            false,
        ));
        let relay = tokio::spawn(Arc::clone(&recorder).relay_and_record(client, origin, force_rx));
        client_peer.write_all(b"partial").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        force_tx.send(true).unwrap();
        let res = tokio::time::timeout(Duration::from_secs(2), relay)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(CaptureError::ForceClosed)));
        let flow = recorder.finish(true);
        assert!(flow.truncated);
        assert_eq!(flow.request_bytes, b"partial");
    }
}
