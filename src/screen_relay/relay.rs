use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

use super::types::{RelayStats, StreamHandle};
use crate::environment::device_bridge::DeviceBridge;
use crate::environment::types::EnvironmentHandle;
use crate::error_handling::types::ScreenError;

const SINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards the environment's screen capture stream to a local sink.
///
/// The relay only observes: nothing is ever written back to the environment, and a
/// failing relay never affects the session it belongs to.
pub struct ScreenRelay {
    bridge: Arc<dyn DeviceBridge>,
    detach_timeout: Duration,
}

impl ScreenRelay {
    pub fn new(bridge: Arc<dyn DeviceBridge>, detach_timeout: Duration) -> Self {
        Self {
            bridge,
            detach_timeout,
        }
    }

    /// Opens the screen stream of `handle` and starts copying it to `target_ip:target_port`.
    pub async fn attach(
        &self,
        handle: &EnvironmentHandle,
        target_ip: IpAddr,
        target_port: u16,
    ) -> Result<StreamHandle, ScreenError> {
        let target = SocketAddr::new(target_ip, target_port);
        let source = self
            .bridge
            .open_screen_stream(&handle.serial)
            .await
            .map_err(|e| ScreenError::StreamUnavailable(e.to_string()))?;

        let sink = match tokio::time::timeout(SINK_CONNECT_TIMEOUT, TcpStream::connect(target)).await
        {
            Ok(Ok(sink)) => sink,
            Ok(Err(e)) => {
                return Err(ScreenError::StreamUnavailable(format!(
                    "screen sink {}: {}",
                    target, e
                )))
            }
            Err(_) => {
                return Err(ScreenError::StreamUnavailable(format!(
                    "screen sink {} did not accept within {:?}",
                    target, SINK_CONNECT_TIMEOUT
                )))
            }
        };

        info!("Screen of {} relayed to {}", handle.identifier(), target);
        Ok(spawn_relay(handle.serial.clone(), target, source, sink))
    }

    /// Stops the relay, waiting at most the configured detach timeout.
    pub async fn detach(&self, mut stream: StreamHandle) -> Result<RelayStats, ScreenError> {
        let ended_early = stream.task.is_finished();
        let _ = stream.stop.send(true);

        let outcome = match tokio::time::timeout(self.detach_timeout, &mut stream.task).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!(
                    "Screen relay to {} did not stop within {:?}; aborting",
                    stream.target, self.detach_timeout
                );
                stream.task.abort();
                return Err(ScreenError::DetachTimeout(self.detach_timeout));
            }
        };

        let bytes_relayed = match outcome {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(ScreenError::RelayFailed(e)),
            Err(e) => {
                return Err(ScreenError::RelayFailed(io::Error::new(
                    io::ErrorKind::Other,
                    e,
                )))
            }
        };

        let duration_ms = (Utc::now() - stream.attached_at).num_milliseconds().max(0) as u64;
        debug!(
            "Screen relay to {} detached after {} bytes",
            stream.target, bytes_relayed
        );
        Ok(RelayStats {
            target: stream.target,
            bytes_relayed,
            duration_ms,
            ended_early,
        })
    }
}

pub(crate) fn spawn_relay<R, W>(serial: String, target: SocketAddr, source: R, sink: W) -> StreamHandle
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (stop, stop_rx) = watch::channel(false);
    let relayed = Arc::new(AtomicU64::new(0));
    let task = tokio::spawn(forward(source, sink, stop_rx, Arc::clone(&relayed)));
    StreamHandle {
        serial,
        target,
        attached_at: Utc::now(),
        stop,
        task,
        relayed,
    }
}

async fn forward<R, W>(
    mut source: R,
    mut sink: W,
    mut stop: watch::Receiver<bool>,
    relayed: Arc<AtomicU64>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = tokio::select! {
            biased;
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            read = source.read(&mut buf) => read?,
        };
        if n == 0 {
            trace!("screen source closed");
            break;
        }
        sink.write_all(&buf[..n]).await?;
        total += n as u64;
        relayed.fetch_add(n as u64, Ordering::Relaxed);
    }
    let _ = sink.shutdown().await;
    Ok(total)
}
