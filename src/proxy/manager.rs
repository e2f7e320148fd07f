use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use super::certificate_authority::CertificateAuthority;
use super::connection::{handle_connection, ConnectionContext};
use super::port_registry::PortRegistry;
use super::types::{DrainReport, ListenerHandle, ProxyConfig};
use super::upstream::UpstreamConnector;
use crate::data_capture::{traffic_log, CapturedFlow, TrafficLogWriter};
use crate::error_handling::types::ProxyError;

/// Time force-closed connections get to commit their partial flows before abort.
const FORCE_CLOSE_WAIT: Duration = Duration::from_secs(1);
const BARRIER_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns every intercepting listener of the process.
///
/// `start` claims the listen port before binding and `stop` drops the claim only
/// after the release barrier saw the port free again.
pub struct ProxySessionManager {
    ports: Arc<PortRegistry>,
}

impl Default for ProxySessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxySessionManager {
    pub fn new() -> Self {
        Self {
            ports: Arc::new(PortRegistry::new()),
        }
    }

    /// Brings up the intercepting listener for `session_id`.
    pub async fn start(
        &self,
        session_id: Uuid,
        config: Arc<ProxyConfig>,
    ) -> Result<ListenerHandle, ProxyError> {
        let addr = config.listen_addr();
        self.ports.claim(addr.port(), session_id)?;

        match Self::bring_up(session_id, Arc::clone(&config), addr).await {
            Ok(handle) => {
                info!(
                    "[{}] intercepting proxy listening on {}",
                    session_id, handle.local_addr
                );
                Ok(handle)
            }
            Err(e) => {
                error!("[{}] proxy start on {} failed: {}", session_id, addr, e);
                self.ports.release(addr.port());
                Err(e)
            }
        }
    }

    async fn bring_up(
        session_id: Uuid,
        config: Arc<ProxyConfig>,
        addr: SocketAddr,
    ) -> Result<ListenerHandle, ProxyError> {
        let authority = CertificateAuthority::load(&config.root_certificate)?;
        let upstream = UpstreamConnector::new(config.upstream.clone())?;
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AddrInUse {
                ProxyError::PortInUse(addr.port())
            } else {
                ProxyError::BindError(e)
            }
        })?;
        let local_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (force_tx, force_rx) = watch::channel(false);
        let (flow_tx, flow_rx) = mpsc::unbounded_channel();
        let (writer, reader) = traffic_log();

        let ctx = Arc::new(ConnectionContext {
            session_id,
            config: Arc::clone(&config),
            authority,
            upstream,
            flows: flow_tx,
            force_close: force_rx,
        });

        let collector = tokio::spawn(collect_flows(session_id, flow_rx, writer));
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx));

        Ok(ListenerHandle {
            session_id,
            local_addr,
            config,
            shutdown: shutdown_tx,
            force_close: force_tx,
            accept_task,
            collector,
            traffic: reader,
        })
    }

    /// Stops accepting, drains in-flight connections, commits every flow and
    /// waits until the port can be bound again.
    pub async fn stop(&self, handle: ListenerHandle) -> Result<DrainReport, ProxyError> {
        let started = Instant::now();
        let session_id = handle.session_id;
        info!("[{}] stopping proxy on {}", session_id, handle.local_addr);

        let _ = handle.shutdown.send(true);
        let mut connections = match handle.accept_task.await {
            Ok(set) => set,
            Err(e) => {
                error!("[{}] accept loop panicked: {}", session_id, e);
                JoinSet::new()
            }
        };
        let in_flight = connections.len();
        debug!("[{}] listener closed, {} connection(s) in flight", session_id, in_flight);

        let drained = tokio::time::timeout(handle.config.drain_grace, join_all(&mut connections))
            .await
            .is_ok();
        if !drained {
            warn!(
                "[{}] drain grace of {:?} elapsed, force-closing {} connection(s)",
                session_id,
                handle.config.drain_grace,
                connections.len()
            );
            let _ = handle.force_close.send(true);
            if tokio::time::timeout(FORCE_CLOSE_WAIT, join_all(&mut connections))
                .await
                .is_err()
            {
                error!("[{}] connections ignored force-close, aborting", session_id);
                connections.abort_all();
                join_all(&mut connections).await;
            }
        }

        if let Err(e) = handle.collector.await {
            error!("[{}] flow collector panicked: {}", session_id, e);
        }
        let flows = handle.traffic.snapshot().await;

        self.settle_port(handle.config.listen_addr(), handle.config.release_barrier)
            .await?;

        let report = DrainReport {
            in_flight,
            truncated_flows: flows.iter().filter(|f| f.truncated).count(),
            flows_committed: flows.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            "[{}] proxy stopped: {} flow(s), {} truncated, {} ms",
            session_id, report.flows_committed, report.truncated_flows, report.elapsed_ms
        );
        if !drained {
            return Err(ProxyError::DrainTimeout(report));
        }
        Ok(report)
    }

    /// Drops the claim on `addr`'s port once the release barrier passed.
    /// A port that never frees up stays claimed.
    async fn settle_port(&self, addr: SocketAddr, limit: Duration) -> Result<(), ProxyError> {
        if !release_barrier(addr, limit).await {
            error!(
                "Port {} still held after {:?}, keeping it claimed",
                addr.port(),
                limit
            );
            return Err(ProxyError::ListenerLeak(addr.port()));
        }
        self.ports.release(addr.port());
        Ok(())
    }

    /// Ports currently held by a running (or draining) listener.
    pub fn active_ports(&self) -> Vec<u16> {
        self.ports.claimed()
    }
}

async fn join_all(set: &mut JoinSet<()>) {
    while set.join_next().await.is_some() {}
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(Arc::clone(&ctx), stream, peer));
                }
                Err(e) => {
                    warn!("[{}] accept failed: {}", ctx.session_id, e);
                    tokio::time::sleep(BARRIER_POLL_INTERVAL).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    debug!("[{}] accept loop exiting", ctx.session_id);
    drop(listener);
    connections
}

/// Single writer of the session's traffic log. Ends when every connection
/// (and the accept loop) dropped its sender.
async fn collect_flows(
    session_id: Uuid,
    mut flows: mpsc::UnboundedReceiver<CapturedFlow>,
    writer: TrafficLogWriter,
) {
    while let Some(flow) = flows.recv().await {
        writer.commit(flow).await;
    }
    debug!("[{}] flow collector finished", session_id);
}

/// Polls `addr` until a fresh socket can bind it or `limit` elapses.
async fn release_barrier(addr: SocketAddr, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        match try_bind(addr) {
            Ok(()) => return true,
            Err(e) => debug!("release barrier check on {}: {}", addr, e),
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(BARRIER_POLL_INTERVAL).await;
    }
}

fn try_bind(addr: SocketAddr) -> std::io::Result<()> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    // Some platforms accept a bare bind next to a live listener.
    let trial = socket.listen(1)?;
    drop(trial);
    Ok(())
}
