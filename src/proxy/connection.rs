//! Per-connection handling: CONNECT tunnels (intercepted or opaque) and
//! absolute-form plain HTTP requests.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;
use uuid::Uuid;

use super::certificate_authority::CertificateAuthority;
use super::types::ProxyConfig;
use super::upstream::UpstreamConnector;
use crate::data_capture::{CapturedFlow, Direction, FlowRecorder};
use crate::error_handling::types::{CaptureError, ProxyError};

const MAX_REQUEST_HEAD: usize = 64 * 1024;
const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Everything a connection task needs; shared by all tasks of one listener.
pub(crate) struct ConnectionContext {
    pub session_id: Uuid,
    pub config: Arc<ProxyConfig>,
    pub authority: CertificateAuthority,
    pub upstream: UpstreamConnector,
    pub flows: mpsc::UnboundedSender<CapturedFlow>,
    pub force_close: watch::Receiver<bool>,
}

impl ConnectionContext {
    fn commit(&self, flow: CapturedFlow) {
        if self.flows.send(flow).is_err() {
            warn!("[{}] flow collector gone, flow dropped", self.session_id);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn parse(raw: &[u8]) -> Result<Self, ProxyError> {
        let text = std::str::from_utf8(raw)
            .map_err(|_| ProxyError::ProtocolError("request head is not UTF-8".to_string()))?;
        let mut lines = text.split("\r\n");
        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let (method, target, version) = match (parts.next(), parts.next(), parts.next()) {
            (Some(m), Some(t), Some(v)) => (m.to_string(), t.to_string(), v.to_string()),
            _ => {
                return Err(ProxyError::ProtocolError(format!(
                    "malformed request line: {:?}",
                    request_line
                )))
            }
        };
        let headers = lines
            .take_while(|l| !l.is_empty())
            .filter_map(|l| {
                l.split_once(':')
                    .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            })
            .collect();
        Ok(Self {
            method,
            target,
            version,
            headers,
        })
    }

    /// Re-serialises the head in origin form for a direct request to the origin.
    fn to_origin_form(&self, path: &str) -> Vec<u8> {
        let mut out = format!("{} {} {}\r\n", self.method, path, self.version);
        for (name, value) in &self.headers {
            let lowered = name.to_ascii_lowercase();
            if lowered == "proxy-connection" || lowered == "proxy-authorization" || lowered == "connection" {
                continue;
            }
            out.push_str(&format!("{}: {}\r\n", name, value));
        }
        out.push_str("Connection: close\r\n\r\n");
        out.into_bytes()
    }
}

/// Splits `host:port` (or `[v6]:port`), falling back to `default_port`.
pub(crate) fn split_authority(authority: &str, default_port: u16) -> Result<(String, u16), ProxyError> {
    let bad = || ProxyError::ProtocolError(format!("bad authority {:?}", authority));
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(bad)?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().map_err(|_| bad())?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => Ok((host.to_string(), port.parse().map_err(|_| bad())?)),
        Some(_) => Err(bad()),
        None if !authority.is_empty() => Ok((authority.to_string(), default_port)),
        None => Err(bad()),
    }
}

/// Splits an absolute `http://host[:port]/path` target.
pub(crate) fn split_absolute_url(target: &str) -> Result<(String, u16, String), ProxyError> {
    let rest = target.strip_prefix("http://").ok_or_else(|| {
        ProxyError::ProtocolError(format!("not an absolute http URL: {:?}", target))
    })?;
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, "/"),
    };
    let (host, port) = split_authority(authority, 80)?;
    Ok((host, port, path.to_string()))
}

/// Resolves `fut` unless `force_close` fires first.
async fn until_forced<F: Future>(fut: F, force_close: &mut watch::Receiver<bool>) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = async { let _ = force_close.wait_for(|closed| *closed).await; } => None,
        out = fut => Some(out),
    }
}

/// Reads into `buf` up to and including the blank line ending the request head,
/// leaving the head in `buf` and returning any bytes read past it. Whatever was
/// read stays in `buf` if the read is abandoned.
async fn read_head(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<Vec<u8>, ProxyError> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(end) = find_head_end(buf) {
            return Ok(buf.split_off(end));
        }
        if buf.len() > MAX_REQUEST_HEAD {
            return Err(ProxyError::ProtocolError("request head too large".to_string()));
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(ProxyError::ProtocolError(
                "client closed before sending a request".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Destination of a possibly incomplete request head, when its request line is whole.
fn partial_destination(buf: &[u8]) -> Option<(String, u16)> {
    let line_end = buf.windows(2).position(|w| w == b"\r\n")?;
    let line = std::str::from_utf8(&buf[..line_end]).ok()?;
    let mut parts = line.split_whitespace();
    let (method, target) = (parts.next()?, parts.next()?);
    if method.eq_ignore_ascii_case("CONNECT") {
        split_authority(target, 443).ok()
    } else {
        split_absolute_url(target).ok().map(|(host, port, _)| (host, port))
    }
}

/// Commits the bytes of a request head that was cut off by force-close.
fn commit_partial_head(ctx: &ConnectionContext, buf: &[u8]) {
    if buf.is_empty() {
        return;
    }
    let (host, port) = partial_destination(buf).unwrap_or_default();
    let recorder = FlowRecorder::new(ctx.session_id, &host, port, None, false);
    recorder.record(Direction::EnvironmentToRemote, buf);
    warn!(
        "[{}] request head force-closed after {} bytes",
        ctx.session_id,
        buf.len()
    );
    ctx.commit(recorder.finish(true));
}

/// Commits an accepted tunnel that ended before any payload was relayed.
fn commit_empty_tunnel(ctx: &ConnectionContext, host: &str, port: u16, truncated: bool) {
    let recorder = FlowRecorder::new(ctx.session_id, host, port, Some("CONNECT".to_string()), false);
    ctx.commit(recorder.finish(truncated));
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Connection task entry point. Errors are logged, never propagated.
pub(crate) async fn handle_connection(ctx: Arc<ConnectionContext>, client: TcpStream, peer: SocketAddr) {
    debug!("[{}] connection from {}", ctx.session_id, peer);
    if let Err(e) = serve(&ctx, client).await {
        debug!("[{}] connection from {} ended: {}", ctx.session_id, peer, e);
    }
}

async fn serve(ctx: &ConnectionContext, mut client: TcpStream) -> Result<(), ProxyError> {
    let mut force = ctx.force_close.clone();
    let mut head = Vec::with_capacity(4096);
    let rest = match until_forced(read_head(&mut client, &mut head), &mut force).await {
        Some(read) => read?,
        None => {
            commit_partial_head(ctx, &head);
            return Ok(());
        }
    };
    let request = match RequestHead::parse(&head) {
        Ok(r) => r,
        Err(e) => {
            let _ = client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            return Err(e);
        }
    };

    if request.method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_authority(&request.target, 443)?;
        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        tunnel(ctx, client, host, port, rest, force).await
    } else {
        forward_plain(ctx, client, request, rest, force).await
    }
}

async fn tunnel(
    ctx: &ConnectionContext,
    client: TcpStream,
    host: String,
    port: u16,
    pipelined: Vec<u8>,
    mut force: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let mut intercept = pipelined.is_empty() && !ctx.config.is_passthrough(&host);
    if intercept {
        let mut first = [0u8; 1];
        match until_forced(client.peek(&mut first), &mut force).await {
            Some(Ok(n)) if n > 0 => intercept = first[0] == TLS_HANDSHAKE_RECORD,
            Some(_) => {
                commit_empty_tunnel(ctx, &host, port, false);
                return Ok(());
            }
            None => {
                commit_empty_tunnel(ctx, &host, port, true);
                return Ok(());
            }
        }
    }

    let server_config = if intercept {
        match ctx.authority.server_config(&host) {
            Ok(cfg) => Some(cfg),
            Err(e) => {
                warn!("[{}] {} cannot be certified, tunnelling opaque: {}", ctx.session_id, host, e);
                None
            }
        }
    } else {
        None
    };

    match server_config {
        Some(cfg) => intercept_tls(ctx, client, &host, port, cfg, force).await,
        None => passthrough(ctx, client, &host, port, pipelined, force).await,
    }
}

async fn passthrough(
    ctx: &ConnectionContext,
    client: TcpStream,
    host: &str,
    port: u16,
    pipelined: Vec<u8>,
    mut force: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    debug!("[{}] opaque tunnel to {}:{}", ctx.session_id, host, port);
    let recorder = Arc::new(FlowRecorder::new(
        ctx.session_id,
        host,
        port,
        Some("CONNECT".to_string()),
        false,
    ));
    recorder.record(Direction::EnvironmentToRemote, &pipelined);
    let mut origin = match until_forced(ctx.upstream.connect(host, port), &mut force).await {
        Some(Ok(origin)) => origin,
        Some(Err(e)) => {
            ctx.commit(recorder.finish(false));
            return Err(e);
        }
        None => {
            ctx.commit(recorder.finish(true));
            return Ok(());
        }
    };
    if !pipelined.is_empty() {
        origin.write_all(&pipelined).await?;
    }
    relay(ctx, recorder, client, origin, force).await;
    Ok(())
}

async fn intercept_tls(
    ctx: &ConnectionContext,
    client: TcpStream,
    host: &str,
    port: u16,
    server_config: Arc<rustls::ServerConfig>,
    mut force: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let acceptor = TlsAcceptor::from(server_config);
    let client_tls = match until_forced(acceptor.accept(client), &mut force).await {
        Some(Ok(tls)) => tls,
        Some(Err(e)) => {
            // Usually certificate pinning or a client that does not trust the root CA.
            warn!("[{}] client refused interception for {}: {}", ctx.session_id, host, e);
            commit_empty_tunnel(ctx, host, port, false);
            return Ok(());
        }
        None => {
            warn!("[{}] TLS handshake for {} force-closed", ctx.session_id, host);
            commit_empty_tunnel(ctx, host, port, true);
            return Ok(());
        }
    };

    let recorder = Arc::new(FlowRecorder::new(ctx.session_id, host, port, None, true));
    let origin = match until_forced(ctx.upstream.connect_tls(host, port), &mut force).await {
        Some(Ok(origin)) => origin,
        Some(Err(e)) => {
            warn!("[{}] origin {}:{} unavailable: {}", ctx.session_id, host, port, e);
            ctx.commit(recorder.finish(false));
            return Err(e);
        }
        None => {
            ctx.commit(recorder.finish(true));
            return Ok(());
        }
    };
    info!("[{}] intercepting TLS to {}:{}", ctx.session_id, host, port);
    relay(ctx, recorder, client_tls, origin, force).await;
    Ok(())
}

async fn forward_plain(
    ctx: &ConnectionContext,
    mut client: TcpStream,
    request: RequestHead,
    rest: Vec<u8>,
    mut force: watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let (host, port, path) = match split_absolute_url(&request.target) {
        Ok(parts) => parts,
        Err(e) => {
            let _ = client.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            return Err(e);
        }
    };
    debug!("[{}] {} http://{}:{}{}", ctx.session_id, request.method, host, port, path);

    let recorder = Arc::new(FlowRecorder::new(
        ctx.session_id,
        &host,
        port,
        Some(request.method.to_ascii_uppercase()),
        false,
    ));
    let mut outgoing = request.to_origin_form(&path);
    outgoing.extend_from_slice(&rest);
    recorder.record(Direction::EnvironmentToRemote, &outgoing);
    let mut origin = match until_forced(ctx.upstream.connect(&host, port), &mut force).await {
        Some(Ok(origin)) => origin,
        Some(Err(e)) => {
            let _ = client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await;
            ctx.commit(recorder.finish(false));
            return Err(e);
        }
        None => {
            ctx.commit(recorder.finish(true));
            return Ok(());
        }
    };

    origin.write_all(&outgoing).await?;
    relay(ctx, recorder, client, origin, force).await;
    Ok(())
}

/// Relays until done and commits the flow, marking it truncated when forced.
async fn relay<C, S>(
    ctx: &ConnectionContext,
    recorder: Arc<FlowRecorder>,
    client: C,
    origin: S,
    force: watch::Receiver<bool>,
) where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + 'static,
{
    let truncated = match Arc::clone(&recorder).relay_and_record(client, origin, force).await {
        Ok(()) => false,
        Err(CaptureError::ForceClosed) => {
            warn!(
                "[{}] flow force-closed with {} bytes recorded",
                ctx.session_id,
                recorder.recorded_bytes()
            );
            true
        }
        Err(e) => {
            debug!("[{}] relay ended with error: {}", ctx.session_id, e);
            false
        }
    };
    ctx.commit(recorder.finish(truncated));
}
