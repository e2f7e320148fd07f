//! Outbound connections: direct, or chained through the operator's upstream proxy.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose;
use base64::Engine as _;
use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::certificate_authority::crypto_provider;
use super::types::{UpstreamProxyConfig, UpstreamScheme};
use crate::error_handling::types::ProxyError;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Boxed outbound stream (plain TCP, or TLS to the upstream proxy).
pub type OutboundStream = Box<dyn ByteStream>;

/// Opens connections to origins on behalf of intercepted clients.
pub struct UpstreamConnector {
    upstream: Option<UpstreamProxyConfig>,
    tls: TlsConnector,
}

impl UpstreamConnector {
    pub fn new(upstream: Option<UpstreamProxyConfig>) -> Result<Self, ProxyError> {
        let verify = upstream.as_ref().map(|u| u.verify_tls).unwrap_or(true);
        let provider = crypto_provider();
        let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let mut config = if verify {
            let mut roots = RootCertStore::empty();
            let native = rustls_native_certs::load_native_certs();
            for e in &native.errors {
                debug!("Skipping native certificate source: {}", e);
            }
            let (added, ignored) = roots.add_parsable_certificates(native.certs);
            debug!("Loaded {} native root certificates ({} ignored)", added, ignored);
            builder.with_root_certificates(roots).with_no_client_auth()
        } else {
            warn!("Upstream TLS certificate validation is disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate(provider)))
                .with_no_client_auth()
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            upstream,
            tls: TlsConnector::from(Arc::new(config)),
        })
    }

    /// Opens a byte stream to `host:port`.
    pub async fn connect(&self, host: &str, port: u16) -> Result<OutboundStream, ProxyError> {
        let Some(upstream) = &self.upstream else {
            debug!("Connecting direct to {}:{}", host, port);
            let tcp = tcp_connect(host, port).await?;
            return Ok(Box::new(tcp));
        };

        debug!(
            "Connecting to {}:{} via upstream {}:{}",
            host, port, upstream.ip, upstream.port
        );
        let tcp = tcp_connect(&upstream.ip.to_string(), upstream.port).await?;
        let stream: OutboundStream = match upstream.scheme {
            UpstreamScheme::Http => Box::new(tcp),
            UpstreamScheme::Https => {
                let tls = self
                    .tls
                    .connect(ServerName::from(upstream.ip), tcp)
                    .await
                    .map_err(|e| ProxyError::UpstreamError(format!("TLS to upstream: {}", e)))?;
                Box::new(tls)
            }
        };
        establish_tunnel(stream, host, port, upstream).await
    }

    /// Opens a TLS connection to the origin `host:port`.
    pub async fn connect_tls(
        &self,
        host: &str,
        port: u16,
    ) -> Result<TlsStream<OutboundStream>, ProxyError> {
        let name = ServerName::try_from(host.to_string())
            .map_err(|e| ProxyError::TlsError(format!("invalid server name {}: {}", host, e)))?;
        let stream = self.connect(host, port).await?;
        self.tls
            .connect(name, stream)
            .await
            .map_err(|e| ProxyError::TlsError(format!("handshake with {}: {}", host, e)))
    }
}

async fn tcp_connect(host: &str, port: u16) -> Result<TcpStream, ProxyError> {
    match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(ProxyError::UpstreamError(format!(
            "connect {}:{}: {}",
            host, port, e
        ))),
        Err(_) => Err(ProxyError::UpstreamError(format!(
            "connect {}:{} timed out",
            host, port
        ))),
    }
}

/// Sends `CONNECT host:port` to the upstream proxy and waits for a 2xx answer.
async fn establish_tunnel(
    mut stream: OutboundStream,
    host: &str,
    port: u16,
    upstream: &UpstreamProxyConfig,
) -> Result<OutboundStream, ProxyError> {
    let auth_header = match &upstream.credentials {
        Some(creds) => {
            let token = general_purpose::STANDARD
                .encode(format!("{}:{}", creds.username, creds.password));
            format!("Proxy-Authorization: Basic {}\r\n", token)
        }
        None => String::new(),
    };
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n{auth}Proxy-Connection: Keep-Alive\r\n\r\n",
        host = host,
        port = port,
        auth = auth_header
    );
    stream.write_all(request.as_bytes()).await?;

    // Read byte-wise up to the end of the head so no tunnelled bytes are consumed.
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(ProxyError::UpstreamError(
                "oversized CONNECT response from upstream".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(ProxyError::UpstreamError(
                "upstream proxy closed during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let status_line = String::from_utf8_lossy(&head);
    let status_line = status_line.lines().next().unwrap_or("");
    let status = status_line.split_whitespace().nth(1).unwrap_or("");
    if !status.starts_with('2') {
        return Err(ProxyError::UpstreamError(format!(
            "upstream proxy CONNECT failed: {}",
            status_line
        )));
    }
    Ok(stream)
}

/// Certificate verifier used when `verify_tls` is off. Signatures are still
/// checked so the handshake itself stays sound.
#[derive(Debug)]
struct AcceptAnyCertificate(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
