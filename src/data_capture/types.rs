//! Flow model shared by the proxy and the session report.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Direction of proxied bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Bytes sent by the app under test towards the remote host.
    EnvironmentToRemote,
    /// Bytes returned by the remote host to the app.
    RemoteToEnvironment,
}

/// One proxied connection (or one intercepted TLS tunnel) as seen by the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapturedFlow {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Capture start; the traffic log is ordered by this field.
    pub timestamp: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Direction of the first recorded chunk.
    pub direction: Direction,
    pub host: String,
    pub port: u16,
    /// HTTP method of the first request, or `CONNECT` for opaque tunnels.
    pub operation: String,
    pub request_bytes: Vec<u8>,
    pub response_bytes: Vec<u8>,
    /// Timestamped sizes of every relayed chunk
    pub chunks: Vec<(DateTime<Utc>, Direction, usize)>,
    pub tls_intercepted: bool,
    /// Set when the flow was force-closed while draining.
    pub truncated: bool,
}

impl CapturedFlow {
    pub fn total_bytes(&self) -> usize {
        self.request_bytes.len() + self.response_bytes.len()
    }
}
