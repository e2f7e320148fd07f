use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A running relay. Consumed by [`ScreenRelay::detach`](super::ScreenRelay::detach).
pub struct StreamHandle {
    pub serial: String,
    pub target: SocketAddr,
    pub attached_at: DateTime<Utc>,
    pub(crate) stop: watch::Sender<bool>,
    pub(crate) task: JoinHandle<io::Result<u64>>,
    pub(crate) relayed: Arc<AtomicU64>,
}

impl StreamHandle {
    /// Bytes forwarded to the sink so far.
    pub fn relayed_bytes(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }

    /// True once the source or the sink went away on its own.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("serial", &self.serial)
            .field("target", &self.target)
            .field("attached_at", &self.attached_at)
            .field("relayed", &self.relayed_bytes())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RelayStats {
    pub target: SocketAddr,
    pub bytes_relayed: u64,
    pub duration_ms: u64,
    /// The stream ended before detach was requested.
    pub ended_early: bool,
}
